use futures::stream::StreamExt;
use std::time::Instant;

use crate::domains::export::repository::RecordSource;
use crate::domains::export::transform::RecordTransform;
use crate::domains::export::types::{PageRange, PageStats, TableConfig};
use crate::domains::export::writer::LineSink;
use crate::errors::{ExportError, ExportResult};

/// Streams one page of a table through the record transform into the sink.
///
/// The row stream (and with it the pooled connection) lives only inside
/// `stream_page`; it is dropped before the page is committed and on every
/// error path.
pub struct PageStreamer<'a, S: RecordSource + ?Sized> {
    source: &'a S,
    config: &'a TableConfig,
    transform: &'a RecordTransform,
}

impl<'a, S: RecordSource + ?Sized> PageStreamer<'a, S> {
    pub fn new(source: &'a S, config: &'a TableConfig, transform: &'a RecordTransform) -> Self {
        Self {
            source,
            config,
            transform,
        }
    }

    /// Stream `range` and commit it. On failure the page's partial output is
    /// rolled back and a `Stream` error carrying table and range is returned.
    pub async fn stream_page<K>(&self, range: PageRange, sink: &mut K) -> ExportResult<PageStats>
    where
        K: LineSink + ?Sized,
    {
        let start = Instant::now();
        let table = self.config.table_name();
        log::info!("Streaming {} page {}", table, range);

        let mut stats = PageStats::new(range);
        let outcome = match self.pump(range, sink, &mut stats).await {
            Ok(()) => sink
                .commit()
                .await
                .map(|_| ())
                .map_err(|e| ExportError::stream(table, range, e)),
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            match sink.rollback().await {
                Ok(committed) => log::warn!(
                    "Rolled back partial page {} of {} ({} records discarded, {} bytes kept)",
                    range,
                    table,
                    stats.records_written,
                    committed
                ),
                Err(rollback_err) => log::error!(
                    "Rollback of page {} of {} failed: {}",
                    range,
                    table,
                    rollback_err
                ),
            }
            log::error!("Page {} of {} failed: {}", range, table, e);
            return Err(e);
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        log::info!(
            "Finished {} page {}: {} written, {} skipped, {} bytes in {}ms",
            table,
            range,
            stats.records_written,
            stats.records_skipped,
            stats.bytes_written,
            stats.duration_ms
        );
        Ok(stats)
    }

    async fn pump<K>(&self, range: PageRange, sink: &mut K, stats: &mut PageStats) -> ExportResult<()>
    where
        K: LineSink + ?Sized,
    {
        let table = self.config.table_name();
        let sql = self.config.query_for(range);
        let mut rows = self.source.fetch_page(&sql);

        while let Some(row) = rows.next().await {
            let record = row.map_err(|e| ExportError::stream(table, range, e))?;
            stats.records_read += 1;

            let line = self
                .transform
                .apply(record)
                .map_err(|e| ExportError::stream(table, range, e))?;

            match line {
                Some(line) => {
                    let len = line.len();
                    sink.write_line(line)
                        .await
                        .map_err(|e| ExportError::stream(table, range, e))?;
                    stats.records_written += 1;
                    stats.bytes_written += len;
                }
                None => {
                    stats.records_skipped += 1;
                    log::debug!(
                        "Skipped record {} of {} page {} ({})",
                        stats.records_read,
                        table,
                        range,
                        self.transform.name()
                    );
                }
            }
        }

        Ok(())
    }
}
