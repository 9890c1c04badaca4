use std::time::Instant;

use crate::domains::export::range::RangeResolver;
use crate::domains::export::repository::RecordSource;
use crate::domains::export::streamer::PageStreamer;
use crate::domains::export::transform::RecordTransform;
use crate::domains::export::types::{Job, JobCompletion, JobStatus, PageRange, TableConfig};
use crate::domains::export::writer::LineSink;
use crate::errors::{ExportError, ExportResult};

/// Partition of `[floor + 1, source_max]` into pages of `page_size` ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagePlan {
    floor: i64,
    source_max: i64,
    page_size: i64,
    page_count: u64,
}

impl PagePlan {
    pub fn new(floor: i64, source_max: i64, page_size: i64) -> ExportResult<Self> {
        if page_size <= 0 {
            return Err(ExportError::config(format!(
                "page size must be positive, got {}",
                page_size
            )));
        }
        if floor < 0 {
            return Err(ExportError::config(format!(
                "floor must not be negative, got {}",
                floor
            )));
        }

        // ceil((source_max - floor) / page_size); nothing to do at or below the floor
        let page_count = if source_max <= floor {
            0
        } else {
            let span = (source_max - floor) as u64;
            let size = page_size as u64;
            (span + size - 1) / size
        };

        Ok(Self {
            floor,
            source_max,
            page_size,
            page_count,
        })
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    pub fn is_empty(&self) -> bool {
        self.page_count == 0
    }

    pub fn source_max(&self) -> i64 {
        self.source_max
    }

    /// Pages in ascending order, computed lazily.
    pub fn pages(&self) -> Pages {
        Pages {
            lower: self.floor.saturating_add(1),
            source_max: self.source_max,
            page_size: self.page_size,
            remaining: self.page_count,
        }
    }
}

/// Iterator over the ranges of a `PagePlan`
#[derive(Debug, Clone)]
pub struct Pages {
    lower: i64,
    source_max: i64,
    page_size: i64,
    remaining: u64,
}

impl Iterator for Pages {
    type Item = PageRange;

    fn next(&mut self) -> Option<PageRange> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let upper = self
            .lower
            .saturating_add(self.page_size - 1)
            .min(self.source_max);
        let range = PageRange::new(self.lower, upper);
        self.lower = self.lower.saturating_add(self.page_size);
        Some(range)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        (remaining, usize::try_from(self.remaining).ok())
    }
}

/// Drives a job: resolves the range, then streams pages strictly one after
/// another into a single sink.
pub struct PageScheduler<'a, S: RecordSource + ?Sized> {
    source: &'a S,
}

impl<'a, S: RecordSource + ?Sized> PageScheduler<'a, S> {
    pub fn new(source: &'a S) -> Self {
        Self { source }
    }

    /// Run a job to completion. The first failing page aborts the job; pages
    /// committed before it stay in the sink.
    pub async fn run<K>(
        &self,
        config: &TableConfig,
        transform: &RecordTransform,
        floor: i64,
        sink: &mut K,
    ) -> ExportResult<JobCompletion>
    where
        K: LineSink + ?Sized,
    {
        let start = Instant::now();
        let table = config.table_name();
        let mut job = Job::new(table, floor);

        log::info!(
            "Starting export job {} for {} ({}, page size {}, floor {})",
            job.id,
            table,
            transform.name(),
            config.page_size(),
            floor
        );

        job.status = JobStatus::Resolving;
        let plan = match self.plan(config, floor).await {
            Ok(plan) => plan,
            Err(e) => {
                job.status = JobStatus::Failed;
                log::error!("Export job {} for {} failed before streaming: {}", job.id, table, e);
                return Err(e);
            }
        };
        job.planned(plan.source_max(), plan.page_count());

        let mut completion = JobCompletion {
            job_id: job.id,
            table: table.to_string(),
            source_max: plan.source_max(),
            floor,
            pages_planned: plan.page_count(),
            pages_processed: 0,
            records_written: 0,
            records_skipped: 0,
            bytes_written: 0,
            duration_ms: 0,
        };

        if plan.is_empty() {
            log::info!(
                "Nothing to export for {}: max id {} is not above floor {}",
                table,
                plan.source_max(),
                floor
            );
        } else {
            log::info!(
                "Exporting {} ids {}..={} in {} pages",
                table,
                floor + 1,
                plan.source_max(),
                plan.page_count()
            );
        }

        let streamer = PageStreamer::new(self.source, config, transform);
        for (index, range) in plan.pages().enumerate() {
            let page = index as u64 + 1;
            job.status = JobStatus::Streaming { page };

            match streamer.stream_page(range, sink).await {
                Ok(stats) => {
                    completion.pages_processed += 1;
                    completion.records_written += stats.records_written;
                    completion.records_skipped += stats.records_skipped;
                    completion.bytes_written += stats.bytes_written;
                }
                Err(e) => {
                    job.status = JobStatus::Failed;
                    log::error!(
                        "Export job {} for {} aborted on page {}/{} {}: {}",
                        job.id,
                        table,
                        page,
                        job.pages,
                        range,
                        e
                    );
                    return Err(e);
                }
            }
        }

        job.status = JobStatus::Completed;
        completion.duration_ms = start.elapsed().as_millis() as u64;
        log::info!(
            "Export job {} for {} completed: {} pages, {} records ({} skipped), {} bytes in {}ms",
            job.id,
            table,
            completion.pages_processed,
            completion.records_written,
            completion.records_skipped,
            completion.bytes_written,
            completion.duration_ms
        );
        Ok(completion)
    }

    async fn plan(&self, config: &TableConfig, floor: i64) -> ExportResult<PagePlan> {
        // Reject a bad floor before touching the database
        PagePlan::new(floor, floor, config.page_size())?;

        let source_max = RangeResolver::new(self.source)
            .resolve_max(config.table_name(), config.primary_key_column())
            .await?;
        PagePlan::new(floor, source_max, config.page_size())
    }
}
