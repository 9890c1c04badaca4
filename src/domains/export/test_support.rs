//! In-memory sources and sinks used by the export tests.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use std::sync::Mutex;

use crate::domains::export::repository::RecordSource;
use crate::domains::export::types::{OutputLine, PageRange, Record, TableConfig};
use crate::domains::export::writer::LineSink;
use crate::errors::{ExportError, ExportResult};

/// Template understood by `FakeSource`: the page bounds as `min:max`.
pub fn range_config(table: &str, page_size: i64) -> TableConfig {
    TableConfig::new(table, "id", page_size, |r: PageRange| format!("{}:{}", r.min, r.max)).unwrap()
}

/// Bounds of a `min:max` query or of the first `BETWEEN min AND max` in SQL.
fn parse_range(sql: &str) -> Option<PageRange> {
    if let Some((min, max)) = sql.split_once(':') {
        if let (Ok(min), Ok(max)) = (min.parse::<i64>(), max.parse::<i64>()) {
            return Some(PageRange::new(min, max));
        }
    }

    let (_, rest) = sql.split_once("BETWEEN ")?;
    let mut words = rest.split_whitespace();
    let min: i64 = words.next()?.parse().ok()?;
    if words.next()? != "AND" {
        return None;
    }
    let max: i64 = words.next()?.parse().ok()?;
    Some(PageRange::new(min, max))
}

/// Source with one row per id in `1..=max`. Can be told to break the cursor
/// of one page after a number of rows.
pub struct FakeSource {
    max: Option<i64>,
    fail_page: Option<(PageRange, usize)>,
    empty_ids: Vec<i64>,
    queries: Mutex<Vec<String>>,
}

impl FakeSource {
    pub fn with_max(max: Option<i64>) -> Self {
        Self {
            max,
            fail_page: None,
            empty_ids: Vec::new(),
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Fail `range` after `rows` rows have been emitted.
    pub fn failing_on(mut self, range: PageRange, rows: usize) -> Self {
        self.fail_page = Some((range, rows));
        self
    }

    /// Ids whose rows come back with no columns.
    pub fn with_empty_rows(mut self, ids: &[i64]) -> Self {
        self.empty_ids = ids.to_vec();
        self
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordSource for FakeSource {
    async fn max_id(&self, _table: &str, _pk_column: &str) -> ExportResult<Option<i64>> {
        Ok(self.max)
    }

    fn fetch_page<'a>(&'a self, sql: &'a str) -> BoxStream<'a, ExportResult<Record>> {
        self.queries.lock().unwrap().push(sql.to_string());

        let range = match parse_range(sql) {
            Some(range) => range,
            None => {
                let err = ExportError::Database(sqlx::Error::Protocol(format!("bad query {}", sql)));
                return stream::iter(vec![Err(err)]).boxed();
            }
        };

        let max = self.max.unwrap_or(0).min(range.max);
        let mut rows: Vec<ExportResult<Record>> = (range.min..=max)
            .map(|id| {
                if self.empty_ids.contains(&id) {
                    Ok(Record::new())
                } else {
                    Ok(row(id))
                }
            })
            .collect();

        if let Some((fail_range, after)) = self.fail_page {
            if fail_range == range {
                rows.truncate(after);
                rows.push(Err(ExportError::Database(sqlx::Error::Protocol(
                    "connection reset by peer".to_string(),
                ))));
            }
        }

        stream::iter(rows).boxed()
    }

    fn source_name(&self) -> &'static str {
        "fake"
    }
}

fn row(id: i64) -> Record {
    let value: Value = json!({
        "id": id,
        "short_url": format!("item-{}", id),
        "sitemap_date_published": 1_700_000_000i64 + id
    });
    value.as_object().cloned().unwrap_or_default()
}

/// Sink that keeps committed and pending lines in memory and records the
/// sequence of calls it received.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub committed: Vec<String>,
    pub pending: Vec<String>,
    pub events: Vec<String>,
    pub fail_writes_after: Option<usize>,
    writes: usize,
}

impl MemorySink {
    pub fn failing_after(writes: usize) -> Self {
        Self {
            fail_writes_after: Some(writes),
            ..Default::default()
        }
    }

    fn committed_len(&self) -> u64 {
        self.committed.iter().map(|l| l.len() as u64).sum()
    }
}

#[async_trait]
impl LineSink for MemorySink {
    async fn write_line(&mut self, line: OutputLine) -> ExportResult<()> {
        if let Some(limit) = self.fail_writes_after {
            if self.writes >= limit {
                return Err(ExportError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
        }
        self.writes += 1;
        self.events.push(format!("line {}", line.as_str().trim_end()));
        self.pending.push(line.into_string());
        Ok(())
    }

    async fn commit(&mut self) -> ExportResult<u64> {
        self.events.push("commit".to_string());
        self.committed.append(&mut self.pending);
        Ok(self.committed_len())
    }

    async fn rollback(&mut self) -> ExportResult<u64> {
        self.events.push("rollback".to_string());
        self.pending.clear();
        Ok(self.committed_len())
    }
}
