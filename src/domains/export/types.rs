use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::ExportResult;
use crate::validation::{validate_identifier, validate_positive, Validate};

/// One row as produced by a record source: column name to scalar value,
/// in the order the query selected them.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Inclusive primary-key bounds of one page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageRange {
    pub min: i64,
    pub max: i64,
}

impl PageRange {
    pub fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    /// Number of ids covered by the range.
    pub fn span(&self) -> i64 {
        self.max - self.min + 1
    }

    pub fn contains(&self, id: i64) -> bool {
        id >= self.min && id <= self.max
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// A transformed unit of output, already newline-terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine(String);

impl OutputLine {
    /// Wraps `text`, appending a trailing newline when it is missing.
    pub fn new(text: impl Into<String>) -> Self {
        let mut text = text.into();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        Self(text)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// Builds the full query text for one page from its inclusive bounds.
pub type QueryTemplate = Arc<dyn Fn(PageRange) -> String + Send + Sync>;

/// Everything a job needs to know about the table it exports.
/// Immutable for the lifetime of the job.
#[derive(Clone)]
pub struct TableConfig {
    table_name: String,
    primary_key_column: String,
    page_size: i64,
    query_template: QueryTemplate,
}

impl TableConfig {
    pub fn new<F>(
        table_name: impl Into<String>,
        primary_key_column: impl Into<String>,
        page_size: i64,
        query_template: F,
    ) -> ExportResult<Self>
    where
        F: Fn(PageRange) -> String + Send + Sync + 'static,
    {
        let config = Self {
            table_name: table_name.into(),
            primary_key_column: primary_key_column.into(),
            page_size,
            query_template: Arc::new(query_template),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn primary_key_column(&self) -> &str {
        &self.primary_key_column
    }

    pub fn page_size(&self) -> i64 {
        self.page_size
    }

    /// Same table and template with a different page size.
    pub fn with_page_size(&self, page_size: i64) -> ExportResult<Self> {
        let config = Self {
            page_size,
            ..self.clone()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn query_for(&self, range: PageRange) -> String {
        (self.query_template)(range)
    }
}

impl Validate for TableConfig {
    fn validate(&self) -> ExportResult<()> {
        validate_identifier("table", &self.table_name)?;
        validate_identifier("primary key column", &self.primary_key_column)?;
        validate_positive("page size", self.page_size)
    }
}

impl fmt::Debug for TableConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableConfig")
            .field("table_name", &self.table_name)
            .field("primary_key_column", &self.primary_key_column)
            .field("page_size", &self.page_size)
            .field("query_template", &"<QueryTemplate>")
            .finish()
    }
}

/// Counters for a single streamed page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageStats {
    pub range: PageRange,
    pub records_read: usize,
    pub records_written: usize,
    pub records_skipped: usize,
    pub bytes_written: usize,
    pub duration_ms: u64,
}

impl PageStats {
    pub fn new(range: PageRange) -> Self {
        Self {
            range,
            records_read: 0,
            records_written: 0,
            records_skipped: 0,
            bytes_written: 0,
            duration_ms: 0,
        }
    }
}

/// Returned when a job reaches a terminal success state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCompletion {
    pub job_id: Uuid,
    pub table: String,
    pub source_max: i64,
    pub floor: i64,
    pub pages_planned: u64,
    pub pages_processed: u64,
    pub records_written: usize,
    pub records_skipped: usize,
    pub bytes_written: usize,
    pub duration_ms: u64,
}

impl JobCompletion {
    pub fn is_empty(&self) -> bool {
        self.pages_processed == 0
    }
}

/// Lifecycle of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    Pending,
    Resolving,
    Streaming { page: u64 },
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// State of one export run, owned by the scheduler for its whole lifetime.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub table: String,
    pub floor: i64,
    pub source_max: Option<i64>,
    pub pages: u64,
    pub status: JobStatus,
}

impl Job {
    pub fn new(table: impl Into<String>, floor: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            table: table.into(),
            floor,
            source_max: None,
            pages: 0,
            status: JobStatus::Pending,
        }
    }

    /// Record the resolved bounds once the plan is known.
    pub fn planned(&mut self, source_max: i64, pages: u64) {
        self.source_max = Some(source_max);
        self.pages = pages;
    }
}
