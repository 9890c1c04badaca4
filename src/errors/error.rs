use thiserror::Error;

use crate::domains::export::types::PageRange;

/// Errors raised while exporting a table
#[derive(Debug, Error)]
pub enum ExportError {
    /// Unsupported table or entity type, missing argument, invalid identifier or setting.
    /// Always raised before the first page is streamed.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The maximum primary key could not be determined
    #[error("Range resolution failed for {table}.{column}: {message}")]
    RangeResolution {
        table: String,
        column: String,
        message: String,
    },

    /// Cursor or write failure while a page was in flight
    #[error("Stream failed for table {table} on page {range}: {message}")]
    Stream {
        table: String,
        range: PageRange,
        message: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Sink closed: {0}")]
    SinkClosed(String),
}

impl ExportError {
    pub fn config(message: impl Into<String>) -> Self {
        ExportError::Configuration(message.into())
    }

    /// Wrap any failure that happened while `range` of `table` was streaming.
    pub fn stream(table: &str, range: PageRange, cause: impl std::fmt::Display) -> Self {
        ExportError::Stream {
            table: table.to_string(),
            range,
            message: cause.to_string(),
        }
    }

    /// True for errors that abort a job before any page has been written.
    pub fn is_fatal_before_streaming(&self) -> bool {
        matches!(
            self,
            ExportError::Configuration(_) | ExportError::RangeResolution { .. }
        )
    }

    /// The page that was in flight when the error happened, if any.
    pub fn page_range(&self) -> Option<PageRange> {
        match self {
            ExportError::Stream { range, .. } => Some(*range),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ExportError::Configuration(_) => "Configuration",
            ExportError::RangeResolution { .. } => "RangeResolution",
            ExportError::Stream { .. } => "Stream",
            ExportError::Database(_) => "Database",
            ExportError::Io(_) => "Io",
            ExportError::Serialization(_) => "Serialization",
            ExportError::SinkClosed(_) => "SinkClosed",
        }
    }
}

impl serde::Serialize for ExportError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("ExportError", 3)?;
        state.serialize_field("type", self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.serialize_field("range", &self.page_range())?;
        state.end()
    }
}
