mod error;

pub use error::ExportError;

/// Result type for export operations
pub type ExportResult<T> = Result<T, ExportError>;
