pub mod catalog;
pub mod range;
pub mod repository;
pub mod scheduler;
pub mod service;
pub mod sitemap;
pub mod streamer;
pub mod transform;
pub mod types;
pub mod writer;

#[cfg(test)]
mod test_support;

pub use catalog::CatalogTable;
pub use range::RangeResolver;
pub use repository::{PgRecordSource, RecordSource, SqliteRecordSource};
pub use scheduler::{PagePlan, PageScheduler};
pub use service::{ExportOptions, ExportService};
pub use sitemap::{finalize_sitemap, EntityType, SitemapFile, SitemapPolicy};
pub use streamer::PageStreamer;
pub use transform::RecordTransform;
pub use types::{Job, JobCompletion, JobStatus, OutputLine, PageRange, PageStats, Record, TableConfig};
pub use writer::{FileSink, LineSink, SinkMode, SinkStats};
