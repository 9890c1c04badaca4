use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::{ExportSettings, DEFAULT_PAGE_SIZE, DEFAULT_SINK_CAPACITY, DEFAULT_SITE_BASE_URL};
use crate::domains::export::catalog::CatalogTable;
use crate::domains::export::repository::RecordSource;
use crate::domains::export::scheduler::PageScheduler;
use crate::domains::export::sitemap::{finalize_sitemap, EntityType, SitemapFile};
use crate::domains::export::transform::RecordTransform;
use crate::domains::export::types::{JobCompletion, TableConfig};
use crate::domains::export::writer::{FileSink, SinkMode};
use crate::errors::ExportResult;
use crate::validation::require_non_empty;

/// Per-run knobs that are not part of a table's definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportOptions {
    /// Highest id already present at the destination; export starts above it
    pub floor: i64,
    pub sink_mode: SinkMode,
    pub sink_capacity: usize,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            floor: 0,
            sink_mode: SinkMode::Truncate,
            sink_capacity: DEFAULT_SINK_CAPACITY,
        }
    }
}

/// Export entry point. Borrows the record source; the caller owns the pool
/// behind it and closes it once the service is done.
pub struct ExportService<'a, S: RecordSource + ?Sized> {
    source: &'a S,
    page_size: i64,
    site_base_url: String,
    options: ExportOptions,
}

impl<'a, S: RecordSource + ?Sized> ExportService<'a, S> {
    pub fn new(source: &'a S) -> Self {
        Self {
            source,
            page_size: DEFAULT_PAGE_SIZE,
            site_base_url: DEFAULT_SITE_BASE_URL.to_string(),
            options: ExportOptions::default(),
        }
    }

    pub fn from_settings(source: &'a S, settings: &ExportSettings) -> Self {
        Self {
            source,
            page_size: settings.page_size,
            site_base_url: settings.site_base_url.clone(),
            options: ExportOptions {
                sink_capacity: settings.sink_capacity,
                ..ExportOptions::default()
            },
        }
    }

    pub fn with_options(mut self, options: ExportOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_site_base_url(mut self, site_base_url: impl Into<String>) -> Self {
        self.site_base_url = site_base_url.into();
        self
    }

    /// Export a catalog table keyed on `pk_column` into `output_path`.
    pub async fn export(
        &self,
        table: &str,
        pk_column: &str,
        output_path: impl AsRef<Path>,
    ) -> ExportResult<JobCompletion> {
        let output_path = output_path.as_ref();
        require_non_empty("table", table)?;
        require_non_empty("pk", pk_column)?;
        require_non_empty("outputPath", &output_path.to_string_lossy())?;

        let catalog = CatalogTable::from_table(table)?;
        let config = catalog.table_config(pk_column, self.page_size)?;
        let transform = catalog.transform(&self.site_base_url)?;

        self.export_with(&config, &transform, output_path).await
    }

    /// Export any table definition with any transform. The output file is
    /// opened once for the whole job and closed (flushed and synced) whether
    /// or not the job succeeded.
    pub async fn export_with(
        &self,
        config: &TableConfig,
        transform: &RecordTransform,
        output_path: impl AsRef<Path>,
    ) -> ExportResult<JobCompletion> {
        let output_path = output_path.as_ref();
        let mut sink = FileSink::open(output_path, self.options.sink_mode, self.options.sink_capacity).await?;

        let result = PageScheduler::new(self.source)
            .run(config, transform, self.options.floor, &mut sink)
            .await;
        let closed = sink.close().await;

        match (result, closed) {
            (Ok(completion), Ok(stats)) => {
                log::info!(
                    "Wrote {} ({} bytes, {} lines)",
                    output_path.display(),
                    stats.committed_len,
                    stats.lines_written
                );
                Ok(completion)
            }
            (Ok(_), Err(close_err)) => Err(close_err),
            (Err(e), Ok(stats)) => {
                log::warn!(
                    "{} keeps {} bytes of committed pages after failure",
                    output_path.display(),
                    stats.committed_len
                );
                Err(e)
            }
            (Err(e), Err(close_err)) => {
                log::error!("Closing {} failed: {}", output_path.display(), close_err);
                Err(e)
            }
        }
    }

    /// Export one sitemap entity into `<table>.txt` fragments, wrap them into
    /// `<table>-1.xml` and remove the fragments file.
    pub async fn export_sitemap(&self, entity: EntityType, output_dir: &Path) -> ExportResult<SitemapFile> {
        let catalog = CatalogTable::from_table(entity.table_name())?;
        let fragments = output_dir.join(catalog.output_file_name());

        self.export(entity.table_name(), "id", &fragments).await?;
        let sitemap = finalize_sitemap(&fragments, &output_dir.join(entity.sitemap_file_name())).await?;
        tokio::fs::remove_file(&fragments).await?;

        Ok(sitemap)
    }

    /// Both sitemaps, series first. Stops at the first failure.
    pub async fn export_sitemaps(&self, output_dir: &Path) -> ExportResult<Vec<SitemapFile>> {
        let start = Instant::now();
        let mut files = Vec::with_capacity(EntityType::ALL.len());
        for entity in EntityType::ALL {
            files.push(self.export_sitemap(entity, output_dir).await?);
        }
        log::info!("Sitemaps finished after {}ms", start.elapsed().as_millis());
        Ok(files)
    }

    /// Stories that still need image dimensions, as JSON lines.
    pub async fn export_story_images(&self, output_dir: &Path) -> ExportResult<(PathBuf, JobCompletion)> {
        let catalog = CatalogTable::ComicStory;
        let output_path = output_dir.join(catalog.output_file_name());
        let completion = self.export(catalog.table_name(), "id", &output_path).await?;
        Ok((output_path, completion))
    }
}
