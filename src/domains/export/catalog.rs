use crate::domains::export::transform::RecordTransform;
use crate::domains::export::types::{PageRange, TableConfig};
use crate::errors::{ExportError, ExportResult};
use crate::validation::quote_ident;

/// Tables with a built-in export job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CatalogTable {
    ComicSeries,
    Creator,
    ComicStory,
}

impl CatalogTable {
    pub const ALL: [CatalogTable; 3] = [
        CatalogTable::ComicSeries,
        CatalogTable::Creator,
        CatalogTable::ComicStory,
    ];

    pub fn from_table(table: &str) -> ExportResult<Self> {
        match table {
            "comicseries" => Ok(CatalogTable::ComicSeries),
            "creator" => Ok(CatalogTable::Creator),
            "comicstory" => Ok(CatalogTable::ComicStory),
            other => Err(ExportError::config(format!(
                "Unsupported table '{}', expected one of: comicseries, creator, comicstory",
                other
            ))),
        }
    }

    pub fn table_name(&self) -> &'static str {
        match self {
            CatalogTable::ComicSeries => "comicseries",
            CatalogTable::Creator => "creator",
            CatalogTable::ComicStory => "comicstory",
        }
    }

    /// File the job writes into the output directory.
    pub fn output_file_name(&self) -> &'static str {
        match self {
            CatalogTable::ComicSeries => "comicseries.txt",
            CatalogTable::Creator => "creator.txt",
            CatalogTable::ComicStory => "comicstories.txt",
        }
    }

    /// Page query for this table keyed on `pk_column`.
    pub fn table_config(&self, pk_column: &str, page_size: i64) -> ExportResult<TableConfig> {
        let pk = quote_ident(pk_column);

        match self {
            // Series carry the publish date of their latest issue
            CatalogTable::ComicSeries => TableConfig::new(
                self.table_name(),
                pk_column,
                page_size,
                move |r: PageRange| {
                    format!(
                        "SELECT cs.*, ci.date_published AS sitemap_date_published \
                         FROM comicseries cs \
                         LEFT JOIN LATERAL ( \
                             SELECT uuid, name, date_published \
                             FROM comicissue \
                             WHERE series_uuid = cs.uuid \
                             ORDER BY date_published DESC NULLS LAST, position DESC NULLS LAST \
                             LIMIT 1 \
                         ) ci ON true \
                         WHERE cs.{pk} BETWEEN {min} AND {max} \
                         AND (cs.is_blocked IS NULL OR cs.is_blocked = false) \
                         ORDER BY cs.{pk}",
                        pk = pk,
                        min = r.min,
                        max = r.max
                    )
                },
            ),
            CatalogTable::Creator => TableConfig::new(
                self.table_name(),
                pk_column,
                page_size,
                move |r: PageRange| {
                    format!(
                        "SELECT c.*, c.updated_at AS sitemap_date_published, \
                         c.created_at AS sitemap_date_created \
                         FROM creator c \
                         WHERE c.{pk} BETWEEN {min} AND {max} \
                         AND (c.is_blocked IS NULL OR c.is_blocked = false) \
                         ORDER BY c.{pk}",
                        pk = pk,
                        min = r.min,
                        max = r.max
                    )
                },
            ),
            // Stories still missing dimensions, skipping removed rows and
            // exclusive content that is not public yet
            CatalogTable::ComicStory => TableConfig::new(
                self.table_name(),
                pk_column,
                page_size,
                move |r: PageRange| {
                    format!(
                        "SELECT cs.uuid, cs.issue_uuid, cs.series_uuid, cs.story_image \
                         FROM comicstory cs \
                         JOIN comicissue ci ON ci.uuid = cs.issue_uuid \
                         WHERE cs.{pk} BETWEEN {min} AND {max} \
                         AND (cs.is_removed IS NULL OR cs.is_removed = false) \
                         AND (cs.width IS NULL OR cs.height IS NULL) \
                         AND (ci.scopes_for_exclusive_content IS NULL \
                              OR ci.date_exclusive_content_is_available < EXTRACT(EPOCH FROM NOW()) * 1000) \
                         ORDER BY cs.{pk}",
                        pk = pk,
                        min = r.min,
                        max = r.max
                    )
                },
            ),
        }
    }

    pub fn transform(&self, base_url: &str) -> ExportResult<RecordTransform> {
        match self {
            CatalogTable::ComicSeries | CatalogTable::Creator => {
                RecordTransform::sitemap(self.table_name(), base_url)
            }
            CatalogTable::ComicStory => Ok(RecordTransform::json_lines()),
        }
    }
}
