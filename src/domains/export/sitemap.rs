use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};

use crate::domains::export::repository::format_timestamp;
use crate::domains::export::types::{OutputLine, Record};
use crate::errors::{ExportError, ExportResult};

pub const SITEMAP_HEADER: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<urlset xmlns=\"http://www.sitemaps.org/schemas/sitemap/0.9\">\n";
pub const SITEMAP_FOOTER: &str = "</urlset>\n";
pub const SITEMAP_PRIORITY: &str = "0.8";

/// Entities that have public pages listed in the sitemap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    ComicSeries,
    Creator,
}

impl EntityType {
    pub const ALL: [EntityType; 2] = [EntityType::ComicSeries, EntityType::Creator];

    /// Entity type for a source table; anything else cannot be rendered.
    pub fn from_table(table: &str) -> ExportResult<Self> {
        match table {
            "comicseries" => Ok(EntityType::ComicSeries),
            "creator" => Ok(EntityType::Creator),
            other => Err(ExportError::config(format!(
                "Unsupported sitemap entity type: {}", other
            ))),
        }
    }

    pub fn table_name(&self) -> &'static str {
        match self {
            EntityType::ComicSeries => "comicseries",
            EntityType::Creator => "creator",
        }
    }

    /// Site path of an entity page, relative to the site root.
    pub fn url_path(&self, short_url: &str) -> String {
        let short_url = urlencoding::encode(short_url);
        match self {
            EntityType::ComicSeries => format!("comics/{}", short_url),
            EntityType::Creator => format!("creators/{}", short_url),
        }
    }

    /// Last-modified time of a record whose keys are already camelCased.
    ///
    /// Series carry the publish date of their latest issue as epoch seconds.
    /// Creators use their update time and fall back to their creation time.
    pub fn last_modified(&self, record: &Record) -> Option<DateTime<Utc>> {
        match self {
            EntityType::ComicSeries => record.get("sitemapDatePublished").and_then(epoch_seconds),
            EntityType::Creator => ["sitemapDatePublished", "sitemapDateCreated"]
                .iter()
                .filter_map(|key| record.get(*key))
                .find_map(timestamp_value),
        }
    }

    /// `<type>-1.xml`, the name the finalized sitemap is published under
    pub fn sitemap_file_name(&self) -> String {
        format!("{}-1.xml", self.table_name())
    }
}

/// Renders sitemap `<url>` fragments for one entity type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SitemapPolicy {
    entity: EntityType,
    base_url: String,
}

impl SitemapPolicy {
    pub fn new(entity: EntityType, base_url: &str) -> ExportResult<Self> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(ExportError::config("Sitemap base URL is empty"));
        }
        Ok(Self {
            entity,
            base_url: base_url.to_string(),
        })
    }

    pub fn entity(&self) -> EntityType {
        self.entity
    }

    pub fn location(&self, short_url: &str) -> String {
        format!("{}/{}", self.base_url, self.entity.url_path(short_url))
    }

    /// One `<url>` block, or `None` when the record has no short URL.
    /// A record without a usable timestamp is listed with `lastmod` at the
    /// Unix epoch.
    pub fn render(&self, record: &Record) -> Option<OutputLine> {
        let short_url = match record.get("shortUrl") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim(),
            _ => {
                log::debug!("Skipping {} record without shortUrl", self.entity.table_name());
                return None;
            }
        };

        let last_modified = self.entity.last_modified(record).unwrap_or_else(|| {
            log::debug!(
                "{} {} has no usable timestamp, using the epoch",
                self.entity.table_name(),
                short_url
            );
            DateTime::<Utc>::UNIX_EPOCH
        });

        Some(OutputLine::new(format!(
            "    <url>\n        <loc>{}</loc>\n        <lastmod>{}</lastmod>\n        <priority>{}</priority>\n    </url>\n",
            xml_escape(&self.location(short_url)),
            format_timestamp(&last_modified),
            SITEMAP_PRIORITY
        )))
    }
}

/// Epoch seconds given as a number or numeric string
fn epoch_seconds(value: &Value) -> Option<DateTime<Utc>> {
    let seconds = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.floor() as i64))?,
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f.floor() as i64)?,
        _ => return None,
    };
    DateTime::<Utc>::from_timestamp(seconds, 0)
}

/// A date string (RFC 3339, naive datetime taken as UTC, or plain date) or
/// a number of epoch milliseconds
fn timestamp_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .filter(|ms| *ms != 0)
            .and_then(DateTime::<Utc>::from_timestamp_millis),
        Value::String(s) => parse_date_string(s.trim()),
        _ => None,
    }
}

fn parse_date_string(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn xml_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// A finalized sitemap document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SitemapFile {
    pub path: PathBuf,
    pub url_count: usize,
    pub bytes_written: u64,
}

/// Wrap the accumulated `<url>` fragments in the sitemap header and footer.
///
/// `output` is always written from scratch; the fragments file is streamed
/// line by line and left in place.
pub async fn finalize_sitemap(fragments: &Path, output: &Path) -> ExportResult<SitemapFile> {
    let start = std::time::Instant::now();
    log::info!(
        "Finalizing sitemap {} from {}",
        output.display(),
        fragments.display()
    );

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let mut lines = BufReader::new(File::open(fragments).await?).lines();
    let mut writer = BufWriter::new(File::create(output).await?);
    let mut bytes_written = 0u64;
    let mut url_count = 0usize;

    writer.write_all(SITEMAP_HEADER.as_bytes()).await?;
    bytes_written += SITEMAP_HEADER.len() as u64;

    while let Some(line) = lines.next_line().await? {
        if line.trim() == "<url>" {
            url_count += 1;
        }
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        bytes_written += line.len() as u64 + 1;
    }

    writer.write_all(SITEMAP_FOOTER.as_bytes()).await?;
    bytes_written += SITEMAP_FOOTER.len() as u64;
    writer.flush().await?;
    writer.get_ref().sync_all().await?;

    log::info!(
        "Sitemap {} finished with {} urls in {}ms",
        output.display(),
        url_count,
        start.elapsed().as_millis()
    );

    Ok(SitemapFile {
        path: output.to_path_buf(),
        url_count,
        bytes_written,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(value: Value) -> Record {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_entity_from_table() {
        assert_eq!(EntityType::from_table("comicseries").unwrap(), EntityType::ComicSeries);
        assert_eq!(EntityType::from_table("creator").unwrap(), EntityType::Creator);
        assert!(matches!(
            EntityType::from_table("comicstory"),
            Err(ExportError::Configuration(_))
        ));
    }

    #[test]
    fn test_series_epoch_seconds() {
        let rec = record(json!({ "shortUrl": "moonlight", "sitemapDatePublished": 1700000000 }));
        let ts = EntityType::ComicSeries.last_modified(&rec).unwrap();
        assert_eq!(format_timestamp(&ts), "2023-11-14T22:13:20.000Z");

        // bigint columns may arrive as text
        let rec = record(json!({ "sitemapDatePublished": "1700000000" }));
        let ts = EntityType::ComicSeries.last_modified(&rec).unwrap();
        assert_eq!(format_timestamp(&ts), "2023-11-14T22:13:20.000Z");

        let rec = record(json!({ "sitemapDatePublished": null }));
        assert!(EntityType::ComicSeries.last_modified(&rec).is_none());
    }

    #[test]
    fn test_creator_timestamp_fallback() {
        let rec = record(json!({
            "sitemapDatePublished": "2024-02-01T10:00:00.000Z",
            "sitemapDateCreated": "2023-01-01T00:00:00.000Z"
        }));
        let ts = EntityType::Creator.last_modified(&rec).unwrap();
        assert_eq!(format_timestamp(&ts), "2024-02-01T10:00:00.000Z");

        let rec = record(json!({
            "sitemapDatePublished": null,
            "sitemapDateCreated": "2023-01-01 08:30:00"
        }));
        let ts = EntityType::Creator.last_modified(&rec).unwrap();
        assert_eq!(format_timestamp(&ts), "2023-01-01T08:30:00.000Z");

        let rec = record(json!({ "sitemapDatePublished": 1700000000123i64 }));
        let ts = EntityType::Creator.last_modified(&rec).unwrap();
        assert_eq!(format_timestamp(&ts), "2023-11-14T22:13:20.123Z");

        let rec = record(json!({ "sitemapDatePublished": "", "sitemapDateCreated": null }));
        assert!(EntityType::Creator.last_modified(&rec).is_none());
    }

    #[test]
    fn test_render_fragment() {
        let policy = SitemapPolicy::new(EntityType::ComicSeries, "https://inkverse.co/").unwrap();
        let rec = record(json!({ "shortUrl": "moonlight", "sitemapDatePublished": 1700000000 }));
        let line = policy.render(&rec).unwrap();
        assert_eq!(
            line.as_str(),
            "    <url>\n        <loc>https://inkverse.co/comics/moonlight</loc>\n        <lastmod>2023-11-14T22:13:20.000Z</lastmod>\n        <priority>0.8</priority>\n    </url>\n"
        );
    }

    #[test]
    fn test_render_escapes_and_encodes() {
        let policy = SitemapPolicy::new(EntityType::Creator, "https://example.com?a=1&b=2").unwrap();
        let rec = record(json!({ "shortUrl": "ana & bo", "sitemapDateCreated": "2023-01-01" }));
        let line = policy.render(&rec).unwrap();
        assert!(line.as_str().contains("<loc>https://example.com?a=1&amp;b=2/creators/ana%20%26%20bo</loc>"));
        assert!(line.as_str().contains("<lastmod>2023-01-01T00:00:00.000Z</lastmod>"));
    }

    #[test]
    fn test_render_skips_records_without_short_url() {
        let policy = SitemapPolicy::new(EntityType::ComicSeries, "https://inkverse.co").unwrap();
        assert!(policy.render(&record(json!({ "sitemapDatePublished": 1 }))).is_none());
        assert!(policy.render(&record(json!({ "shortUrl": " ", "sitemapDatePublished": 1 }))).is_none());
        assert!(SitemapPolicy::new(EntityType::ComicSeries, " ").is_err());
    }

    #[test]
    fn test_render_missing_timestamp_uses_epoch() {
        // A series without issues has no publish date
        let policy = SitemapPolicy::new(EntityType::ComicSeries, "https://inkverse.co").unwrap();
        let rec = record(json!({ "shortUrl": "no-issues-yet", "sitemapDatePublished": null }));
        let line = policy.render(&rec).unwrap();
        assert!(line.as_str().contains("<loc>https://inkverse.co/comics/no-issues-yet</loc>"));
        assert!(line.as_str().contains("<lastmod>1970-01-01T00:00:00.000Z</lastmod>"));

        let line = policy.render(&record(json!({ "shortUrl": "x" }))).unwrap();
        assert!(line.as_str().contains("<lastmod>1970-01-01T00:00:00.000Z</lastmod>"));

        let policy = SitemapPolicy::new(EntityType::Creator, "https://inkverse.co").unwrap();
        let rec = record(json!({
            "shortUrl": "ana",
            "sitemapDatePublished": null,
            "sitemapDateCreated": "not a date"
        }));
        let line = policy.render(&rec).unwrap();
        assert!(line.as_str().contains("<loc>https://inkverse.co/creators/ana</loc>"));
        assert!(line.as_str().contains("<lastmod>1970-01-01T00:00:00.000Z</lastmod>"));
    }

    #[tokio::test]
    async fn test_finalize_wraps_fragments() {
        let dir = TempDir::new().unwrap();
        let fragments = dir.path().join("creator.txt");
        let policy = SitemapPolicy::new(EntityType::Creator, "https://inkverse.co").unwrap();
        let mut body = String::new();
        for name in ["ana", "bo"] {
            let rec = record(json!({ "shortUrl": name, "sitemapDateCreated": "2023-01-01" }));
            body.push_str(policy.render(&rec).unwrap().as_str());
        }
        tokio::fs::write(&fragments, &body).await.unwrap();

        let output = dir.path().join("xml").join(EntityType::Creator.sitemap_file_name());
        // A stale document from a previous run must not survive.
        tokio::fs::create_dir_all(output.parent().unwrap()).await.unwrap();
        tokio::fs::write(&output, "stale").await.unwrap();

        let file = finalize_sitemap(&fragments, &output).await.unwrap();
        let content = tokio::fs::read_to_string(&output).await.unwrap();

        assert_eq!(file.url_count, 2);
        assert_eq!(file.bytes_written, content.len() as u64);
        assert!(content.starts_with(SITEMAP_HEADER));
        assert!(content.ends_with(SITEMAP_FOOTER));
        assert!(content.contains("<loc>https://inkverse.co/creators/ana</loc>"));
        assert!(!content.contains("stale"));
    }
}
