use crate::domains::export::sitemap::{EntityType, SitemapPolicy};
use crate::domains::export::types::{OutputLine, Record};
use crate::errors::ExportResult;

/// Per-record output policy of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordTransform {
    /// camelCase the column names and write one JSON object per line
    JsonLines,
    /// camelCase the column names and render a sitemap `<url>` fragment
    Sitemap(SitemapPolicy),
}

impl RecordTransform {
    pub fn json_lines() -> Self {
        RecordTransform::JsonLines
    }

    /// Sitemap policy for `table`. Fails before any row is read when the
    /// table has no sitemap entity type.
    pub fn sitemap(table: &str, base_url: &str) -> ExportResult<Self> {
        let entity = EntityType::from_table(table)?;
        Ok(RecordTransform::Sitemap(SitemapPolicy::new(entity, base_url)?))
    }

    pub fn name(&self) -> &'static str {
        match self {
            RecordTransform::JsonLines => "json-lines",
            RecordTransform::Sitemap(_) => "sitemap",
        }
    }

    /// Transform one record. `Ok(None)` means the record is skipped; empty
    /// records are always skipped.
    pub fn apply(&self, record: Record) -> ExportResult<Option<OutputLine>> {
        if record.is_empty() {
            return Ok(None);
        }

        let record = normalize_keys(record);
        match self {
            RecordTransform::JsonLines => {
                let json = serde_json::to_string(&record)?;
                Ok(Some(OutputLine::new(json)))
            }
            RecordTransform::Sitemap(policy) => Ok(policy.render(&record)),
        }
    }
}

/// Rename every column to camelCase, keeping column order. When two columns
/// collapse to the same name the later value wins.
pub fn normalize_keys(record: Record) -> Record {
    record
        .into_iter()
        .map(|(key, value)| (camel_case(&key), value))
        .collect()
}

/// `series_uuid` -> `seriesUuid`, `ShortURL` -> `shortUrl`, `story-image` -> `storyImage`.
pub fn camel_case(key: &str) -> String {
    let mut result = String::with_capacity(key.len());

    for (i, word) in split_words(key).iter().enumerate() {
        let lower = word.to_lowercase();
        if i == 0 {
            result.push_str(&lower);
            continue;
        }
        let mut chars = lower.chars();
        if let Some(first) = chars.next() {
            result.extend(first.to_uppercase());
            result.push_str(chars.as_str());
        }
    }

    result
}

fn split_words(key: &str) -> Vec<String> {
    let chars: Vec<char> = key.chars().collect();
    let mut words = Vec::new();
    let mut current = String::new();

    for (i, &c) in chars.iter().enumerate() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            continue;
        }

        if !current.is_empty() {
            let prev = chars[i - 1];
            let next = chars.get(i + 1).copied();
            let boundary = (prev.is_lowercase() && c.is_uppercase())
                || (prev.is_ascii_digit() && c.is_alphabetic())
                || (prev.is_uppercase()
                    && c.is_uppercase()
                    && next.map_or(false, |n| n.is_lowercase()));
            if boundary {
                words.push(std::mem::take(&mut current));
            }
        }

        current.push(c);
    }

    if !current.is_empty() {
        words.push(current);
    }
    words
}
