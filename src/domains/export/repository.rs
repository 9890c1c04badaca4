use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use futures::stream::{BoxStream, StreamExt};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, PgPool, Row, SqlitePool, TypeInfo, ValueRef};
use uuid::Uuid;

use crate::domains::export::types::Record;
use crate::errors::ExportResult;
use crate::validation::quote_ident;

/// Read side of an export: the maximum key of a table and a forward-only
/// row stream for one page query.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// `MAX(pk_column)` of `table`, `None` when the table has no rows.
    async fn max_id(&self, table: &str, pk_column: &str) -> ExportResult<Option<i64>>;

    /// Stream the rows of `sql` in the order the database emits them.
    ///
    /// A pooled connection is held for as long as the stream is alive and is
    /// returned to the pool when the stream is dropped, whether or not it was
    /// exhausted.
    fn fetch_page<'a>(&'a self, sql: &'a str) -> BoxStream<'a, ExportResult<Record>>;

    /// Short name used in log lines
    fn source_name(&self) -> &'static str;
}

/// Postgres record source backed by a shared connection pool
#[derive(Debug, Clone)]
pub struct PgRecordSource {
    pool: PgPool,
}

impl PgRecordSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close the pool. Waits for checked-out connections to be returned.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl RecordSource for PgRecordSource {
    async fn max_id(&self, table: &str, pk_column: &str) -> ExportResult<Option<i64>> {
        let sql = format!(
            "SELECT MAX({})::bigint AS max_id FROM {}",
            quote_ident(pk_column),
            quote_ident(table)
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(row.try_get::<Option<i64>, _>("max_id")?)
    }

    fn fetch_page<'a>(&'a self, sql: &'a str) -> BoxStream<'a, ExportResult<Record>> {
        // Every page has different query text; keep them out of the statement cache.
        sqlx::query(sql)
            .persistent(false)
            .fetch(&self.pool)
            .map(|row| -> ExportResult<Record> { pg_row_to_record(&row?) })
            .boxed()
    }

    fn source_name(&self) -> &'static str {
        "postgres"
    }
}

/// SQLite record source, picked for `sqlite:` database URLs
#[derive(Debug, Clone)]
pub struct SqliteRecordSource {
    pool: SqlitePool,
}

impl SqliteRecordSource {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl RecordSource for SqliteRecordSource {
    async fn max_id(&self, table: &str, pk_column: &str) -> ExportResult<Option<i64>> {
        let sql = format!(
            "SELECT MAX({}) AS max_id FROM {}",
            quote_ident(pk_column),
            quote_ident(table)
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(row.try_get::<Option<i64>, _>("max_id")?)
    }

    fn fetch_page<'a>(&'a self, sql: &'a str) -> BoxStream<'a, ExportResult<Record>> {
        sqlx::query(sql)
            .persistent(false)
            .fetch(&self.pool)
            .map(|row| -> ExportResult<Record> { sqlite_row_to_record(&row?) })
            .boxed()
    }

    fn source_name(&self) -> &'static str {
        "sqlite"
    }
}

/// ISO-8601 in UTC with millisecond precision, e.g. `2023-11-14T22:13:20.000Z`.
pub fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn float_value(value: f64) -> Value {
    // NaN and infinities become null
    Value::from(value)
}

/// Decimal text keeps full precision
fn numeric_value(value: Decimal) -> Value {
    Value::String(value.to_string())
}

/// `TIMESTAMP` columns carry no zone and are read as UTC.
fn naive_timestamp_value(value: NaiveDateTime) -> Value {
    Value::String(format_timestamp(&value.and_utc()))
}

fn date_value(value: NaiveDate) -> Value {
    Value::String(value.format("%Y-%m-%d").to_string())
}

/// How a Postgres column is decoded, chosen by its type name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PgColumnKind {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Uuid,
    TimestampTz,
    Timestamp,
    Date,
    Json,
    TextArray,
    Int4Array,
    Int8Array,
    Text,
    /// Enums and other text-encoded types
    Other,
}

impl PgColumnKind {
    fn from_type_name(type_name: &str) -> Self {
        match type_name {
            "BOOL" => Self::Bool,
            "INT2" => Self::Int2,
            "INT4" => Self::Int4,
            "INT8" => Self::Int8,
            "FLOAT4" => Self::Float4,
            "FLOAT8" => Self::Float8,
            "NUMERIC" => Self::Numeric,
            "UUID" => Self::Uuid,
            "TIMESTAMPTZ" => Self::TimestampTz,
            "TIMESTAMP" => Self::Timestamp,
            "DATE" => Self::Date,
            "JSON" | "JSONB" => Self::Json,
            "TEXT[]" | "VARCHAR[]" => Self::TextArray,
            "INT4[]" => Self::Int4Array,
            "INT8[]" => Self::Int8Array,
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => Self::Text,
            _ => Self::Other,
        }
    }
}

/// Convert a Postgres row into a record, column by column by type name.
pub fn pg_row_to_record(row: &PgRow) -> ExportResult<Record> {
    let mut record = Record::with_capacity(row.columns().len());

    for (idx, column) in row.columns().iter().enumerate() {
        let type_name = column.type_info().name();
        let value = match PgColumnKind::from_type_name(type_name) {
            PgColumnKind::Bool => row.try_get::<Option<bool>, _>(idx)?.map(Value::from),
            PgColumnKind::Int2 => row.try_get::<Option<i16>, _>(idx)?.map(Value::from),
            PgColumnKind::Int4 => row.try_get::<Option<i32>, _>(idx)?.map(Value::from),
            PgColumnKind::Int8 => row.try_get::<Option<i64>, _>(idx)?.map(Value::from),
            PgColumnKind::Float4 => row
                .try_get::<Option<f32>, _>(idx)?
                .map(|v| float_value(v as f64)),
            PgColumnKind::Float8 => row.try_get::<Option<f64>, _>(idx)?.map(float_value),
            PgColumnKind::Numeric => row.try_get::<Option<Decimal>, _>(idx)?.map(numeric_value),
            PgColumnKind::Uuid => row
                .try_get::<Option<Uuid>, _>(idx)?
                .map(|v| Value::String(v.to_string())),
            PgColumnKind::TimestampTz => row
                .try_get::<Option<DateTime<Utc>>, _>(idx)?
                .map(|v| Value::String(format_timestamp(&v))),
            PgColumnKind::Timestamp => row
                .try_get::<Option<NaiveDateTime>, _>(idx)?
                .map(naive_timestamp_value),
            PgColumnKind::Date => row.try_get::<Option<NaiveDate>, _>(idx)?.map(date_value),
            PgColumnKind::Json => row.try_get::<Option<Value>, _>(idx)?,
            PgColumnKind::TextArray => row
                .try_get::<Option<Vec<String>>, _>(idx)?
                .map(Value::from),
            PgColumnKind::Int4Array => row.try_get::<Option<Vec<i32>>, _>(idx)?.map(Value::from),
            PgColumnKind::Int8Array => row.try_get::<Option<Vec<i64>>, _>(idx)?.map(Value::from),
            PgColumnKind::Text => row.try_get::<Option<String>, _>(idx)?.map(Value::String),
            PgColumnKind::Other => match row.try_get_unchecked::<Option<String>, _>(idx) {
                Ok(value) => value.map(Value::String),
                Err(e) => {
                    log::debug!(
                        "Column {} has undecodable type {}, exporting null: {}",
                        column.name(),
                        type_name,
                        e
                    );
                    None
                }
            },
        };

        record.insert(column.name().to_string(), value.unwrap_or(Value::Null));
    }

    Ok(record)
}

/// Convert a SQLite row into a record using each value's storage class.
pub fn sqlite_row_to_record(row: &SqliteRow) -> ExportResult<Record> {
    let mut record = Record::with_capacity(row.columns().len());

    for (idx, column) in row.columns().iter().enumerate() {
        let storage_class = {
            let raw = row.try_get_raw(idx)?;
            if raw.is_null() {
                None
            } else {
                Some(raw.type_info().name().to_string())
            }
        };

        let value = match storage_class.as_deref() {
            None | Some("NULL") => Value::Null,
            Some("INTEGER") => Value::from(row.try_get::<i64, _>(idx)?),
            Some("REAL") => float_value(row.try_get::<f64, _>(idx)?),
            Some("BLOB") => {
                let bytes = row.try_get::<Vec<u8>, _>(idx)?;
                Value::String(bytes.iter().map(|b| format!("{:02x}", b)).collect())
            }
            Some(_) => Value::String(row.try_get_unchecked::<String, _>(idx)?),
        };

        record.insert(column.name().to_string(), value);
    }

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::str::FromStr;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_max_id() {
        let pool = memory_pool().await;
        sqlx::query("CREATE TABLE creator (id INTEGER PRIMARY KEY, short_url TEXT)")
            .execute(&pool)
            .await
            .unwrap();

        let source = SqliteRecordSource::new(pool.clone());
        assert_eq!(source.max_id("creator", "id").await.unwrap(), None);

        sqlx::query("INSERT INTO creator (id, short_url) VALUES (3, 'a'), (17, 'b'), (9, 'c')")
            .execute(&pool)
            .await
            .unwrap();
        assert_eq!(source.max_id("creator", "id").await.unwrap(), Some(17));
    }

    #[tokio::test]
    async fn test_sqlite_max_id_missing_table_is_error() {
        let source = SqliteRecordSource::new(memory_pool().await);
        assert!(source.max_id("nope", "id").await.is_err());
    }

    #[tokio::test]
    async fn test_sqlite_fetch_page_preserves_order_and_columns() {
        let pool = memory_pool().await;
        sqlx::query(
            "CREATE TABLE comicstory (id INTEGER PRIMARY KEY, story_image TEXT, width REAL, is_removed INTEGER)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO comicstory VALUES (1, 'a.png', 1.5, 0), (2, NULL, NULL, 1), (3, 'c.png', 3.0, 0)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let source = SqliteRecordSource::new(pool);
        let records: Vec<Record> = source
            .fetch_page("SELECT id, story_image, width FROM comicstory WHERE id BETWEEN 1 AND 3 ORDER BY id")
            .try_collect()
            .await
            .unwrap();

        assert_eq!(records.len(), 3);
        let keys: Vec<&String> = records[0].keys().collect();
        assert_eq!(keys, vec!["id", "story_image", "width"]);
        assert_eq!(records[0]["id"], 1);
        assert_eq!(records[0]["story_image"], "a.png");
        assert_eq!(records[0]["width"], 1.5);
        assert_eq!(records[1]["story_image"], Value::Null);
        assert_eq!(records[2]["id"], 3);
    }

    #[tokio::test]
    async fn test_sqlite_fetch_page_reports_query_errors() {
        let source = SqliteRecordSource::new(memory_pool().await);
        let result: ExportResult<Vec<Record>> = source
            .fetch_page("SELECT * FROM missing_table")
            .try_collect()
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_format_timestamp() {
        let ts = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(format_timestamp(&ts), "2023-11-14T22:13:20.000Z");

        let ts = DateTime::<Utc>::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        assert_eq!(format_timestamp(&ts), "2023-11-14T22:13:20.123Z");
    }

    #[test]
    fn test_numeric_value_keeps_precision() {
        let value = Decimal::from_str("1234567890123.456789012").unwrap();
        assert_eq!(numeric_value(value), Value::String("1234567890123.456789012".into()));
        assert_eq!(numeric_value(Decimal::from_str("-0.50").unwrap()), "-0.50");
        assert_eq!(numeric_value(Decimal::from(42)), "42");
    }

    #[test]
    fn test_naive_timestamp_and_date_values() {
        let naive = NaiveDate::from_ymd_opt(2024, 2, 29)
            .unwrap()
            .and_hms_milli_opt(23, 59, 58, 7)
            .unwrap();
        assert_eq!(naive_timestamp_value(naive), "2024-02-29T23:59:58.007Z");
        assert_eq!(date_value(naive.date()), "2024-02-29");
    }

    #[test]
    fn test_float_value_non_finite_is_null() {
        assert_eq!(float_value(2.5), 2.5);
        assert_eq!(float_value(f64::NAN), Value::Null);
        assert_eq!(float_value(f64::INFINITY), Value::Null);
    }

    #[test]
    fn test_pg_column_kind_from_type_name() {
        assert_eq!(PgColumnKind::from_type_name("NUMERIC"), PgColumnKind::Numeric);
        assert_eq!(PgColumnKind::from_type_name("TIMESTAMPTZ"), PgColumnKind::TimestampTz);
        assert_eq!(PgColumnKind::from_type_name("TIMESTAMP"), PgColumnKind::Timestamp);
        assert_eq!(PgColumnKind::from_type_name("JSONB"), PgColumnKind::Json);
        assert_eq!(PgColumnKind::from_type_name("VARCHAR[]"), PgColumnKind::TextArray);
        assert_eq!(PgColumnKind::from_type_name("BPCHAR"), PgColumnKind::Text);
        assert_eq!(PgColumnKind::from_type_name("INT8[]"), PgColumnKind::Int8Array);
        assert_eq!(PgColumnKind::from_type_name("mood"), PgColumnKind::Other);
    }
}
