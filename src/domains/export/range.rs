use crate::domains::export::repository::RecordSource;
use crate::errors::{ExportError, ExportResult};

/// Determines the id range an export has to cover.
pub struct RangeResolver<'a, S: RecordSource + ?Sized> {
    source: &'a S,
}

impl<'a, S: RecordSource + ?Sized> RangeResolver<'a, S> {
    pub fn new(source: &'a S) -> Self {
        Self { source }
    }

    /// Maximum primary-key value currently present in `table`.
    ///
    /// A failing query or an empty table (undefined maximum) is a
    /// `RangeResolution` error; the job must not start.
    pub async fn resolve_max(&self, table: &str, pk_column: &str) -> ExportResult<i64> {
        let resolution_error = |message: String| ExportError::RangeResolution {
            table: table.to_string(),
            column: pk_column.to_string(),
            message,
        };

        let max_id = self
            .source
            .max_id(table, pk_column)
            .await
            .map_err(|e| resolution_error(e.to_string()))?;

        match max_id {
            Some(max_id) => {
                log::info!(
                    "Max id for {}.{} on {}: {}",
                    table,
                    pk_column,
                    self.source.source_name(),
                    max_id
                );
                Ok(max_id)
            }
            None => Err(resolution_error("maximum id is undefined (table has no rows)".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::export::repository::SqliteRecordSource;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn source_with_ids(ids: &[i64]) -> SqliteRecordSource {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("CREATE TABLE comicseries (id INTEGER PRIMARY KEY)")
            .execute(&pool)
            .await
            .unwrap();
        for id in ids {
            sqlx::query("INSERT INTO comicseries (id) VALUES (?)")
                .bind(id)
                .execute(&pool)
                .await
                .unwrap();
        }
        SqliteRecordSource::new(pool)
    }

    #[tokio::test]
    async fn test_resolve_max() {
        let source = source_with_ids(&[1, 2, 450]).await;
        let max = RangeResolver::new(&source).resolve_max("comicseries", "id").await.unwrap();
        assert_eq!(max, 450);
    }

    #[tokio::test]
    async fn test_empty_table_is_resolution_error() {
        let source = source_with_ids(&[]).await;
        let err = RangeResolver::new(&source)
            .resolve_max("comicseries", "id")
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::RangeResolution { .. }));
        assert!(err.to_string().contains("comicseries.id"));
    }

    #[tokio::test]
    async fn test_query_failure_is_resolution_error() {
        let source = source_with_ids(&[1]).await;
        let err = RangeResolver::new(&source)
            .resolve_max("comicseries", "no_such_column")
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::RangeResolution { .. }));
    }
}
