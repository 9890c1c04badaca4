use crate::errors::{ExportError, ExportResult};

/// A trait for configuration values that are checked once at job start.
pub trait Validate {
    /// Validates the value and returns a configuration error if it is unusable.
    fn validate(&self) -> ExportResult<()>;
}

/// Reject missing or blank required arguments.
pub fn require_non_empty(field: &str, value: &str) -> ExportResult<()> {
    if value.trim().is_empty() {
        return Err(ExportError::config(format!("Missing required argument: {}", field)));
    }
    Ok(())
}

/// Identifiers are interpolated into SQL, so only plain names are accepted:
/// ASCII alphanumerics and underscores, not starting with a digit.
/// A single `schema.table` qualification is allowed.
pub fn validate_identifier(field: &str, identifier: &str) -> ExportResult<()> {
    require_non_empty(field, identifier)?;

    let parts: Vec<&str> = identifier.split('.').collect();
    if parts.len() > 2 {
        return Err(ExportError::config(format!(
            "{} has too many qualifiers: {}", field, identifier
        )));
    }

    for part in parts {
        let valid = !part.is_empty()
            && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !part.chars().next().map_or(false, |c| c.is_ascii_digit());
        if !valid {
            return Err(ExportError::config(format!(
                "{} contains invalid characters: {}", field, identifier
            )));
        }
    }

    Ok(())
}

/// Quote a (possibly schema-qualified) identifier for Postgres or SQLite.
pub fn quote_ident(identifier: &str) -> String {
    identifier
        .split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

/// Reject zero or negative sizes.
pub fn validate_positive(field: &str, value: i64) -> ExportResult<()> {
    if value <= 0 {
        return Err(ExportError::config(format!(
            "{} must be positive, got {}", field, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("table", "comicseries").is_ok());
        assert!(validate_identifier("table", "public.comicseries").is_ok());
        assert!(validate_identifier("pk", "series_id2").is_ok());

        assert!(validate_identifier("table", "").is_err());
        assert!(validate_identifier("table", "   ").is_err());
        assert!(validate_identifier("table", "DROP TABLE users;").is_err());
        assert!(validate_identifier("table", "2fast").is_err());
        assert!(validate_identifier("table", "a.b.c").is_err());
        assert!(validate_identifier("table", "public.").is_err());
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("id"), "\"id\"");
        assert_eq!(quote_ident("public.creator"), "\"public\".\"creator\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_validate_positive() {
        assert!(validate_positive("page_size", 200).is_ok());
        assert!(validate_positive("page_size", 0).is_err());
        assert!(validate_positive("page_size", -5).is_err());
    }
}
