use deckhand_core::chrono::{DateTime, NaiveDate, Utc};

use super::RepositoryError;

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_optional_u32(
    column: &str,
    value: Option<i64>,
) -> Result<Option<u32>, RepositoryError> {
    value.map(|raw| parse_u32(column, raw)).transpose()
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

pub(crate) fn parse_optional_date(
    column: &str,
    value: Option<String>,
) -> Result<Option<NaiveDate>, RepositoryError> {
    value
        .map(|raw| {
            NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|error| {
                RepositoryError::Decode(format!("invalid date in `{column}`: `{raw}` ({error})"))
            })
        })
        .transpose()
}

pub(crate) fn parse_string_list(column: &str, value: String) -> Result<Vec<String>, RepositoryError> {
    serde_json::from_str(&value).map_err(|error| {
        RepositoryError::Decode(format!("invalid JSON list in `{column}`: {error}"))
    })
}

pub(crate) fn encode_string_list(values: &[String]) -> Result<String, RepositoryError> {
    serde_json::to_string(values)
        .map_err(|error| RepositoryError::Decode(format!("could not encode list: {error}")))
}

/// Turns a unique-constraint violation into `Conflict`, leaving other errors as-is.
pub(crate) fn conflict_on_unique(error: sqlx::Error, message: impl Into<String>) -> RepositoryError {
    match &error {
        sqlx::Error::Database(database_error) if database_error.is_unique_violation() => {
            RepositoryError::Conflict(message.into())
        }
        _ => RepositoryError::Database(error),
    }
}

/// Turns a foreign-key violation into `Conflict`, leaving other errors as-is.
pub(crate) fn conflict_on_foreign_key(
    error: sqlx::Error,
    message: impl Into<String>,
) -> RepositoryError {
    match &error {
        sqlx::Error::Database(database_error)
            if database_error.is_foreign_key_violation()
                || is_foreign_key_failure(
                    database_error.code().as_deref(),
                    database_error.message(),
                ) =>
        {
            RepositoryError::Conflict(message.into())
        }
        _ => RepositoryError::Database(error),
    }
}

/// SQLite reports an `ON DELETE RESTRICT` hit as extended code 1811
/// (`SQLITE_CONSTRAINT_TRIGGER`), which sqlx does not classify as a
/// foreign-key violation; only 787 is.
fn is_foreign_key_failure(code: Option<&str>, message: &str) -> bool {
    matches!(code, Some("787" | "1811")) || message.contains("FOREIGN KEY constraint failed")
}
