//! Error types for the Relic store
//!
//! Every operation fails synchronously with a `StoreError`; there is no
//! retry logic and no partial-success semantics for single-row operations.
//! We use `thiserror` for ergonomic error definitions with automatic
//! Display/Error implementations.

use thiserror::Error;

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Main error type for store operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// An operation referenced a class that was never registered
    #[error("class '{0}' was never registered")]
    UnknownClass(&'static str),

    /// The same class was registered twice on one store
    #[error("class '{0}' is already registered")]
    AlreadyRegistered(&'static str),

    /// A different class is already registered under the same table name
    #[error("table '{0}' is already registered for a different class")]
    NameConflict(&'static str),

    /// An upgrade declared a different affinity for an existing column
    #[error("column '{table}.{column}' is {found}, declared as {expected}")]
    TypeMismatch {
        table: &'static str,
        column: String,
        expected: String,
        found: String,
    },

    /// A declared column is missing from the existing table and the
    /// registration did not request an upgrade
    #[error("table '{table}' lacks column '{column}'; register with upgrade to add it")]
    UpgradeRequired {
        table: &'static str,
        column: String,
    },

    /// A field name outside the class's declared field set
    #[error("'{field}' is not a declared field of '{table}'")]
    InvalidArgument {
        table: &'static str,
        field: String,
    },

    /// update/delete on an instance that has no persisted primary key
    #[error("instance of '{0}' has no primary key")]
    MissingPrimaryKey(&'static str),

    /// `get` matched more than one row
    #[error("get on '{0}' matched more than one row")]
    MultipleResults(&'static str),

    /// A row projection was accessed by a name or index it does not contain
    #[error("row has no column {0}")]
    AttributeNotFound(String),

    /// A value could not be converted between its semantic type and its
    /// storage representation
    #[error("conversion failed: {0}")]
    Conversion(String),

    /// Errors from the embedded SQLite engine
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON (de)serialization errors
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_names_the_violated_invariant() {
        let err = StoreError::UnknownClass("person");
        assert!(err.to_string().contains("person"));

        let err = StoreError::TypeMismatch {
            table: "foo",
            column: "bar".into(),
            expected: "INTEGER".into(),
            found: "TEXT".into(),
        };
        let text = err.to_string();
        assert!(text.contains("foo.bar"));
        assert!(text.contains("INTEGER"));
        assert!(text.contains("TEXT"));
    }

    #[test]
    fn test_sqlite_error_wraps() {
        let err: StoreError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, StoreError::Sqlite(_)));
    }
}
