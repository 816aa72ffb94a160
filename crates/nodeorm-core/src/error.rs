//! Error types for nodeorm operations.
//!
//! Conflicts ([`UniqueValueError`], [`OptimisticLockError`]) are ordinary
//! runtime conditions and travel through [`Error`]. Misuse of the API against
//! the schema (a required reference left unset, a malformed query node) is a
//! caller bug and panics at the call site instead.

use std::fmt;

/// The primary error type for all nodeorm operations.
#[derive(Debug)]
pub enum Error {
    /// Row-store query or statement errors
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction errors
    Transaction(TransactionError),
    /// Schema definition errors
    Schema(SchemaError),
    /// A unique column already holds the value being written
    UniqueValue(UniqueValueError),
    /// The row was changed or removed since it was read
    OptimisticLock(OptimisticLockError),
    /// A query node does not fit the schema or the query shape
    InvalidNode(InvalidNodeError),
    /// A field was read that the loading query did not select
    NotLoaded(NotLoadedError),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub table: Option<String>,
    /// Column involved in a constraint failure, when the store knows it.
    pub column: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Serialization failure: a concurrent transaction committed first
    /// (retry may succeed)
    Serialization,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Nested transaction not supported
    NestedNotSupported,
}

#[derive(Debug)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// Table declared twice
    TableExists,
    /// Table not found
    TableNotFound,
    /// Column or relationship name declared twice
    DuplicateName,
    /// Invalid schema definition
    Invalid,
}

/// Writing a value that a unique column already holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueValueError {
    pub table: String,
    /// The offending column.
    pub field: String,
}

/// A locked update or delete matched no row: the record is stale or gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimisticLockError {
    pub table: String,
    /// Rendered primary key of the record.
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidNodeError {
    pub reason: String,
}

impl InvalidNodeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotLoadedError {
    pub table: String,
    pub column: String,
}

impl Error {
    /// Is this a retryable error? True for serialization failures, which a
    /// fresh attempt on current data may avoid.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Query(q) if q.kind == QueryErrorKind::Serialization)
    }

    /// Is this a conflict the caller may resolve by reloading and retrying?
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::UniqueValue(_) | Error::OptimisticLock(_))
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Build a row-store error of the given kind.
    pub fn query(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind,
            table: None,
            column: None,
            sqlstate: None,
            message: message.into(),
            source: None,
        })
    }
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }

    /// Unique constraint violation reported by a row store.
    pub fn unique_violation(table: &str, column: &str) -> Self {
        Self {
            kind: QueryErrorKind::Constraint,
            table: Some(table.to_string()),
            column: Some(column.to_string()),
            sqlstate: Some("23505".to_string()),
            message: format!("duplicate value for unique column {table}.{column}"),
            source: None,
        }
    }

    /// A transaction's writes no longer apply to the committed data.
    pub fn serialization_failure(table: &str, message: impl Into<String>) -> Self {
        Self {
            kind: QueryErrorKind::Serialization,
            table: Some(table.to_string()),
            column: None,
            sqlstate: Some("40001".to_string()),
            message: message.into(),
            source: None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::UniqueValue(e) => write!(f, "{e}"),
            Error::OptimisticLock(e) => write!(f, "{e}"),
            Error::InvalidNode(e) => write!(f, "{e}"),
            Error::NotLoaded(e) => write!(f, "{e}"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for UniqueValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unique value conflict on {}.{}",
            self.table, self.field
        )
    }
}

impl fmt::Display for OptimisticLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "optimistic lock failed for {} {}: row was modified or deleted",
            self.table, self.key
        )
    }
}

impl fmt::Display for InvalidNodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid node: {}", self.reason)
    }
}

impl fmt::Display for NotLoadedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "field {}.{} was not loaded by the query",
            self.table, self.column
        )
    }
}

impl std::error::Error for UniqueValueError {}
impl std::error::Error for OptimisticLockError {}
impl std::error::Error for InvalidNodeError {}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl From<UniqueValueError> for Error {
    fn from(err: UniqueValueError) -> Self {
        Error::UniqueValue(err)
    }
}

impl From<OptimisticLockError> for Error {
    fn from(err: OptimisticLockError) -> Self {
        Error::OptimisticLock(err)
    }
}

impl From<InvalidNodeError> for Error {
    fn from(err: InvalidNodeError) -> Self {
        Error::InvalidNode(err)
    }
}

impl From<NotLoadedError> for Error {
    fn from(err: NotLoadedError) -> Self {
        Error::NotLoaded(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for nodeorm operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_violation_helpers() {
        let query = QueryError::unique_violation("person", "email");
        assert!(query.is_unique_violation());
        assert_eq!(query.column.as_deref(), Some("email"));

        let err = Error::Query(query);
        assert_eq!(err.sqlstate(), Some("23505"));
        assert!(!err.is_conflict());
    }

    #[test]
    fn conflict_and_retry_flags() {
        let lock = Error::OptimisticLock(OptimisticLockError {
            table: "root_ul".to_string(),
            key: "1".to_string(),
        });
        assert!(lock.is_conflict());
        assert!(!lock.is_retryable());

        let raced = Error::query(QueryErrorKind::Serialization, "concurrent commit");
        assert!(raced.is_retryable());
        assert!(!raced.is_conflict());
    }

    #[test]
    fn display_names_the_offender() {
        let err = Error::UniqueValue(UniqueValueError {
            table: "leaf_u".to_string(),
            field: "root_u_id".to_string(),
        });
        assert_eq!(err.to_string(), "unique value conflict on leaf_u.root_u_id");
    }
}
