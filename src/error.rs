//! Error types for QuarryDB
//!
//! This module defines all error types used throughout the storage engine.

use thiserror::Error;

/// Coarse classification of an [`Error`], used by the statement layer to
/// decide how to report a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing/duplicate objects and rows that do not fit a table schema
    Schema,
    /// Primary key conflicts
    Key,
    /// Lock acquisition failed while blocked
    Lock,
    /// BEGIN/COMMIT used out of order
    Transaction,
    /// Illegal cell arithmetic or comparison
    Value,
    /// File system and log failures
    Io,
    /// Broken engine invariants
    Internal,
}

/// The main error type for QuarryDB
#[derive(Error, Debug)]
pub enum Error {
    // ========== Catalog Errors ==========
    #[error("Catalog error: database '{0}' not found")]
    DatabaseNotFound(String),

    #[error("Catalog error: no database selected")]
    NoDatabaseSelected,

    #[error("Catalog error: table '{0}' not found")]
    TableNotFound(String),

    #[error("Catalog error: table '{0}' already exists")]
    TableAlreadyExists(String),

    #[error("Catalog error: illegal name '{0}'")]
    InvalidName(String),

    // ========== Schema Errors ==========
    #[error("Schema error: table '{table}' must have exactly one primary key, found {found}")]
    PrimaryKeyCount { table: String, found: usize },

    #[error("Schema error: expected {expected} values, got {found}")]
    ColumnCountMismatch { expected: usize, found: usize },

    #[error("Schema error: invalid column definition - {0}")]
    InvalidColumn(String),

    // ========== Type Errors ==========
    #[error("Type error: cannot use {from} as {to}")]
    TypeMismatch { from: String, to: String },

    #[error("Type error: null value not allowed for column '{0}'")]
    NullNotAllowed(String),

    #[error("Type error: value of length {length} exceeds column '{column}' limit {max}")]
    ValueTooLarge {
        column: String,
        length: usize,
        max: usize,
    },

    #[error("Type error: division by zero")]
    DivisionByZero,

    #[error("Type error: arithmetic overflow")]
    ArithmeticOverflow,

    #[error("Type error: {0} cannot be stored, floating point values must be finite")]
    NonFiniteFloat(String),

    // ========== Key Errors ==========
    #[error("Key error: duplicate primary key {0}")]
    DuplicateKey(String),

    #[error("Key error: primary key {0} does not exist")]
    KeyNotFound(String),

    // ========== Transaction Errors ==========
    #[error("Transaction error: session {0} is already in a transaction")]
    AlreadyInTransaction(u64),

    #[error("Transaction error: session {0} is not in a transaction")]
    NotInTransaction(u64),

    #[error("Transaction error: {0} is not allowed inside a transaction")]
    NotAllowedInTransaction(&'static str),

    #[error("Transaction error: lock wait on '{0}' interrupted")]
    LockInterrupted(String),

    #[error("Transaction error: lock timeout on '{0}'")]
    LockTimeout(String),

    // ========== Log Errors ==========
    #[error("Log error: {0}")]
    CorruptedLog(String),

    // ========== I/O Errors ==========
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // ========== Internal Errors ==========
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DatabaseNotFound(_)
            | Error::NoDatabaseSelected
            | Error::TableNotFound(_)
            | Error::TableAlreadyExists(_)
            | Error::InvalidName(_)
            | Error::PrimaryKeyCount { .. }
            | Error::ColumnCountMismatch { .. }
            | Error::InvalidColumn(_)
            | Error::TypeMismatch { .. }
            | Error::NullNotAllowed(_)
            | Error::ValueTooLarge { .. } => ErrorKind::Schema,
            Error::DuplicateKey(_) | Error::KeyNotFound(_) => ErrorKind::Key,
            Error::LockInterrupted(_) | Error::LockTimeout(_) => ErrorKind::Lock,
            Error::AlreadyInTransaction(_)
            | Error::NotInTransaction(_)
            | Error::NotAllowedInTransaction(_) => ErrorKind::Transaction,
            Error::DivisionByZero | Error::ArithmeticOverflow | Error::NonFiniteFloat(_) => {
                ErrorKind::Value
            }
            Error::CorruptedLog(_) | Error::IoError(_) | Error::Serialization(_) => ErrorKind::Io,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Result type alias for QuarryDB operations
pub type Result<T> = std::result::Result<T, Error>;
