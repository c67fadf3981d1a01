//! QuarryDB - A transactional table storage engine written in Rust
//!
//! This library provides the core components of a small relational store:
//! - Typed cells and rows
//! - B+ tree primary index per table
//! - Shared/exclusive session locks with strict two-phase locking
//! - Write-ahead log with recovery of committed transactions
//! - Databases, the manager that owns them, and statement dispatch

pub mod catalog;
pub mod config;
pub mod error;
pub mod executor;
pub mod storage;
pub mod transaction;

pub use catalog::{Column, ColumnType, Database, Manager, RecoveryReport};
pub use config::{Config, ConfigBuilder};
pub use error::{Error, ErrorKind, Result};
pub use executor::{EvalMode, QueryResult, Statement, StatementHandler};
pub use storage::{Cell, Row, Table};
pub use transaction::{CancelToken, LockMode, SessionId, SessionLock};
