//! Storage engine module
//!
//! This module contains the storage engine components:
//! - Cells and rows
//! - B+ tree primary index
//! - Tables and their on-disk files
//! - Write-ahead log

pub mod btree;
pub mod table;
pub mod tuple;
pub mod wal;

pub use btree::BPlusTree;
pub use table::Table;
pub use tuple::{ArithOp, Cell, CompareOp, Row};
pub use wal::{committed_flags, LogManager, LogRecord, LOG_BEGIN_TRANSACTION, LOG_COMMIT};
