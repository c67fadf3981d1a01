//! Catalog module
//!
//! This module contains column definitions, databases and the manager that
//! owns them.

pub mod database;
pub mod manager;
pub mod schema;
pub mod types;

pub use database::Database;
pub use manager::{Manager, RecoveryReport};
pub use schema::Column;
pub use types::ColumnType;
