//! Statement execution module
//!
//! This module contains the statement model and the dispatch boundary that
//! runs statements against the engine.

pub mod executor;
pub mod statement;

pub use executor::{EvalMode, QueryResult, StatementHandler};
pub use statement::Statement;
