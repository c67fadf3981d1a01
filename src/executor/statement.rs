//! Statements accepted by the dispatch boundary
//!
//! SQL parsing and WHERE-clause resolution happen upstream; what reaches the
//! engine is a typed [`Statement`] naming the table and the concrete rows or
//! primary keys it touches. Statements are logged in a one-line text form.

use serde::{Deserialize, Serialize};

use crate::catalog::Column;
use crate::error::Result;
use crate::storage::{Cell, Row, LOG_BEGIN_TRANSACTION, LOG_COMMIT};

/// A statement issued by a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Statement {
    /// BEGIN TRANSACTION
    Begin,
    /// COMMIT
    Commit,
    CreateDatabase {
        name: String,
    },
    DropDatabase {
        name: String,
    },
    UseDatabase {
        name: String,
    },
    CreateTable {
        table: String,
        columns: Vec<Column>,
    },
    DropTable {
        table: String,
    },
    /// Describe a table's columns
    ShowTable {
        table: String,
    },
    Insert {
        table: String,
        rows: Vec<Row>,
    },
    /// Delete the rows with these primary keys
    Delete {
        table: String,
        keys: Vec<Cell>,
    },
    /// Replace the rows at `old_keys` with `new_rows`
    Update {
        table: String,
        old_keys: Vec<Cell>,
        new_rows: Vec<Row>,
    },
    /// Full scan, or point lookup when `key` is given
    Select {
        table: String,
        #[serde(default)]
        key: Option<Cell>,
    },
    /// Persist everything and shut down
    Quit,
}

impl Statement {
    /// One-line text written to the log. Fails on cells the log could not
    /// read back.
    pub fn to_log_text(&self) -> Result<String> {
        for cell in self.cells() {
            cell.check_storable()?;
        }
        Ok(match self {
            Statement::Begin => LOG_BEGIN_TRANSACTION.to_string(),
            Statement::Commit => LOG_COMMIT.to_string(),
            other => serde_json::to_string(other)?,
        })
    }

    /// Parse text produced by [`Statement::to_log_text`]
    pub fn from_log_text(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.eq_ignore_ascii_case(LOG_BEGIN_TRANSACTION) {
            return Ok(Statement::Begin);
        }
        if text.eq_ignore_ascii_case(LOG_COMMIT) {
            return Ok(Statement::Commit);
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Every cell the statement carries
    fn cells(&self) -> Vec<&Cell> {
        match self {
            Statement::Insert { rows, .. } => rows.iter().flat_map(|r| r.cells()).collect(),
            Statement::Delete { keys, .. } => keys.iter().collect(),
            Statement::Update {
                old_keys, new_rows, ..
            } => old_keys
                .iter()
                .chain(new_rows.iter().flat_map(|r| r.cells()))
                .collect(),
            Statement::Select { key, .. } => key.iter().collect(),
            _ => Vec::new(),
        }
    }

    /// Statement keyword, for messages
    pub fn name(&self) -> &'static str {
        match self {
            Statement::Begin => "BEGIN",
            Statement::Commit => "COMMIT",
            Statement::CreateDatabase { .. } => "CREATE DATABASE",
            Statement::DropDatabase { .. } => "DROP DATABASE",
            Statement::UseDatabase { .. } => "USE",
            Statement::CreateTable { .. } => "CREATE TABLE",
            Statement::DropTable { .. } => "DROP TABLE",
            Statement::ShowTable { .. } => "SHOW TABLE",
            Statement::Insert { .. } => "INSERT",
            Statement::Delete { .. } => "DELETE",
            Statement::Update { .. } => "UPDATE",
            Statement::Select { .. } => "SELECT",
            Statement::Quit => "QUIT",
        }
    }

    /// Row mutations and table definitions, which are written to the log
    pub fn is_logged(&self) -> bool {
        matches!(
            self,
            Statement::Insert { .. }
                | Statement::Delete { .. }
                | Statement::Update { .. }
                | Statement::CreateTable { .. }
                | Statement::DropTable { .. }
        )
    }

    /// Statements that run against a table of the current database and are
    /// wrapped in a transaction
    pub fn is_table_statement(&self) -> bool {
        matches!(
            self,
            Statement::CreateTable { .. }
                | Statement::DropTable { .. }
                | Statement::ShowTable { .. }
                | Statement::Insert { .. }
                | Statement::Delete { .. }
                | Statement::Update { .. }
                | Statement::Select { .. }
        )
    }

    /// Tables to lock in S mode, sorted
    pub fn shared_tables(&self) -> Vec<&str> {
        match self {
            Statement::Select { table, .. } | Statement::ShowTable { table } => {
                vec![table.as_str()]
            }
            _ => Vec::new(),
        }
    }

    /// Tables to lock in X mode, sorted
    pub fn exclusive_tables(&self) -> Vec<&str> {
        match self {
            Statement::Insert { table, .. }
            | Statement::Delete { table, .. }
            | Statement::Update { table, .. }
            | Statement::DropTable { table } => vec![table.as_str()],
            _ => Vec::new(),
        }
    }
}
