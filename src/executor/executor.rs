//! Statement Executor for QuarryDB
//!
//! This module is the statement-dispatch boundary: it takes table locks,
//! writes the log and applies statements to tables.

use serde::Serialize;
use std::sync::Arc;

use super::statement::Statement;
use crate::catalog::{Database, Manager};
use crate::error::{Error, Result};
use crate::storage::{Cell, Row};
use crate::transaction::{LockMode, SessionId};

/// Query result
#[derive(Debug, Serialize)]
pub struct QueryResult {
    /// Column names
    pub columns: Vec<String>,
    /// Result rows
    pub rows: Vec<Row>,
    /// Number of affected rows (for INSERT/UPDATE/DELETE)
    pub affected_rows: usize,
    /// Message
    pub message: Option<String>,
}

impl QueryResult {
    /// Create a new empty result
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            affected_rows: 0,
            message: None,
        }
    }

    /// Create a result with a message
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::empty()
        }
    }

    /// Create a result with affected rows count
    pub fn with_affected_rows(count: usize, message: impl Into<String>) -> Self {
        Self {
            affected_rows: count,
            message: Some(message.into()),
            ..Self::empty()
        }
    }

    /// Create a result holding rows
    pub fn with_rows(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows,
            ..Self::empty()
        }
    }
}

/// How a statement is being evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    /// Issued by a connected session: locks are taken and writes are logged
    Live,
    /// Re-applied from the log during recovery: no locks, no logging
    Replay,
}

/// Dispatches statements against a [`Manager`]
pub struct StatementHandler<'m> {
    manager: &'m Manager,
}

impl<'m> StatementHandler<'m> {
    pub fn new(manager: &'m Manager) -> Self {
        Self { manager }
    }

    /// Execute a statement. A table statement issued outside a transaction
    /// runs in its own transaction, which is committed even if the statement
    /// fails.
    pub fn execute(&self, session: SessionId, statement: Statement) -> Result<QueryResult> {
        if !statement.is_table_statement() || self.manager.in_transaction(session) {
            return self.evaluate(session, statement);
        }

        self.manager.begin_transaction(session)?;
        let result = self.evaluate(session, statement);
        let committed = self.manager.commit_transaction(session);
        match (result, committed) {
            (Ok(result), Ok(())) => Ok(result),
            (Err(e), committed) => {
                if let Err(commit_err) = committed {
                    tracing::warn!("autocommit of session {} failed: {}", session, commit_err);
                }
                Err(e)
            }
            (Ok(_), Err(e)) => Err(e),
        }
    }

    /// Evaluate a statement for a live session without autocommit
    pub fn evaluate(&self, session: SessionId, statement: Statement) -> Result<QueryResult> {
        tracing::debug!("session {} evaluates {}", session, statement.name());
        match statement {
            Statement::Begin => {
                let db = self.manager.begin_transaction(session)?;
                Ok(QueryResult::with_message(format!(
                    "Transaction started on database '{}'",
                    db.name()
                )))
            }
            Statement::Commit => {
                self.manager.commit_transaction(session)?;
                Ok(QueryResult::with_message("Transaction committed"))
            }
            Statement::CreateDatabase { name } => {
                self.manager.create_database_if_not_exists(&name)?;
                Ok(QueryResult::with_message(format!(
                    "Database '{}' created",
                    name
                )))
            }
            Statement::DropDatabase { name } => {
                self.refuse_in_transaction(session, "DROP DATABASE")?;
                self.manager.delete_database(&name, session)?;
                Ok(QueryResult::with_message(format!(
                    "Database '{}' dropped",
                    name
                )))
            }
            Statement::UseDatabase { name } => {
                self.refuse_in_transaction(session, "USE")?;
                self.manager.switch_database(&name, session)?;
                Ok(QueryResult::with_message(format!(
                    "Switched to database '{}'",
                    name
                )))
            }
            Statement::Quit => {
                self.manager.quit()?;
                Ok(QueryResult::with_message("Bye"))
            }
            table_statement => {
                let db = self.manager.transaction_database(session)?;
                self.evaluate_in(&db, session, table_statement, EvalMode::Live)
            }
        }
    }

    fn refuse_in_transaction(&self, session: SessionId, what: &'static str) -> Result<()> {
        if self.manager.in_transaction(session) {
            return Err(Error::NotAllowedInTransaction(what));
        }
        Ok(())
    }

    /// Evaluate a table statement against `db`. In live mode the statement's
    /// locks are taken and recorded first, then it is logged and applied.
    /// Table definitions are logged while the database's table map is held,
    /// so their record lands before any write to the new table.
    pub fn evaluate_in(
        &self,
        db: &Database,
        session: SessionId,
        statement: Statement,
        mode: EvalMode,
    ) -> Result<QueryResult> {
        if !statement.is_table_statement() {
            return Err(Error::Internal(format!(
                "{} cannot run against a table",
                statement.name()
            )));
        }

        let mut log_text = None;
        if mode == EvalMode::Live {
            self.lock_tables(db, session, &statement)?;
            if statement.is_logged() {
                log_text = Some(statement.to_log_text()?);
            }
        }
        let log = || match &log_text {
            Some(text) => self.manager.write_log(db, text, session),
            None => Ok(()),
        };

        match statement {
            Statement::CreateTable { table, columns } => {
                match mode {
                    EvalMode::Live => db.create_with(&table, columns, log)?,
                    EvalMode::Replay => db.recreate(&table, columns)?,
                };
                Ok(QueryResult::with_message(format!("Table '{}' created", table)))
            }
            Statement::DropTable { table } => {
                if mode == EvalMode::Live || db.contains(&table) {
                    db.drop_with(&table, log)?;
                }
                Ok(QueryResult::with_message(format!("Table '{}' dropped", table)))
            }
            other => {
                log()?;
                self.apply(db, other)
            }
        }
    }

    /// Take every lock the statement needs, in table name order
    fn lock_tables(&self, db: &Database, session: SessionId, statement: &Statement) -> Result<()> {
        let mut plan: Vec<(&str, LockMode)> = statement
            .shared_tables()
            .into_iter()
            .map(|t| (t, LockMode::Shared))
            .chain(
                statement
                    .exclusive_tables()
                    .into_iter()
                    .map(|t| (t, LockMode::Exclusive)),
            )
            .collect();
        plan.sort_by(|a, b| a.0.cmp(b.0));

        for (name, mode) in plan {
            let table = db.get(name)?;
            table
                .lock()
                .acquire(session, mode, &self.manager.lock_wait(session))?;
            self.manager.record_lock(session, &table)?;

            // The table may have been dropped (and recreated) while we waited
            let current = db.get(name)?;
            if !Arc::ptr_eq(&current, &table) {
                return Err(Error::TableNotFound(name.to_string()));
            }
        }
        Ok(())
    }

    /// Run a row statement whose locks and log record are in place
    fn apply(&self, db: &Database, statement: Statement) -> Result<QueryResult> {
        match statement {
            Statement::ShowTable { table } => {
                let table = db.get(&table)?;
                let rows = table
                    .columns()
                    .iter()
                    .map(|c| Row::new(vec![Cell::String(c.representation())]))
                    .collect();
                Ok(QueryResult::with_rows(vec!["column".to_string()], rows))
            }
            Statement::Insert { table, rows } => {
                let count = rows.len();
                db.get(&table)?.insert(rows)?;
                Ok(QueryResult::with_affected_rows(
                    count,
                    format!("{} row(s) inserted", count),
                ))
            }
            Statement::Delete { table, keys } => {
                db.get(&table)?.delete(&keys)?;
                Ok(QueryResult::with_affected_rows(
                    keys.len(),
                    format!("{} row(s) deleted", keys.len()),
                ))
            }
            Statement::Update {
                table,
                old_keys,
                new_rows,
            } => {
                let count = new_rows.len();
                db.get(&table)?.update(&old_keys, new_rows)?;
                Ok(QueryResult::with_affected_rows(
                    count,
                    format!("{} row(s) updated", count),
                ))
            }
            Statement::Select { table, key } => {
                let table = db.get(&table)?;
                let columns = table.columns().iter().map(|c| c.name.clone()).collect();
                let rows = match key {
                    Some(key) => match table.get(&key) {
                        Ok(row) => vec![row],
                        Err(Error::KeyNotFound(_)) => Vec::new(),
                        Err(e) => return Err(e),
                    },
                    None => table.scan(),
                };
                Ok(QueryResult::with_rows(columns, rows))
            }
            other => Err(Error::Internal(format!(
                "{} cannot run against a table",
                other.name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, ColumnType};
    use crate::config::Config;
    use crate::row;
    use tempfile::TempDir;

    fn create_test_manager(dir: &TempDir) -> Manager {
        let config = Config::builder()
            .root_dir(dir.path())
            .sync_log(false)
            .build();
        Manager::open(config).unwrap()
    }

    fn create_users(manager: &Manager, session: SessionId) {
        let stmt = Statement::CreateTable {
            table: "users".to_string(),
            columns: vec![
                Column::new("id", ColumnType::Int).primary_key(true),
                Column::string("name", 10),
            ],
        };
        manager.execute(session, stmt).unwrap();
    }

    fn insert(id: i32, name: &str) -> Statement {
        Statement::Insert {
            table: "users".to_string(),
            rows: vec![row![id, name]],
        }
    }

    fn select_all() -> Statement {
        Statement::Select {
            table: "users".to_string(),
            key: None,
        }
    }

    #[test]
    fn test_create_table() {
        let dir = TempDir::new().unwrap();
        let manager = create_test_manager(&dir);
        let session = manager.connect();

        create_users(&manager, session);
        let result = manager
            .execute(
                session,
                Statement::ShowTable {
                    table: "users".to_string(),
                },
            )
            .unwrap();
        assert_eq!(
            result.rows,
            vec![
                row!["id INT Primary Key"],
                row!["name STRING(10)"],
            ]
        );
    }

    #[test]
    fn test_insert_and_select() {
        let dir = TempDir::new().unwrap();
        let manager = create_test_manager(&dir);
        let session = manager.connect();
        create_users(&manager, session);

        let result = manager.execute(session, insert(2, "b")).unwrap();
        assert_eq!(result.affected_rows, 1);
        manager.execute(session, insert(1, "a")).unwrap();

        let result = manager.execute(session, select_all()).unwrap();
        assert_eq!(result.columns, vec!["id".to_string(), "name".to_string()]);
        assert_eq!(result.rows, vec![row![1, "a"], row![2, "b"]]);

        let result = manager
            .execute(
                session,
                Statement::Select {
                    table: "users".to_string(),
                    key: Some(Cell::Int(3)),
                },
            )
            .unwrap();
        assert!(result.rows.is_empty());
    }

    #[test]
    fn test_autocommit_logs_bracket() {
        let dir = TempDir::new().unwrap();
        let manager = create_test_manager(&dir);
        let session = manager.connect();
        create_users(&manager, session);
        manager.execute(session, insert(1, "a")).unwrap();
        assert!(!manager.in_transaction(session));

        let log = std::fs::read_to_string(dir.path().join("data/db/log")).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines[1], "begin transaction");
        assert!(lines[3].starts_with(r#"{"op":"create_table","table":"users""#));
        assert_eq!(lines[5], "commit");
        assert_eq!(lines[7], "begin transaction");
        assert_eq!(lines[9], insert(1, "a").to_log_text().unwrap());
        assert_eq!(lines[11], "commit");
        assert_eq!(lines.len(), 12);
    }

    #[test]
    fn test_failed_definitions_are_not_logged() {
        let dir = TempDir::new().unwrap();
        let manager = create_test_manager(&dir);
        let session = manager.connect();
        create_users(&manager, session);
        let db = manager.current_database().unwrap();
        let before = db.log().size().unwrap();

        manager.execute(session, Statement::Begin).unwrap();
        let stmt = Statement::CreateTable {
            table: "users".to_string(),
            columns: vec![Column::new("id", ColumnType::Int).primary_key(true)],
        };
        assert!(matches!(
            manager.execute(session, stmt),
            Err(Error::TableAlreadyExists(_))
        ));
        let stmt = Statement::CreateTable {
            table: "nokey".to_string(),
            columns: vec![Column::new("id", ColumnType::Int)],
        };
        assert!(manager.execute(session, stmt).is_err());
        let stmt = Statement::DropTable {
            table: "missing".to_string(),
        };
        assert!(manager.execute(session, stmt).is_err());

        let begin_record = format!("{}\nbegin transaction\n", session).len() as u64;
        assert_eq!(db.log().size().unwrap(), before + begin_record);
        manager.execute(session, Statement::Commit).unwrap();
    }

    #[test]
    fn test_non_finite_insert_is_rejected_before_logging() {
        let dir = TempDir::new().unwrap();
        let manager = create_test_manager(&dir);
        let session = manager.connect();
        manager
            .execute(
                session,
                Statement::CreateTable {
                    table: "m".to_string(),
                    columns: vec![
                        Column::new("id", ColumnType::Int).primary_key(true),
                        Column::new("v", ColumnType::Double),
                    ],
                },
            )
            .unwrap();

        manager.execute(session, Statement::Begin).unwrap();
        let result = manager.execute(
            session,
            Statement::Insert {
                table: "m".to_string(),
                rows: vec![row![1, f64::INFINITY]],
            },
        );
        assert!(matches!(result, Err(Error::NonFiniteFloat(_))));
        manager.execute(session, Statement::Commit).unwrap();

        let log = std::fs::read_to_string(dir.path().join("data/db/log")).unwrap();
        assert!(!log.contains(r#""op":"insert""#));
        assert!(manager.current_database().unwrap().get("m").unwrap().is_empty());
    }

    #[test]
    fn test_replay_of_definitions_tolerates_current_state() {
        let dir = TempDir::new().unwrap();
        let manager = create_test_manager(&dir);
        let session = manager.connect();
        create_users(&manager, session);
        manager.execute(session, insert(1, "a")).unwrap();
        let db = manager.current_database().unwrap();
        let handler = StatementHandler::new(&manager);

        // Replaying the create of an existing table starts it over
        let create = Statement::CreateTable {
            table: "users".to_string(),
            columns: vec![
                Column::new("id", ColumnType::Int).primary_key(true),
                Column::string("name", 10),
            ],
        };
        handler.evaluate_in(&db, 99, create, EvalMode::Replay).unwrap();
        assert!(db.get("users").unwrap().is_empty());

        let drop = || Statement::DropTable {
            table: "users".to_string(),
        };
        handler.evaluate_in(&db, 99, drop(), EvalMode::Replay).unwrap();
        assert!(!db.contains("users"));
        handler.evaluate_in(&db, 99, drop(), EvalMode::Replay).unwrap();
    }

    #[test]
    fn test_failed_statement_still_commits() {
        let dir = TempDir::new().unwrap();
        let manager = create_test_manager(&dir);
        let session = manager.connect();
        create_users(&manager, session);
        manager.execute(session, insert(1, "a")).unwrap();

        let result = manager.execute(session, insert(1, "again"));
        assert!(matches!(result, Err(Error::DuplicateKey(_))));
        assert!(!manager.in_transaction(session));
        let users = manager.current_database().unwrap().get("users").unwrap();
        assert!(users.lock().is_free());
    }

    #[test]
    fn test_evaluate_requires_transaction() {
        let dir = TempDir::new().unwrap();
        let manager = create_test_manager(&dir);
        let session = manager.connect();
        let handler = StatementHandler::new(&manager);
        assert!(matches!(
            handler.evaluate(session, select_all()),
            Err(Error::NotInTransaction(_))
        ));
    }

    #[test]
    fn test_locks_held_until_commit() {
        let dir = TempDir::new().unwrap();
        let manager = create_test_manager(&dir);
        let session = manager.connect();
        create_users(&manager, session);
        let users = manager.current_database().unwrap().get("users").unwrap();

        manager.execute(session, Statement::Begin).unwrap();
        manager.execute(session, select_all()).unwrap();
        assert!(users.lock().is_held_by(session, LockMode::Shared));
        manager.execute(session, insert(1, "a")).unwrap();
        assert!(users.lock().is_held_by(session, LockMode::Shared));
        assert!(users.lock().is_held_by(session, LockMode::Exclusive));

        manager.execute(session, Statement::Commit).unwrap();
        assert!(users.lock().is_free());
    }

    #[test]
    fn test_database_statements_refused_in_transaction() {
        let dir = TempDir::new().unwrap();
        let manager = create_test_manager(&dir);
        let session = manager.connect();
        manager
            .execute(
                session,
                Statement::CreateDatabase {
                    name: "other".to_string(),
                },
            )
            .unwrap();

        manager.execute(session, Statement::Begin).unwrap();
        let result = manager.execute(
            session,
            Statement::UseDatabase {
                name: "other".to_string(),
            },
        );
        assert!(matches!(result, Err(Error::NotAllowedInTransaction(_))));
        let result = manager.execute(
            session,
            Statement::DropDatabase {
                name: "other".to_string(),
            },
        );
        assert!(matches!(result, Err(Error::NotAllowedInTransaction(_))));
        manager.execute(session, Statement::Commit).unwrap();

        manager
            .execute(
                session,
                Statement::DropDatabase {
                    name: "other".to_string(),
                },
            )
            .unwrap();
        assert!(manager.get("other").is_err());
    }

    #[test]
    fn test_replay_skips_locks_and_log() {
        let dir = TempDir::new().unwrap();
        let manager = create_test_manager(&dir);
        let session = manager.connect();
        create_users(&manager, session);
        let db = manager.current_database().unwrap();
        let before = db.log().size().unwrap();

        let handler = StatementHandler::new(&manager);
        handler
            .evaluate_in(&db, 99, insert(5, "e"), EvalMode::Replay)
            .unwrap();
        assert_eq!(db.log().size().unwrap(), before);
        let users = db.get("users").unwrap();
        assert!(users.lock().is_free());
        assert_eq!(users.get(&Cell::Int(5)).unwrap(), row![5, "e"]);

        let result = handler.evaluate_in(&db, 99, Statement::Begin, EvalMode::Replay);
        assert!(matches!(result, Err(Error::Internal(_))));
    }
}
