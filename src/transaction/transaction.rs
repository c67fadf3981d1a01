//! Transaction bookkeeping
//!
//! Tracks which sessions are inside an explicit transaction, the database
//! each transaction runs against, and which table locks it holds. Locks
//! recorded here are released together when the transaction finishes
//! (strict two-phase locking).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::lock::SessionId;
use crate::catalog::Database;
use crate::error::{Error, Result};
use crate::storage::Table;

#[derive(Debug)]
struct OpenTransaction {
    database: Arc<Database>,
    /// The session took the database S lock when the transaction began
    owns_database_lock: bool,
    /// Table name -> locked tables under that name
    tables: BTreeMap<String, Vec<Arc<Table>>>,
}

/// What a finished transaction leaves behind to release
#[derive(Debug)]
pub struct FinishedTransaction {
    pub database: Arc<Database>,
    pub owns_database_lock: bool,
    pub tables: Vec<Arc<Table>>,
}

/// Open transactions and the tables each one has locked
#[derive(Debug, Default)]
pub struct TransactionTable {
    active: HashMap<SessionId, OpenTransaction>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter a transaction against `database` with an empty lock set
    pub fn begin(
        &mut self,
        session: SessionId,
        database: Arc<Database>,
        owns_database_lock: bool,
    ) -> Result<()> {
        if self.active.contains_key(&session) {
            return Err(Error::AlreadyInTransaction(session));
        }
        self.active.insert(
            session,
            OpenTransaction {
                database,
                owns_database_lock,
                tables: BTreeMap::new(),
            },
        );
        Ok(())
    }

    pub fn is_active(&self, session: SessionId) -> bool {
        self.active.contains_key(&session)
    }

    /// Database the session's transaction runs against
    pub fn database(&self, session: SessionId) -> Result<Arc<Database>> {
        self.active
            .get(&session)
            .map(|t| Arc::clone(&t.database))
            .ok_or(Error::NotInTransaction(session))
    }

    /// Remember that `session` locked `table`. Recording the same table
    /// twice is a no-op; a table dropped and recreated under the same name is
    /// a different table and is kept alongside the old one.
    pub fn record_lock(&mut self, session: SessionId, table: &Arc<Table>) -> Result<()> {
        let txn = self
            .active
            .get_mut(&session)
            .ok_or(Error::NotInTransaction(session))?;
        let tables = txn.tables.entry(table.name().to_string()).or_default();
        if !tables.iter().any(|t| Arc::ptr_eq(t, table)) {
            tables.push(Arc::clone(table));
        }
        Ok(())
    }

    /// Leave the transaction, handing back every lock that must now be
    /// released
    pub fn finish(&mut self, session: SessionId) -> Result<FinishedTransaction> {
        let txn = self
            .active
            .remove(&session)
            .ok_or(Error::NotInTransaction(session))?;
        Ok(FinishedTransaction {
            database: txn.database,
            owns_database_lock: txn.owns_database_lock,
            tables: txn.tables.into_values().flatten().collect(),
        })
    }

    /// No session is inside a transaction
    pub fn is_quiet(&self) -> bool {
        self.active.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}
