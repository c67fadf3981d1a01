//! Manager: process-wide registry of databases, sessions and transactions
//!
//! The manager is constructed once per installation root. Construction
//! replays every database's write-ahead log; [`Manager::quit`] writes all
//! state back out. Database-level session locks are always acquired before
//! any manager-internal mutex is taken, never while one is held.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use super::database::{validate_name, Database};
use crate::config::{Config, MANAGER_FILE};
use crate::error::{Error, Result};
use crate::executor::{EvalMode, QueryResult, Statement, StatementHandler};
use crate::storage::{committed_flags, Table};
use crate::transaction::{
    CancelToken, FinishedTransaction, LockMode, LockWait, SessionId, SessionLock,
    TransactionTable,
};

/// What startup recovery did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Databases opened from the registry file
    pub databases: usize,
    /// Committed statements applied
    pub replayed: usize,
    /// Statements of uncommitted transactions left out
    pub skipped: usize,
    /// Committed statements that failed to apply
    pub failed: usize,
}

#[derive(Debug, Default)]
struct SessionState {
    cancel: CancelToken,
    /// Database this session holds in S after switching to it
    database: Option<Arc<Database>>,
}

/// Database registry and session bookkeeping
#[derive(Debug)]
pub struct Manager {
    config: Config,
    /// Database name -> database, in creation order
    databases: RwLock<IndexMap<String, Arc<Database>>>,
    current: RwLock<Option<Arc<Database>>>,
    transactions: Mutex<TransactionTable>,
    sessions: Mutex<HashMap<SessionId, SessionState>>,
    next_session: AtomicU64,
    recovery: RecoveryReport,
}

impl Manager {
    /// Open the installation described by `config`, replaying committed log
    /// records of every known database, then select the default database.
    pub fn open(config: Config) -> Result<Self> {
        fs::create_dir_all(config.data_dir())?;

        let mut manager = Self {
            databases: RwLock::new(IndexMap::new()),
            current: RwLock::new(None),
            transactions: Mutex::new(TransactionTable::new()),
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            recovery: RecoveryReport::default(),
            config,
        };

        let mut report = RecoveryReport::default();
        let mut max_session = 0;
        for name in manager.read_registry()? {
            if manager.databases.read().contains_key(&name) {
                continue;
            }
            let db = Arc::new(Database::open(
                manager.config.database_dir(&name),
                name.as_str(),
                manager.config.sync_log,
            )?);
            manager.databases.write().insert(name, Arc::clone(&db));
            max_session = max_session.max(manager.recover_database(&db, &mut report)?);
            report.databases += 1;
        }
        manager.next_session.store(max_session + 1, Ordering::SeqCst);

        let default = manager.config.default_database.clone();
        let db = manager.create_database_if_not_exists(&default)?;
        *manager.current.write() = Some(db);
        manager.persist()?;

        tracing::info!(
            "recovered {} databases: {} statements replayed, {} uncommitted skipped, {} failed",
            report.databases,
            report.replayed,
            report.skipped,
            report.failed
        );
        manager.recovery = report;
        Ok(manager)
    }

    fn read_registry(&self) -> Result<Vec<String>> {
        let file = match File::open(self.config.manager_file()) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            let name = line.trim();
            if !name.is_empty() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    /// Replay the committed part of `db`'s log, then checkpoint it. Returns
    /// the largest session id seen.
    fn recover_database(&self, db: &Arc<Database>, report: &mut RecoveryReport) -> Result<u64> {
        let records = db.log().read_records()?;
        if records.is_empty() {
            return Ok(0);
        }
        let flags = committed_flags(&records);
        let handler = StatementHandler::new(self);
        let mut max_session = 0;

        for (record, committed) in records.iter().zip(flags) {
            max_session = max_session.max(record.session);
            if record.is_begin() || record.is_commit() {
                continue;
            }
            if !committed {
                tracing::warn!(
                    "skipping uncommitted statement of session {} in '{}': {}",
                    record.session,
                    db.name(),
                    record.statement
                );
                report.skipped += 1;
                continue;
            }
            let applied = Statement::from_log_text(&record.statement).and_then(|stmt| {
                handler.evaluate_in(db, record.session, stmt, EvalMode::Replay)
            });
            match applied {
                Ok(_) => report.replayed += 1,
                Err(e) => {
                    tracing::warn!(
                        "failed to replay statement of session {} in '{}': {}",
                        record.session,
                        db.name(),
                        e
                    );
                    report.failed += 1;
                }
            }
        }

        db.checkpoint()?;
        Ok(max_session)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Outcome of the recovery run at construction
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    // ========== Sessions ==========

    /// Hand out a new session id
    pub fn connect(&self) -> SessionId {
        let session = self.next_session.fetch_add(1, Ordering::SeqCst);
        self.sessions.lock().insert(session, SessionState::default());
        tracing::debug!("session {} connected", session);
        session
    }

    /// End a session, committing its open transaction and giving up the
    /// database it was using
    pub fn disconnect(&self, session: SessionId) -> Result<()> {
        let committed = if self.in_transaction(session) {
            self.commit_transaction(session)
        } else {
            Ok(())
        };
        if let Some(state) = self.sessions.lock().remove(&session) {
            if let Some(db) = state.database {
                db.lock().s_release(session);
            }
        }
        tracing::debug!("session {} disconnected", session);
        committed
    }

    /// Abort the session's blocked lock wait. Returns false when the session
    /// was not waiting.
    pub fn interrupt(&self, session: SessionId) -> bool {
        let token = match self.sessions.lock().get(&session) {
            Some(state) => state.cancel.clone(),
            None => return false,
        };
        token.cancel()
    }

    /// How long lock acquisitions by `session` may block
    pub fn lock_wait(&self, session: SessionId) -> LockWait {
        let wait = LockWait::forever().with_timeout(self.config.lock_timeout);
        match self.sessions.lock().get(&session) {
            Some(state) => wait.with_cancel(state.cancel.clone()),
            None => wait,
        }
    }

    fn acquire(&self, lock: &SessionLock, session: SessionId, mode: LockMode) -> Result<()> {
        let wait = self.lock_wait(session);
        lock.acquire(session, mode, &wait)
    }

    // ========== Databases ==========

    /// Create a database unless one of that name exists. Becomes the current
    /// database when none is selected.
    pub fn create_database_if_not_exists(&self, name: &str) -> Result<Arc<Database>> {
        validate_name(name)?;
        if name == MANAGER_FILE {
            return Err(Error::InvalidName(name.to_string()));
        }

        let db = {
            let mut databases = self.databases.write();
            if let Some(db) = databases.get(name) {
                return Ok(Arc::clone(db));
            }
            let db = Arc::new(Database::open(
                self.config.database_dir(name),
                name,
                self.config.sync_log,
            )?);
            databases.insert(name.to_string(), Arc::clone(&db));
            db
        };
        self.persist_registry()?;

        let mut current = self.current.write();
        if current.is_none() {
            *current = Some(Arc::clone(&db));
        }
        Ok(db)
    }

    /// Get a database by name
    pub fn get(&self, name: &str) -> Result<Arc<Database>> {
        self.databases
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::DatabaseNotFound(name.to_string()))
    }

    /// Known database names, in creation order
    pub fn database_names(&self) -> Vec<String> {
        self.databases.read().keys().cloned().collect()
    }

    /// Resolve `name` and lock it in `mode` for `session`. The registry is
    /// checked again after the wait in case the database went away.
    fn lock_database(&self, name: &str, session: SessionId, mode: LockMode) -> Result<Arc<Database>> {
        let db = self.get(name)?;
        self.acquire(db.lock(), session, mode)?;
        let still_registered = self
            .databases
            .read()
            .get(name)
            .map_or(false, |d| Arc::ptr_eq(d, &db));
        if !still_registered || db.is_dropped() {
            match mode {
                LockMode::Shared => db.lock().s_release(session),
                LockMode::Exclusive => db.lock().x_release(session),
            }
            return Err(Error::DatabaseNotFound(name.to_string()));
        }
        Ok(db)
    }

    /// Drop a database, waiting until no other session is using it
    pub fn delete_database(&self, name: &str, session: SessionId) -> Result<()> {
        let db = self.lock_database(name, session, LockMode::Exclusive)?;

        let dropped = db.drop_database();
        self.databases.write().shift_remove(name);
        {
            let mut current = self.current.write();
            if current.as_ref().map_or(false, |c| Arc::ptr_eq(c, &db)) {
                *current = None;
            }
        }
        if let Some(state) = self.sessions.lock().get_mut(&session) {
            if state.database.as_ref().map_or(false, |d| Arc::ptr_eq(d, &db)) {
                state.database = None;
            }
        }
        db.lock().release_all(session);
        dropped?;
        self.persist_registry()
    }

    /// Make `name` the current database, holding it in S for `session`
    pub fn switch_database(&self, name: &str, session: SessionId) -> Result<Arc<Database>> {
        let db = self.lock_database(name, session, LockMode::Shared)?;

        let previous = self
            .sessions
            .lock()
            .entry(session)
            .or_default()
            .database
            .replace(Arc::clone(&db));
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, &db) {
                previous.lock().s_release(session);
            }
        }
        *self.current.write() = Some(Arc::clone(&db));
        tracing::debug!("session {} switched to database '{}'", session, name);
        Ok(db)
    }

    /// The current database, if any
    pub fn current_database(&self) -> Option<Arc<Database>> {
        self.current.read().clone()
    }

    // ========== Transactions ==========

    pub fn in_transaction(&self, session: SessionId) -> bool {
        self.transactions.lock().is_active(session)
    }

    /// No session is inside a transaction
    pub fn is_quiet(&self) -> bool {
        self.transactions.lock().is_quiet()
    }

    /// Database the session's open transaction runs against
    pub fn transaction_database(&self, session: SessionId) -> Result<Arc<Database>> {
        self.transactions.lock().database(session)
    }

    /// Start a transaction on the current database and log it
    pub fn begin_transaction(&self, session: SessionId) -> Result<Arc<Database>> {
        if self.in_transaction(session) {
            return Err(Error::AlreadyInTransaction(session));
        }
        let current = self.current_database().ok_or(Error::NoDatabaseSelected)?;
        let already_held = current.lock().is_held_by(session, LockMode::Shared);
        let db = if already_held {
            current
        } else {
            self.lock_database(current.name(), session, LockMode::Shared)?
        };

        let begun = self
            .transactions
            .lock()
            .begin(session, Arc::clone(&db), !already_held);
        if let Err(e) = begun {
            if !already_held {
                db.lock().s_release(session);
            }
            return Err(e);
        }

        if let Err(e) = self.write_log(&db, Statement::Begin.to_log_text()?.as_str(), session) {
            self.release(self.transactions.lock().finish(session)?, session);
            return Err(e);
        }
        tracing::debug!("session {} began a transaction on '{}'", session, db.name());
        Ok(db)
    }

    /// Remember a table lock taken inside the session's transaction
    pub fn record_lock(&self, session: SessionId, table: &Arc<Table>) -> Result<()> {
        self.transactions.lock().record_lock(session, table)
    }

    /// Log the commit, release every lock of the transaction, then
    /// checkpoint if the log has grown past the threshold
    pub fn commit_transaction(&self, session: SessionId) -> Result<()> {
        let db = self.transaction_database(session)?;
        let logged = self.write_log(&db, Statement::Commit.to_log_text()?.as_str(), session);
        let finished = self.transactions.lock().finish(session)?;
        self.release(finished, session);
        logged?;
        tracing::debug!("session {} committed", session);
        self.maybe_checkpoint(&db)
    }

    fn release(&self, finished: FinishedTransaction, session: SessionId) {
        for table in &finished.tables {
            table.lock().release_all(session);
        }
        if finished.owns_database_lock {
            finished.database.lock().s_release(session);
        }
    }

    /// Checkpoint `db` when its log is over the threshold. Deferred while
    /// any session is inside a transaction.
    pub fn maybe_checkpoint(&self, db: &Database) -> Result<()> {
        if db.log().size()? <= self.config.checkpoint_threshold {
            return Ok(());
        }
        // Held across the checkpoint so no transaction can begin meanwhile
        let transactions = self.transactions.lock();
        if !transactions.is_quiet() {
            tracing::warn!(
                "deferring checkpoint of '{}': {} transactions open",
                db.name(),
                transactions.active_count()
            );
            return Ok(());
        }
        if db.is_dropped() {
            return Ok(());
        }
        db.checkpoint()
    }

    /// Append a record to `database`'s log
    pub fn write_log(&self, database: &Database, statement: &str, session: SessionId) -> Result<()> {
        database.log().append(session, statement)
    }

    // ========== Persistence ==========

    fn persist_registry(&self) -> Result<()> {
        let path = self.config.manager_file();
        let tmp_path = path.with_extension("tmp");
        {
            let databases = self.databases.read();
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            for name in databases.keys() {
                writeln!(writer, "{}", name)?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Write the registry file and every database's table metadata
    pub fn persist(&self) -> Result<()> {
        self.persist_registry()?;
        let databases: Vec<Arc<Database>> = self.databases.read().values().cloned().collect();
        for db in databases {
            db.persist_meta()?;
        }
        Ok(())
    }

    /// Write everything out. Databases are checkpointed when no transaction
    /// is open; otherwise only metadata is written and the logs are kept.
    pub fn quit(&self) -> Result<()> {
        let transactions = self.transactions.lock();
        let databases: Vec<Arc<Database>> = self.databases.read().values().cloned().collect();
        if transactions.is_quiet() {
            for db in &databases {
                db.checkpoint()?;
            }
        } else {
            tracing::warn!(
                "quitting with {} open transactions; keeping logs for recovery",
                transactions.active_count()
            );
            for db in &databases {
                db.persist_meta()?;
            }
        }
        drop(transactions);
        self.persist_registry()?;
        tracing::info!("persisted {} databases", databases.len());
        Ok(())
    }

    /// Run one statement for `session`, wrapping table statements in a
    /// transaction when none is open
    pub fn execute(&self, session: SessionId, statement: Statement) -> Result<QueryResult> {
        StatementHandler::new(self).execute(session, statement)
    }
}
