//! Database: a registry of tables plus the write-ahead log they share
//!
//! On disk a database is a directory holding its log and a `tables/`
//! directory with one metadata file and one data file per table.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::schema::Column;
use crate::error::{Error, Result};
use crate::storage::table::{remove_if_exists, META_SUFFIX};
use crate::storage::{LogManager, Table};
use crate::transaction::SessionLock;

/// Name of the per-database log file
pub const LOG_FILE: &str = "log";
/// Name of the per-database table directory
pub const TABLES_DIR: &str = "tables";

/// Database and table names end up in file names
pub(crate) fn validate_name(name: &str) -> Result<()> {
    let legal = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !legal {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

/// A database and its tables
#[derive(Debug)]
pub struct Database {
    name: String,
    dir: PathBuf,
    tables_dir: PathBuf,
    /// Table name -> table
    tables: RwLock<HashMap<String, Arc<Table>>>,
    /// Held in S by sessions using the database, in X while dropping it
    lock: SessionLock,
    log: LogManager,
    dropped: AtomicBool,
}

impl Database {
    /// Open the database stored in `dir`, rebuilding every table from its
    /// metadata and data files.
    pub fn open(dir: impl Into<PathBuf>, name: impl Into<String>, sync_log: bool) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        let dir = dir.into();
        let tables_dir = dir.join(TABLES_DIR);
        fs::create_dir_all(&tables_dir)?;

        let mut meta_files: Vec<PathBuf> = fs::read_dir(&tables_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.ends_with(META_SUFFIX))
            })
            .collect();
        meta_files.sort();

        let mut tables = HashMap::new();
        for path in meta_files {
            let table_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(META_SUFFIX))
                .unwrap_or_default()
                .to_string();
            let columns = Table::read_meta(&path)?;
            let table = Table::open(&tables_dir, table_name.as_str(), columns)?;
            if tables.insert(table_name.clone(), Arc::new(table)).is_some() {
                return Err(Error::TableAlreadyExists(table_name));
            }
        }

        let log = LogManager::open(dir.join(LOG_FILE), sync_log)?;
        tracing::info!("opened database '{}' with {} tables", name, tables.len());

        Ok(Self {
            lock: SessionLock::new(name.clone()),
            name,
            dir,
            tables_dir,
            tables: RwLock::new(tables),
            log,
            dropped: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The database's session lock
    pub fn lock(&self) -> &SessionLock {
        &self.lock
    }

    /// The database's write-ahead log
    pub fn log(&self) -> &LogManager {
        &self.log
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_dropped() {
            return Err(Error::DatabaseNotFound(self.name.clone()));
        }
        Ok(())
    }

    /// Create a new, empty table and persist its metadata
    pub fn create(&self, name: &str, columns: Vec<Column>) -> Result<Arc<Table>> {
        self.create_with(name, columns, || Ok(()))
    }

    /// Create a table, calling `record` once the definition has been checked
    /// and before the table becomes visible. If `record` fails nothing is
    /// created.
    pub fn create_with<F>(
        &self,
        name: &str,
        columns: Vec<Column>,
        record: F,
    ) -> Result<Arc<Table>>
    where
        F: FnOnce() -> Result<()>,
    {
        self.ensure_live()?;
        validate_name(name)?;
        let mut tables = self.tables.write();
        if tables.contains_key(name) {
            return Err(Error::TableAlreadyExists(name.to_string()));
        }
        self.install(&mut tables, name, columns, record)
    }

    /// Create `name` afresh, discarding any table of that name first
    pub fn recreate(&self, name: &str, columns: Vec<Column>) -> Result<Arc<Table>> {
        self.ensure_live()?;
        validate_name(name)?;
        let mut tables = self.tables.write();
        if let Some(old) = tables.remove(name) {
            remove_if_exists(old.meta_path())?;
            old.drop_data()?;
        }
        self.install(&mut tables, name, columns, || Ok(()))
    }

    fn install<F>(
        &self,
        tables: &mut HashMap<String, Arc<Table>>,
        name: &str,
        columns: Vec<Column>,
        record: F,
    ) -> Result<Arc<Table>>
    where
        F: FnOnce() -> Result<()>,
    {
        // Leftover rows from an earlier table of the same name must not leak in
        remove_if_exists(&self.tables_dir.join(name))?;
        let table = Arc::new(Table::open(&self.tables_dir, name, columns)?);
        record()?;
        table.persist_meta()?;
        tables.insert(name.to_string(), Arc::clone(&table));

        tracing::info!("created table '{}.{}'", self.name, name);
        Ok(table)
    }

    /// Get a table by name
    pub fn get(&self, name: &str) -> Result<Arc<Table>> {
        self.ensure_live()?;
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TableNotFound(name.to_string()))
    }

    /// Check if a table exists
    pub fn contains(&self, name: &str) -> bool {
        self.tables.read().contains_key(name)
    }

    /// Remove a table's files, then forget it
    pub fn drop(&self, name: &str) -> Result<()> {
        self.drop_with(name, || Ok(()))
    }

    /// Drop a table, calling `record` after the table is found and before
    /// any file is removed
    pub fn drop_with<F>(&self, name: &str, record: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        self.ensure_live()?;
        let mut tables = self.tables.write();
        let table = tables
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TableNotFound(name.to_string()))?;
        record()?;

        remove_if_exists(table.meta_path())?;
        table.drop_data()?;
        tables.remove(name);

        tracing::info!("dropped table '{}.{}'", self.name, name);
        Ok(())
    }

    /// Drop every table and remove the database directory. The instance is
    /// unusable afterwards.
    pub fn drop_database(&self) -> Result<()> {
        self.ensure_live()?;
        let mut tables = self.tables.write();
        for table in tables.values() {
            remove_if_exists(table.meta_path())?;
            table.drop_data()?;
        }
        tables.clear();
        self.dropped.store(true, Ordering::SeqCst);

        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!("dropped database '{}'", self.name);
        Ok(())
    }

    /// All table names, sorted
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Write every table's metadata file
    pub fn persist_meta(&self) -> Result<()> {
        self.ensure_live()?;
        for table in self.tables.read().values() {
            table.persist_meta()?;
        }
        Ok(())
    }

    /// Write every table's data file
    pub fn persist_tables(&self) -> Result<()> {
        self.ensure_live()?;
        for table in self.tables.read().values() {
            table.persist()?;
        }
        Ok(())
    }

    /// Flush metadata and rows to disk
    pub fn persist(&self) -> Result<()> {
        self.persist_meta()?;
        self.persist_tables()
    }

    /// Flush all state, then empty the log
    pub fn checkpoint(&self) -> Result<()> {
        let size = self.log.size()?;
        self.persist()?;
        self.log.truncate()?;
        tracing::info!("checkpointed database '{}' ({} log bytes)", self.name, size);
        Ok(())
    }
}
