//! Write-Ahead Log (WAL) Manager
//!
//! Each database keeps one append-only text log. A record is two lines: the
//! session id, then the statement text. Statements are appended after their
//! locks are granted and before they are applied, so every logged statement
//! can be replayed against the state the log describes.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::transaction::SessionId;

/// Statement text marking the start of a transaction
pub const LOG_BEGIN_TRANSACTION: &str = "begin transaction";
/// Statement text marking a commit
pub const LOG_COMMIT: &str = "commit";

/// A single log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Session that issued the statement
    pub session: SessionId,
    /// Statement text
    pub statement: String,
}

impl LogRecord {
    pub fn new(session: SessionId, statement: impl Into<String>) -> Self {
        Self {
            session,
            statement: statement.into(),
        }
    }

    pub fn is_begin(&self) -> bool {
        self.statement == LOG_BEGIN_TRANSACTION
    }

    pub fn is_commit(&self) -> bool {
        self.statement == LOG_COMMIT
    }
}

/// Manages one database's write-ahead log file
#[derive(Debug)]
pub struct LogManager {
    path: PathBuf,
    /// Append handle; also serializes writers
    file: Mutex<File>,
    /// fsync after every append
    sync: bool,
}

impl LogManager {
    /// Open (creating if missing) the log file at `path`
    pub fn open(path: impl Into<PathBuf>, sync: bool) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            sync,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a log record
    pub fn append(&self, session: SessionId, statement: &str) -> Result<()> {
        if statement.contains(['\n', '\r']) {
            return Err(Error::Internal(format!(
                "log statement spans several lines: {:?}",
                statement
            )));
        }
        let mut file = self.file.lock();
        write!(file, "{}\n{}\n", session, statement)?;
        if self.sync {
            file.sync_data()?;
        }
        tracing::trace!("logged session {}: {}", session, statement);
        Ok(())
    }

    /// Read all records from disk (for recovery). An incomplete final record
    /// is reported and ignored.
    pub fn read_records(&self) -> Result<Vec<LogRecord>> {
        let _guard = self.file.lock();
        read_records(&self.path)
    }

    /// Current size of the log file in bytes
    pub fn size(&self) -> Result<u64> {
        let file = self.file.lock();
        Ok(file.metadata()?.len())
    }

    /// Discard every record
    pub fn truncate(&self) -> Result<()> {
        let file = self.file.lock();
        file.set_len(0)?;
        if self.sync {
            file.sync_all()?;
        }
        Ok(())
    }
}

/// Parse the log file at `path`. A missing file holds no records.
pub fn read_records(path: &Path) -> Result<Vec<LogRecord>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let lines = BufReader::new(file)
        .lines()
        .collect::<std::io::Result<Vec<String>>>()?;
    let mut records = Vec::with_capacity(lines.len() / 2);
    let mut pairs = lines.chunks_exact(2);
    for (i, pair) in pairs.by_ref().enumerate() {
        let session = pair[0].trim().parse::<SessionId>().map_err(|_| {
            Error::CorruptedLog(format!(
                "{}: bad session id '{}' at record {}",
                path.display(),
                pair[0],
                i
            ))
        })?;
        records.push(LogRecord::new(session, pair[1].clone()));
    }
    if !pairs.remainder().is_empty() {
        tracing::warn!(
            "ignoring incomplete trailing record in {}",
            path.display()
        );
    }
    Ok(records)
}

/// Mark which records belong to a committed transaction.
///
/// Scanning backwards, a session becomes committed at its `commit` record and
/// stops being committed once its `begin transaction` record is crossed. A
/// trailing bracket with no commit therefore stays unmarked.
pub fn committed_flags(records: &[LogRecord]) -> Vec<bool> {
    let mut committed = std::collections::HashSet::new();
    let mut flags = vec![false; records.len()];
    for (i, record) in records.iter().enumerate().rev() {
        if record.is_commit() {
            committed.insert(record.session);
        }
        flags[i] = committed.contains(&record.session);
        if record.is_begin() {
            committed.remove(&record.session);
        }
    }
    flags
}
