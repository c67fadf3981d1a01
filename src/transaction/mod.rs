//! Transaction module
//!
//! Session locks and transaction bookkeeping.

pub mod lock;
pub mod transaction;

pub use lock::{CancelToken, LockMode, LockWait, SessionId, SessionLock};
pub use transaction::{FinishedTransaction, TransactionTable};
