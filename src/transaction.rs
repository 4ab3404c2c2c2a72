use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::database::Database;
use crate::errors::DbResult;

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(0);

/// The identity under which page reads, writes, locks and flushes are
/// attributed. Process-monotonic; carried by value, never bound to a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(u64);

impl TransactionId {
    pub fn new() -> Self {
        TransactionId(NEXT_TRANSACTION_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// A thin handle over a transaction id. Completion goes through the buffer
/// pool, which flushes-or-restores the pages this transaction dirtied and
/// releases its locks.
#[derive(Debug)]
pub struct Transaction {
    tid: TransactionId,
}

impl Transaction {
    pub fn new() -> Self {
        Transaction {
            tid: TransactionId::new(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.tid
    }

    pub fn commit(&self, db: &Database) -> DbResult<()> {
        db.buffer_pool().transaction_complete(db, self.tid, true)
    }

    pub fn abort(&self, db: &Database) -> DbResult<()> {
        db.buffer_pool().transaction_complete(db, self.tid, false)
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}
