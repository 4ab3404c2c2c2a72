use std::fmt;
use std::io;

/// Errors surfaced by the public storage operations.
#[derive(Debug)]
pub enum DbError {
    /// The calling transaction must roll back (deadlock or interruption).
    TransactionAborted,
    /// A logical storage error: unknown table, all-dirty eviction, page
    /// kind mismatch, closed iterator.
    Db(String),
    /// An underlying file failure on a write path.
    Io(io::Error),
    /// Reading past the end of a file, or a short read.
    InvalidArgument(String),
}

pub type DbResult<T> = Result<T, DbError>;

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::TransactionAborted => write!(f, "transaction aborted"),
            DbError::Db(msg) => write!(f, "{}", msg),
            DbError::Io(err) => write!(f, "io error: {}", err),
            DbError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
        }
    }
}

impl std::error::Error for DbError {}

impl From<io::Error> for DbError {
    fn from(err: io::Error) -> Self {
        DbError::Io(err)
    }
}
