use parking_lot::Mutex;
use std::path::Path;

use crate::buffer_pool::BufferPool;
use crate::catalog::Catalog;
use crate::errors::DbResult;
use crate::wal::LogFile;

/// The engine context: catalog, buffer pool and log, wired together once at
/// startup and passed explicitly into every public operation.
pub struct Database {
    catalog: Catalog,
    buffer_pool: BufferPool,
    log: Mutex<LogFile>,
}

impl Database {
    /// Opens a context with the given log file and buffer pool capacity.
    pub fn new<P: AsRef<Path>>(log_path: P, pool_capacity: usize) -> DbResult<Self> {
        Ok(Database {
            catalog: Catalog::new(),
            buffer_pool: BufferPool::new(pool_capacity),
            log: Mutex::new(LogFile::open(log_path)?),
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.buffer_pool
    }

    pub fn log(&self) -> &Mutex<LogFile> {
        &self.log
    }
}
