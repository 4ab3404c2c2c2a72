//! The Write-Ahead Log collaborator.
//!
//! The buffer pool logs a before/after pair and forces the log before any
//! page of a committing transaction reaches disk. Replaying the log after a
//! crash is out of scope; the records exist so the flush path observes the
//! WAL rule.

use bytes::{Buf, BufMut, BytesMut};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::errors::DbResult;
use crate::page::PageId;
use crate::transaction::TransactionId;

/// A Log Sequence Number: the byte offset of a record in the log file.
pub type Lsn = u64;

/// Fixed framing in front of every record: total length (including the
/// header), the owning transaction, and a CRC of the record body.
const LOG_HEADER_LEN: usize = 4 + 8 + 4;

/// A single record in the log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum LogRecord {
    /// A page update: the full before- and after-images.
    Write {
        tid: TransactionId,
        pid: PageId,
        before: Vec<u8>,
        after: Vec<u8>,
    },
    /// The commit of a transaction.
    Commit { tid: TransactionId },
    /// The abort of a transaction.
    Abort { tid: TransactionId },
}

impl LogRecord {
    pub fn tid(&self) -> TransactionId {
        match self {
            LogRecord::Write { tid, .. } => *tid,
            LogRecord::Commit { tid } => *tid,
            LogRecord::Abort { tid } => *tid,
        }
    }
}

/// The append-only log file.
pub struct LogFile {
    file: File,
    path: PathBuf,
    next_lsn: Lsn,
}

impl LogFile {
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let path_buf = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path_buf)?;
        let next_lsn = file.metadata()?.len();
        crate::regolith_debug_log!(
            "[LogFile::open] opened {:?}, next lsn {}",
            path_buf,
            next_lsn
        );
        Ok(LogFile {
            file,
            path: path_buf,
            next_lsn,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a Write record for one page update. The caller forces the
    /// log before writing the page itself.
    pub fn log_write(
        &mut self,
        tid: TransactionId,
        pid: PageId,
        before: &[u8],
        after: &[u8],
    ) -> DbResult<Lsn> {
        let record = LogRecord::Write {
            tid,
            pid,
            before: before.to_vec(),
            after: after.to_vec(),
        };
        Ok(self.append(&record)?)
    }

    /// Appends a Commit record and forces the log.
    pub fn log_commit(&mut self, tid: TransactionId) -> DbResult<Lsn> {
        let lsn = self.append(&LogRecord::Commit { tid })?;
        self.force()?;
        Ok(lsn)
    }

    /// Appends an Abort record and forces the log.
    pub fn log_abort(&mut self, tid: TransactionId) -> DbResult<Lsn> {
        let lsn = self.append(&LogRecord::Abort { tid })?;
        self.force()?;
        Ok(lsn)
    }

    /// Makes everything appended so far durable.
    pub fn force(&mut self) -> DbResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn append(&mut self, record: &LogRecord) -> io::Result<Lsn> {
        let body = bincode::serialize(record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut hasher = Hasher::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        let mut frame = BytesMut::with_capacity(LOG_HEADER_LEN + body.len());
        frame.put_u32((LOG_HEADER_LEN + body.len()) as u32);
        frame.put_u64(record.tid().raw());
        frame.put_u32(crc);
        frame.put_slice(&body);

        let lsn = self.next_lsn;
        self.file.seek(SeekFrom::Start(lsn))?;
        self.file.write_all(&frame)?;
        self.next_lsn += frame.len() as u64;
        Ok(lsn)
    }

    /// Reads the record at `lsn`, returning it with the next record's lsn.
    /// Returns `None` past the end of the log.
    pub fn read_record(&mut self, lsn: Lsn) -> DbResult<Option<(LogRecord, Lsn)>> {
        let len = self.file.metadata()?.len();
        if lsn >= len {
            return Ok(None);
        }

        self.file.seek(SeekFrom::Start(lsn))?;
        let mut header = [0u8; LOG_HEADER_LEN];
        self.file.read_exact(&mut header)?;
        let mut slice = &header[..];
        let total_len = slice.get_u32() as usize;
        let _tid = slice.get_u64();
        let crc = slice.get_u32();

        let mut body = vec![0u8; total_len - LOG_HEADER_LEN];
        self.file.read_exact(&mut body)?;

        let mut hasher = Hasher::new();
        hasher.update(&body);
        if hasher.finalize() != crc {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "log record crc mismatch",
            )
            .into());
        }

        let record = bincode::deserialize(&body)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some((record, lsn + total_len as u64)))
    }
}
