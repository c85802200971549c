//! Result/status taxonomy for the store. Storage internals never bubble raw
//! `io::Error` past a module boundary; they translate into one of these.

use std::fmt;

/// Outcome of `CommitLog::put_message` / `DefaultMessageStore::put_message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMessageStatus {
    Ok,
    FlushDiskTimeout,
    FlushSlaveTimeout,
    SlaveNotAvailable,
    ServiceNotAvailable,
    CreateMapedFileFailed,
    MessageIllegal,
    PropertiesSizeExceeded,
    OsPageCacheBusy,
    UnknownError,
}

impl fmt::Display for PutMessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Outcome of a consume-queue / commit-log lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetMessageStatus {
    Found,
    NoMatchedMessage,
    MessageWasRemoving,
    OffsetFoundNull,
    OffsetOverflowBadly,
    OffsetOverflowOne,
    OffsetTooSmall,
    NoMatchedLogicQueue,
    NoMessageInQueue,
}

/// Status for `MappedFile::append`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendMessageStatus {
    Ok,
    EndOfFile,
    MessageSizeExceeded,
    PropertiesSizeExceeded,
    UnknownError,
}

#[derive(Debug, Clone)]
pub struct PutMessageResult {
    pub status: PutMessageStatus,
    pub wrote_offset: i64,
    pub wrote_bytes: i32,
    pub msg_id: String,
    pub store_timestamp: i64,
    pub queue_offset: i64,
}

impl PutMessageResult {
    pub fn failed(status: PutMessageStatus) -> PutMessageResult {
        PutMessageResult {
            status,
            wrote_offset: -1,
            wrote_bytes: 0,
            msg_id: String::new(),
            store_timestamp: 0,
            queue_offset: -1,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == PutMessageStatus::Ok
    }
}

/// Any I/O failure inside the store that cannot be represented as a status
/// code is surfaced as `StoreError` to the immediate caller, logged, and
/// translated to `PutMessageStatus::UnknownError` / `GetMessageStatus::*`
/// at the module boundary — it never escapes to the processor layer raw.
#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Corrupt(String),
    NotAvailable(&'static str),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "io error: {}", e),
            StoreError::Corrupt(s) => write!(f, "corrupt data: {}", s),
            StoreError::NotAvailable(s) => write!(f, "not available: {}", s),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> StoreError {
        StoreError::Io(e)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
