use thiserror::Error;

use crate::store::ObjectId;

/// Errors raised while decoding the archive's object store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object not found: {0}")]
    MissingObject(ObjectId),

    #[error("corrupt object {id}: {reason}")]
    CorruptObject { id: ObjectId, reason: String },

    #[error("corrupt pack {pack} at offset {offset}: {reason}")]
    CorruptPack {
        pack: String,
        offset: u64,
        reason: String,
    },

    #[error("pack index {path} is corrupted: {reason}")]
    IndexCorrupted { path: String, reason: String },

    #[error("object {id} is a {actual}, expected a {expected}")]
    UnexpectedKind {
        id: ObjectId,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("invalid delta: {0}")]
    InvalidDelta(String),

    #[error("invalid object id: {0}")]
    InvalidObjectId(String),

    #[error("not a valid archive: {0}")]
    InvalidRepository(String),

    #[error("seek to {offset} is past the end of content ({size} bytes)")]
    SeekOutOfRange { offset: u64, size: u64 },

    #[error("{0} is not a file")]
    NotAFile(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
