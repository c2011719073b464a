//! Error taxonomy (spec §7).
//!
//! Each subsystem gets its own `thiserror`-derived enum; `RoomError`
//! composes them with `#[from]`. `ErrorKind` maps every variant onto the
//! five policy buckets from spec §7 so callers can branch on retry/surface/
//! abort semantics without matching every concrete variant.

use thiserror::Error;

/// Policy bucket a [`RoomError`] falls into (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retried internally; only surfaces if it persists past a deadline.
    Transient,
    /// Record/frame dropped, engine continues, `mistake` event fires.
    Invalid,
    /// Rejected at apply; no view change; surfaced to the caller.
    Unauthorised,
    /// Engine moves to `error` state; no further appends accepted.
    Fatal,
    /// Clean teardown; no error surfaced beyond "closed".
    UserAbort,
}

#[derive(Debug, Error)]
pub enum BlockStoreError {
    #[error("local peer does not own the signing key for this block store")]
    NotWritable,
    #[error("block {0} has not been replicated yet")]
    Missing(u64),
    #[error("merkle verification failed for block {0}")]
    CorruptBlock(u64),
    #[error("signature verification failed for block store root")]
    BadSignature,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode/decode error: {0}")]
    Codec(String),
}

#[derive(Debug, Error)]
pub enum AutobaseError {
    #[error("block store error: {0}")]
    BlockStore(#[from] BlockStoreError),
    #[error("writer {0} is not currently admitted")]
    WriterNotAdmitted(String),
    #[error("apply handler failed for record at position {0}: {1}")]
    ApplyFailed(u64, String),
}

#[derive(Debug, Error)]
pub enum ViewError {
    #[error("block store error: {0}")]
    BlockStore(#[from] BlockStoreError),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("invite already exists for room; delete it before creating another")]
    InviteAlreadyExists,
    #[error("driveKey is write-once and already set for this room")]
    DriveKeyAlreadySet,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown command tag {0}")]
    UnknownTag(u8),
    #[error("schema decode failed for tag {0}: {1}")]
    DecodeFailed(u8, String),
}

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("path must be absolute and must not contain '..': {0}")]
    InvalidPath(String),
    #[error("no entry at path: {0}")]
    NotFound(String),
    #[error("block store error: {0}")]
    BlockStore(#[from] BlockStoreError),
    #[error("requested range is out of bounds for blob of size {size}")]
    RangeOutOfBounds { size: u64 },
}

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("invite signature verification failed")]
    BadSignature,
    #[error("invite has expired")]
    Expired,
    #[error("invite has already been consumed")]
    AlreadyConsumed,
    #[error("swarm error: {0}")]
    Swarm(#[from] anyhow::Error),
    #[error("pairing was cancelled before completion")]
    Aborted,
    #[error("malformed pairing message: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum RoomError {
    #[error(transparent)]
    BlockStore(#[from] BlockStoreError),
    #[error(transparent)]
    Autobase(#[from] AutobaseError),
    #[error(transparent)]
    View(#[from] ViewError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Drive(#[from] DriveError),
    #[error(transparent)]
    Pairing(#[from] PairingError),
    #[error("swarm error: {0}")]
    Swarm(anyhow::Error),
    #[error("engine is closed")]
    Closed,
}

fn block_store_kind(e: &BlockStoreError) -> ErrorKind {
    match e {
        BlockStoreError::Missing(_) => ErrorKind::Transient,
        BlockStoreError::CorruptBlock(_) | BlockStoreError::BadSignature | BlockStoreError::Io(_) => {
            ErrorKind::Fatal
        }
        BlockStoreError::NotWritable => ErrorKind::Unauthorised,
        BlockStoreError::Codec(_) => ErrorKind::Invalid,
    }
}

impl RoomError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RoomError::BlockStore(e) => block_store_kind(e),
            RoomError::Autobase(AutobaseError::WriterNotAdmitted(_)) => ErrorKind::Unauthorised,
            RoomError::Autobase(AutobaseError::ApplyFailed(_, _)) => ErrorKind::Invalid,
            RoomError::Autobase(AutobaseError::BlockStore(e)) => block_store_kind(e),
            RoomError::View(ViewError::InviteAlreadyExists)
            | RoomError::View(ViewError::DriveKeyAlreadySet)
            | RoomError::View(ViewError::NotFound(_)) => ErrorKind::Invalid,
            RoomError::View(ViewError::BlockStore(e)) => block_store_kind(e),
            RoomError::Dispatch(_) => ErrorKind::Invalid,
            RoomError::Drive(DriveError::InvalidPath(_))
            | RoomError::Drive(DriveError::NotFound(_))
            | RoomError::Drive(DriveError::RangeOutOfBounds { .. }) => ErrorKind::Invalid,
            RoomError::Drive(DriveError::BlockStore(e)) => block_store_kind(e),
            RoomError::Pairing(PairingError::BadSignature) => ErrorKind::Invalid,
            RoomError::Pairing(PairingError::Expired) => ErrorKind::Invalid,
            RoomError::Pairing(PairingError::AlreadyConsumed) => ErrorKind::Unauthorised,
            RoomError::Pairing(PairingError::Swarm(_)) => ErrorKind::Transient,
            RoomError::Pairing(PairingError::Aborted) => ErrorKind::UserAbort,
            RoomError::Pairing(PairingError::Malformed(_)) => ErrorKind::Invalid,
            RoomError::Swarm(_) => ErrorKind::Transient,
            RoomError::Closed => ErrorKind::Fatal,
        }
    }
}
