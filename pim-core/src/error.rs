//! The crate-wide error taxonomy: error kinds, their propagation policy,
//! and user-visible reporting.

use thiserror::Error;

use pim_contracts::id::EntityId;

/// One failure kind a job, the cache, or the recorder can report.
///
/// This is deliberately a closed, small set: every component maps its
/// failures onto one of these rather than inventing ad-hoc variants, so
/// that an embedder can match on `ErrorKind` once and get consistent
/// behavior across the cache, the synchronizers, and the recorder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Channel closed or a tag was lost. Fails every in-flight job; does
    /// not drop anything already queued in a Monitor.
    TransportFailure,
    /// Unexpected tokens or a literal-length mismatch from the channel.
    ProtocolError,
    /// Entity id no longer exists server-side.
    NotFound,
    /// Server rejected a Modify because the local revision is stale.
    RevisionConflict,
    /// Job was rolled back by the embedder; not a hard failure.
    UserCanceled,
    /// Sync terminated with orphaned remote nodes, or a disconnected
    /// local tree was found during bootstrap.
    IntegrityError,
    /// Journal unreadable at load or unwritable at save.
    JournalIoError,
}

impl ErrorKind {
    /// Machine-readable code surfaced through a job's `error_code`.
    pub fn error_code(self) -> &'static str {
        match self {
            ErrorKind::TransportFailure => "TRANSPORT_FAILURE",
            ErrorKind::ProtocolError => "PROTOCOL_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::RevisionConflict => "LLCONFLICT",
            ErrorKind::UserCanceled => "USER_CANCELED",
            ErrorKind::IntegrityError => "INTEGRITY_ERROR",
            ErrorKind::JournalIoError => "JOURNAL_IO_ERROR",
        }
    }
}

/// The crate-wide error type. Every public fallible operation returns
/// `Result<T, SyncError>`.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("entity {0} not found")]
    NotFound(EntityId),

    #[error("revision conflict on entity {entity}: local revision {local_revision}")]
    RevisionConflict {
        entity: EntityId,
        local_revision: u64,
    },

    #[error("operation canceled by the embedder")]
    UserCanceled,

    #[error("integrity error: {0}")]
    IntegrityError(String),

    #[error("journal I/O error: {0}")]
    JournalIoError(#[from] std::io::Error),

    #[error("malformed journal entry: {0}")]
    JournalFormatError(String),

    #[error(transparent)]
    Contract(#[from] pim_contracts::error::ContractError),
}

impl SyncError {
    /// The [`ErrorKind`] bucket this error reports under, for embedders
    /// that only care about the coarse category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::TransportFailure(_) => ErrorKind::TransportFailure,
            SyncError::ProtocolError(_) => ErrorKind::ProtocolError,
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::RevisionConflict { .. } => ErrorKind::RevisionConflict,
            SyncError::UserCanceled => ErrorKind::UserCanceled,
            SyncError::IntegrityError(_) => ErrorKind::IntegrityError,
            SyncError::JournalIoError(_) | SyncError::JournalFormatError(_) => {
                ErrorKind::JournalIoError
            }
            SyncError::Contract(_) => ErrorKind::ProtocolError,
        }
    }

    /// `error_code`/`error_text` pair a job exposes at completion.
    pub fn error_code(&self) -> &'static str {
        self.kind().error_code()
    }

    pub fn error_text(&self) -> String {
        self.to_string()
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
