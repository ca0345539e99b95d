//! Error types for the object-daemon client.

use thiserror::Error;

use crate::wire::WireError;

/// A nonzero status code from the object daemon, mapped through the fixed
/// status table.
///
/// These describe object-store conditions (a missing path, a failed
/// revparse) and are recoverable: the connection stays usable and the
/// caller decides how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StatusError {
    /// Tree entry lookup by path failed.
    #[error("path not found")]
    PathNotFound,
    /// Revision could not be parsed or resolved.
    #[error("revparse failed")]
    RevparseFailed,
    /// The repository has no readme.
    #[error("no readme")]
    NoReadme,
    /// A blob was expected but something else was found.
    #[error("blob expected")]
    BlobExpected,
    /// A tree entry could not be converted to an object.
    #[error("tree entry to object conversion failed")]
    EntryConversionFailed,
    /// Raw blob content could not be read.
    #[error("blob read failed")]
    BlobReadFailed,
    /// The revision walk failed.
    #[error("revision walk failed")]
    WalkFailed,
    /// The revision walk could not be seeded.
    #[error("revision walk seed failed")]
    WalkSeedFailed,
    /// The daemon could not decode the request.
    #[error("malformed protocol data")]
    MalformedProtocol,
    /// Ref resolution failed.
    #[error("ref resolve failed")]
    RefResolveFailed,
    /// Branch listing failed.
    #[error("branch listing failed")]
    BranchListFailed,
    /// Commit lookup failed.
    #[error("commit lookup failed")]
    CommitLookupFailed,
    /// Diff computation failed.
    #[error("diff failed")]
    DiffFailed,
    /// The two commits share no merge base.
    #[error("no merge base")]
    NoMergeBase,
    /// Merge-base computation failed.
    #[error("merge base failed")]
    MergeBaseFailed,
    /// Ref update failed.
    #[error("update ref failed")]
    UpdateRefFailed,
    /// Commit creation failed.
    #[error("commit create failed")]
    CommitCreateFailed,
    /// Repository initialization: creation failed.
    #[error("init repo: create failed")]
    InitCreateFailed,
    /// Repository initialization: config could not be opened.
    #[error("init repo: open config failed")]
    InitConfigFailed,
    /// Repository initialization: hooks path could not be set.
    #[error("init repo: set hooks path failed")]
    InitHooksPathFailed,
    /// Repository initialization: push-option advertisement could not be
    /// enabled.
    #[error("init repo: set push option advertisement failed")]
    InitPushOptionsFailed,
    /// Repository initialization: directory creation failed.
    #[error("init repo: create directory failed")]
    InitMkdirFailed,
    /// A status code outside the table.
    #[error("unknown error (status {0})")]
    Unknown(u64),
}

impl StatusError {
    /// Maps a wire status code to a typed error; `None` means success.
    #[must_use]
    pub const fn from_status(code: u64) -> Option<Self> {
        match code {
            0 => None,
            3 => Some(Self::PathNotFound),
            4 => Some(Self::RevparseFailed),
            5 => Some(Self::NoReadme),
            6 => Some(Self::BlobExpected),
            7 => Some(Self::EntryConversionFailed),
            8 => Some(Self::BlobReadFailed),
            9 => Some(Self::WalkFailed),
            10 => Some(Self::WalkSeedFailed),
            11 => Some(Self::MalformedProtocol),
            12 => Some(Self::RefResolveFailed),
            13 => Some(Self::BranchListFailed),
            14 => Some(Self::CommitLookupFailed),
            15 => Some(Self::DiffFailed),
            16 => Some(Self::NoMergeBase),
            17 => Some(Self::MergeBaseFailed),
            18 => Some(Self::UpdateRefFailed),
            19 => Some(Self::CommitCreateFailed),
            20 => Some(Self::InitCreateFailed),
            21 => Some(Self::InitConfigFailed),
            22 => Some(Self::InitHooksPathFailed),
            23 => Some(Self::InitPushOptionsFailed),
            24 => Some(Self::InitMkdirFailed),
            other => Some(Self::Unknown(other)),
        }
    }
}

/// Errors produced by the object-daemon client.
#[derive(Debug, Error)]
pub enum ObjdError {
    /// Transport or codec failure.
    ///
    /// Fatal to the connection; never retried automatically.
    #[error("object daemon transport: {0}")]
    Wire(#[from] WireError),

    /// The daemon reported a nonzero status.
    ///
    /// Recoverable; the connection stays usable.
    #[error("object daemon: {0}")]
    Status(StatusError),

    /// The daemon's response did not have the shape the opcode promises.
    ///
    /// Fatal to the connection, like any protocol violation.
    #[error("malformed response: {reason}")]
    MalformedResponse {
        /// What was wrong.
        reason: String,
    },

    /// A tree-mutation update set could not be applied to the base tree.
    ///
    /// Caller error, not a daemon condition; the connection stays usable.
    #[error("tree update: {reason}")]
    InvalidUpdate {
        /// What was wrong.
        reason: String,
    },
}

impl ObjdError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            reason: reason.into(),
        }
    }

    /// Returns `true` when the connection remains usable after this error.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Status(_) | Self::InvalidUpdate { .. })
    }
}

/// Result type for object-daemon operations.
pub type ObjdResult<T> = Result<T, ObjdError>;
