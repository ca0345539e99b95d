//! Record store: the relational state the admission logic reads and
//! writes.
//!
//! Only the fields admission needs are modeled here: users and their
//! public keys, repositories and their contribution policies, maintainer
//! grants, merge requests, and federated identities. The store is a trait
//! so the daemon can run against SQLite ([`sqlite::SqliteStore`]) while
//! tests use an in-memory fake ([`memory::MemoryStore`]).
//!
//! # Invariants
//!
//! - At most one merge request exists per (repository, source ref); the
//!   constraint lives in the store, not in caller logic, so concurrent
//!   pushes to the same new branch serialize there.
//! - Merge requests are numbered per repository by `local_id`, starting
//!   at 1.
//! - A merge request's creator is optional; an absent creator means the
//!   branch was pushed anonymously and can never be updated again.

pub mod memory;
pub mod sqlite;

use graft_core::models::{ContributionPolicy, UserKind};
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Error type for record-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A merge request already tracks this source ref in this repository.
    #[error("a merge request already exists for {source_ref:?}")]
    DuplicateSourceRef {
        /// The contested source ref.
        source_ref: String,
    },

    /// The repository id is unknown.
    #[error("unknown repository {repo_id}")]
    UnknownRepo {
        /// The missing id.
        repo_id: i64,
    },

    /// The user id is unknown.
    #[error("unknown user {user_id}")]
    UnknownUser {
        /// The missing id.
        user_id: i64,
    },

    /// Backend failure.
    #[error("record store: {message}")]
    Backend {
        /// Backend-specific description.
        message: String,
    },
}

/// One merge request row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    /// Owning repository.
    pub repo_id: i64,
    /// Per-repository sequence number, starting at 1.
    pub local_id: u64,
    /// Creating user, or `None` for an anonymous push.
    pub creator: Option<i64>,
    /// Source ref name relative to `refs/heads/` (e.g. `contrib/foo`).
    pub source_ref: String,
    /// Destination branch, when one has been chosen.
    pub dest_branch: Option<String>,
    /// Lifecycle status (`open`, `merged`, `closed`).
    pub status: String,
    /// Title, when one has been set.
    pub title: Option<String>,
}

/// Everything the push path needs to know about a pusher and a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushAccess {
    /// The pusher's user id, when the public key is known.
    pub user_id: Option<i64>,
    /// How the pusher is known to the forge.
    pub user_kind: UserKind,
    /// Whether the pusher may bypass contribution policy entirely.
    pub direct_access: bool,
    /// The repository's contribution policy.
    pub policy: ContributionPolicy,
}

/// Atomic operations over the forge's relational state.
pub trait RecordStore: Send + Sync {
    /// Reads the pusher's access and the repository's contribution policy.
    ///
    /// An empty `pubkey` resolves to no user.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownRepo`] if the repository does not exist.
    fn resolve_push_access(&self, repo_id: i64, pubkey: &str) -> Result<PushAccess, StoreError>;

    /// Creates a merge request, unique per (repository, source ref), and
    /// returns its per-repository sequence number.
    ///
    /// # Errors
    ///
    /// [`StoreError::DuplicateSourceRef`] if one already tracks this ref.
    fn create_merge_request(
        &self,
        repo_id: i64,
        creator: Option<i64>,
        source_ref: &str,
    ) -> Result<u64, StoreError>;

    /// Finds the merge request tracking `source_ref`, if any.
    fn find_merge_request(
        &self,
        repo_id: i64,
        source_ref: &str,
    ) -> Result<Option<MergeRequest>, StoreError>;

    /// Provisions a pubkey-only user for an unknown public key and returns
    /// its id.
    fn add_pubkey_user(&self, pubkey: &str) -> Result<i64, StoreError>;

    /// Marks a user as federated and records the verified identity.
    ///
    /// Both writes happen atomically; a user already past `pubkey_only`
    /// keeps their kind.
    fn mark_user_federated(
        &self,
        user_id: i64,
        service: &str,
        remote_username: &str,
    ) -> Result<(), StoreError>;
}
