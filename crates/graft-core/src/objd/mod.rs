//! Client for the out-of-process object daemon.
//!
//! The object daemon owns the content-addressed object store; this module is
//! the only way the forge reads or writes commits, trees, blobs and refs.
//! Every operation is an opcode-tagged request/response exchange over a
//! Unix-domain stream using the [`crate::wire`] codec.
//!
//! # Connection discipline
//!
//! A [`Client`] owns its connection and allows exactly one outstanding call
//! at a time; it is deliberately not `Clone`. Concurrent callers must each
//! open their own connection. Two operations ([`Client::index`] and
//! [`Client::log`]) consume the client because the daemon terminates their
//! repeated-record responses by half-closing the stream.
//!
//! # Failure semantics
//!
//! A transport error is fatal to the connection and surfaced as
//! [`ObjdError::Wire`]; a nonzero status from the daemon is a normal,
//! recoverable [`ObjdError::Status`] describing a specific object-store
//! condition, and no result fields are read after one.

mod client;
mod error;
pub mod tree_builder;
mod types;

pub use client::{Client, PathContent};
pub use error::{ObjdError, ObjdResult, StatusError};
pub use tree_builder::{build_tree, canonical_entry_cmp, TreeStore, TreeUpdates};
pub use types::{
    CommitDetail, CommitSummary, DiffChunk, EntryKind, FileDiff, Oid, PathEntry, RawTreeEntry,
    RepoIndex, Signature, MODE_DIR, MODE_FILE,
};
