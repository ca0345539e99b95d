//! Value types exchanged with the object daemon.

use thiserror::Error;

/// Mode bits for a directory entry inside a tree.
pub const MODE_DIR: u64 = 0o40000;

/// Mode bits for a regular-file entry inside a tree.
pub const MODE_FILE: u64 = 0o100644;

/// A content hash identifying an object-store item (commit, tree or blob).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid([u8; 20]);

/// An object id could not be parsed.
#[derive(Debug, Error)]
#[error("invalid object id: {reason}")]
pub struct OidParseError {
    reason: &'static str,
}

impl Oid {
    /// The all-zero id; a pre-receive line carries it for a newly created
    /// ref.
    pub const ZERO: Self = Self([0u8; 20]);

    /// Builds an id from exactly 20 raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`OidParseError`] on any other length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OidParseError> {
        let raw: [u8; 20] = bytes.try_into().map_err(|_| OidParseError {
            reason: "expected exactly 20 bytes",
        })?;
        Ok(Self(raw))
    }

    /// Raw 20-byte form.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase hex form.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Whether this is the all-zero id.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }
}

impl std::str::FromStr for Oid {
    type Err = OidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 40 {
            return Err(OidParseError {
                reason: "expected 40 hex characters",
            });
        }
        let mut raw = [0u8; 20];
        hex::decode_to_slice(s, &mut raw).map_err(|_| OidParseError {
            reason: "invalid hex",
        })?;
        Ok(Self(raw))
    }
}

impl std::fmt::Display for Oid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for Oid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Oid({})", self.to_hex())
    }
}

/// One commit in an index or log response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSummary {
    /// Commit id.
    pub id: Oid,
    /// First line of the commit message.
    pub title: String,
    /// Author name.
    pub author_name: String,
    /// Author email.
    pub author_email: String,
    /// Author date as the daemon formats it.
    pub date: String,
}

/// Repository index: optional readme plus recent commits.
#[derive(Debug, Clone)]
pub struct RepoIndex {
    /// Raw readme bytes, if the repository has one.
    pub readme: Option<Vec<u8>>,
    /// Recent commits, most recent first.
    pub commits: Vec<CommitSummary>,
}

/// Kind of a path-lookup tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A subtree.
    Dir,
    /// A regular file.
    File,
}

/// One entry of a path-lookup tree listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEntry {
    /// Entry kind.
    pub kind: EntryKind,
    /// Mode bits.
    pub mode: u64,
    /// Blob size in bytes (zero for subtrees).
    pub size: u64,
    /// Entry name.
    pub name: String,
}

/// Author or committer identity with its timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Name.
    pub name: String,
    /// Email.
    pub email: String,
    /// Unix time in seconds.
    pub when: i64,
    /// Timezone offset in minutes.
    pub tz_offset_min: i64,
}

/// One hunk of a file diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffChunk {
    /// Raw chunk operation code as the daemon reports it.
    pub op: u64,
    /// Chunk text.
    pub content: String,
}

/// Diff of one file within a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    /// Mode before the change (zero when created).
    pub from_mode: u64,
    /// Mode after the change (zero when deleted).
    pub to_mode: u64,
    /// Path before the change.
    pub from_path: String,
    /// Path after the change.
    pub to_path: String,
    /// Diff hunks.
    pub chunks: Vec<DiffChunk>,
}

/// Full commit metadata with its file diffs.
#[derive(Debug, Clone)]
pub struct CommitDetail {
    /// Commit id.
    pub id: Oid,
    /// Author identity.
    pub author: Signature,
    /// Committer identity.
    pub committer: Signature,
    /// Full commit message.
    pub message: String,
    /// Parent commit ids.
    pub parents: Vec<Oid>,
    /// Per-file diffs against the first parent.
    pub files: Vec<FileDiff>,
}

/// One raw entry of a tree object, as used when listing and writing trees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTreeEntry {
    /// Mode bits ([`MODE_DIR`] or [`MODE_FILE`]).
    pub mode: u64,
    /// Entry name (no separators).
    pub name: String,
    /// Object id of the blob or subtree.
    pub oid: Oid,
}
