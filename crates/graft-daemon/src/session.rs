//! Push sessions and the cookie-keyed session registry.
//!
//! A push session carries everything known at `git-receive-pack` spawn time
//! that the hook connection handler will need later: who is pushing, into
//! which repository, with what access. The session is keyed by a one-time
//! random cookie that travels to the hook helper through the spawned
//! process's environment.
//!
//! # Concurrency
//!
//! [`SessionRegistry`] is the only shared mutable state in this core. It is
//! safe under arbitrary concurrent insert/lookup/remove with no caller-side
//! locking; there is no ordering guarantee between sessions of different
//! pushes. It is an explicit, injectable value rather than a global so
//! tests can substitute their own instance.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use graft_core::models::{ContributionPolicy, UserKind};
use rand::rngs::OsRng;
use rand::RngCore as _;
use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio::sync::Mutex;

/// Cookie length on the wire, in bytes.
///
/// 48 random bytes render to exactly 64 URL-safe base64 characters; the
/// hook helper and server both rely on the fixed length.
pub const COOKIE_LEN: usize = 64;

const COOKIE_ENTROPY_BYTES: usize = 48;

/// One-time token correlating a push with its hook-socket connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cookie(String);

impl Cookie {
    /// Generates a fresh cookie from the OS random source.
    #[must_use]
    pub fn generate() -> Self {
        let mut raw = [0u8; COOKIE_ENTROPY_BYTES];
        OsRng.fill_bytes(&mut raw);
        Self(URL_SAFE_NO_PAD.encode(raw))
    }

    /// Reconstructs a cookie from the exact bytes read off the hook socket.
    ///
    /// Returns `None` for anything that cannot be a cookie; the caller
    /// treats that the same as a registry miss.
    #[must_use]
    pub fn from_raw(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != COOKIE_LEN {
            return None;
        }
        let s = std::str::from_utf8(bytes).ok()?;
        Some(Self(s.to_owned()))
    }

    /// The cookie's string form, as placed in the environment.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Cookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle for writing interactive feedback to the pusher.
///
/// For an SSH push this is the session's stderr channel. The mutex
/// serializes writers: the receive bridge pumps the child's stderr into it
/// while the hook handler writes the admission transcript.
pub type FeedbackHandle = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Wraps any writer into a [`FeedbackHandle`].
pub fn feedback_handle(writer: impl AsyncWrite + Send + Unpin + 'static) -> FeedbackHandle {
    Arc::new(Mutex::new(Box::new(writer)))
}

/// Context registered for one push, consumed by the hook connection.
pub struct PushSession {
    /// The pusher's SSH public key; empty when none was presented.
    pub pubkey: String,
    /// Whether the pusher has direct (maintainer) access.
    pub direct_access: bool,
    /// Filesystem path of the bare repository.
    pub repo_path: PathBuf,
    /// Record-store id of the repository.
    pub repo_id: i64,
    /// Repository name.
    pub repo_name: String,
    /// Group path segments the repository lives under.
    pub group_path: Vec<String>,
    /// Record-store id of the pushing user, when one is known.
    pub user_id: Option<i64>,
    /// How the pushing user is known to the forge.
    pub user_kind: UserKind,
    /// The repository's contribution policy.
    pub contrib_policy: ContributionPolicy,
    /// Interactive feedback stream back to the pusher.
    pub feedback: FeedbackHandle,
}

impl std::fmt::Debug for PushSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushSession")
            .field("direct_access", &self.direct_access)
            .field("repo_id", &self.repo_id)
            .field("repo_name", &self.repo_name)
            .field("user_id", &self.user_id)
            .field("user_kind", &self.user_kind)
            .field("contrib_policy", &self.contrib_policy)
            .finish_non_exhaustive()
    }
}

/// Error type for registry operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A session is already registered under this cookie.
    ///
    /// Cookies are never reused, so this indicates a caller bug.
    #[error("duplicate session cookie")]
    DuplicateCookie,
}

/// Concurrent map from cookie to push session.
///
/// Lookup of an unknown cookie is a normal miss, not an error; callers
/// decide how to react.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<HashMap<String, Arc<PushSession>>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session under a cookie; fails if the cookie is taken.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::DuplicateCookie`] if the cookie is already
    /// present.
    pub fn insert(&self, cookie: &Cookie, session: Arc<PushSession>) -> Result<(), SessionError> {
        let mut map = self.inner.write().expect("session registry lock poisoned");
        match map.entry(cookie.as_str().to_owned()) {
            std::collections::hash_map::Entry::Occupied(_) => Err(SessionError::DuplicateCookie),
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    /// Looks up a session by cookie.
    #[must_use]
    pub fn get(&self, cookie: &Cookie) -> Option<Arc<PushSession>> {
        self.inner
            .read()
            .expect("session registry lock poisoned")
            .get(cookie.as_str())
            .cloned()
    }

    /// Removes a session, returning it if it was present.
    pub fn remove(&self, cookie: &Cookie) -> Option<Arc<PushSession>> {
        self.inner
            .write()
            .expect("session registry lock poisoned")
            .remove(cookie.as_str())
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .expect("session registry lock poisoned")
            .len()
    }

    /// Whether no sessions are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
