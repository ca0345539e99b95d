//! Bridge between an incoming push and `git-receive-pack`.
//!
//! A transport front end resolves the target repository and the pusher's
//! public key, then hands the connection here. The bridge applies the
//! pre-spawn contribution-policy gate, registers a push session under a
//! fresh cookie, spawns `git-receive-pack` with the hook socket path and
//! the cookie in its environment, and pumps the pusher's streams through
//! the child. The session is removed when the child exits, on every
//! return path.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use graft_core::models::{ContributionPolicy, UserKind};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::session::{Cookie, FeedbackHandle, PushSession, SessionError, SessionRegistry};
use crate::store::{RecordStore, StoreError};

/// Environment variable carrying the hook socket path to the helper.
pub const HOOKS_SOCKET_ENV: &str = "GRAFT_HOOKS_SOCKET_PATH";

/// Environment variable carrying the one-time session cookie.
pub const HOOKS_COOKIE_ENV: &str = "GRAFT_HOOKS_COOKIE";

/// Errors produced while bridging a push.
#[derive(Debug, Error)]
pub enum ReceiveError {
    /// The contribution policy rejects this pusher before spawn.
    ///
    /// The intended business outcome for an unauthorized push, reported
    /// to the pusher verbatim.
    #[error("{reason}")]
    Denied {
        /// Human-readable explanation.
        reason: &'static str,
    },

    /// The record store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The session could not be registered.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The receive process could not be spawned or awaited.
    #[error("git-receive-pack: {0}")]
    Process(#[from] std::io::Error),
}

/// The repository a push is aimed at.
#[derive(Debug, Clone)]
pub struct PushTarget {
    /// Filesystem path of the bare repository.
    pub repo_path: PathBuf,
    /// Record-store id of the repository.
    pub repo_id: i64,
    /// Repository name.
    pub repo_name: String,
    /// Group path segments the repository lives under.
    pub group_path: Vec<String>,
}

/// Removes the session from the registry when the push ends.
struct SessionGuard<'a> {
    registry: &'a SessionRegistry,
    cookie: Cookie,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.registry.remove(&self.cookie);
        debug!("push session removed");
    }
}

/// Spawns and supervises `git-receive-pack` for one push.
pub struct ReceiveBridge {
    registry: Arc<SessionRegistry>,
    store: Arc<dyn RecordStore>,
    hooks_socket: PathBuf,
    command: PathBuf,
}

impl ReceiveBridge {
    /// Creates a bridge registering sessions in `registry` and pointing
    /// spawned hooks at `hooks_socket`.
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<dyn RecordStore>,
        hooks_socket: PathBuf,
    ) -> Self {
        Self {
            registry,
            store,
            hooks_socket,
            command: PathBuf::from("git-receive-pack"),
        }
    }

    /// Overrides the receive-pack executable; test seam.
    #[must_use]
    pub fn with_command(mut self, command: impl Into<PathBuf>) -> Self {
        self.command = command.into();
        self
    }

    /// Runs one push end to end and returns the child's exit code.
    ///
    /// `stdin`/`stdout` are the pusher's pack streams; `feedback` is the
    /// pusher's interactive error stream, shared with the hook handler.
    ///
    /// # Errors
    ///
    /// Returns [`ReceiveError::Denied`] when the policy gate rejects the
    /// pusher, and other [`ReceiveError`] variants on infrastructure
    /// failures.
    pub async fn run<I, O>(
        &self,
        target: PushTarget,
        pubkey: &str,
        stdin: I,
        stdout: O,
        feedback: FeedbackHandle,
    ) -> Result<i32, ReceiveError>
    where
        I: AsyncRead + Send + Unpin + 'static,
        O: AsyncWrite + Send + Unpin + 'static,
    {
        let access = self.store.resolve_push_access(target.repo_id, pubkey)?;
        let mut user_id = access.user_id;
        let mut user_kind = access.user_kind;

        if !access.direct_access {
            match access.policy {
                ContributionPolicy::Closed => {
                    return Err(ReceiveError::Denied {
                        reason: "you need direct access to push to this repository",
                    });
                }
                ContributionPolicy::RegisteredUser => {
                    if user_kind != UserKind::Registered {
                        return Err(ReceiveError::Denied {
                            reason: "you need to be a registered user to push to this repository",
                        });
                    }
                }
                ContributionPolicy::SshPubkey | ContributionPolicy::Federated => {
                    if pubkey.is_empty() {
                        return Err(ReceiveError::Denied {
                            reason: "you need an SSH public key to push to this repository",
                        });
                    }
                    if user_kind == UserKind::Unknown {
                        let id = self.store.add_pubkey_user(pubkey)?;
                        user_id = Some(id);
                        user_kind = UserKind::PubkeyOnly;
                        let mut sink = feedback.lock().await;
                        let _ = sink
                            .write_all(
                                format!("you are now registered as user ID {id}\n").as_bytes(),
                            )
                            .await;
                    }
                }
                ContributionPolicy::Public => {}
            }
        }

        let cookie = Cookie::generate();
        let session = Arc::new(PushSession {
            pubkey: pubkey.to_owned(),
            direct_access: access.direct_access,
            repo_path: target.repo_path.clone(),
            repo_id: target.repo_id,
            repo_name: target.repo_name.clone(),
            group_path: target.group_path.clone(),
            user_id,
            user_kind,
            contrib_policy: access.policy,
            feedback: Arc::clone(&feedback),
        });
        self.registry.insert(&cookie, session)?;
        let _guard = SessionGuard {
            registry: &self.registry,
            cookie: cookie.clone(),
        };

        info!(
            repo_id = target.repo_id,
            repo = %target.repo_path.display(),
            user_id,
            "push session registered"
        );

        let mut child = Command::new(&self.command)
            .arg(&target.repo_path)
            .env(HOOKS_SOCKET_ENV, &self.hooks_socket)
            .env(HOOKS_COOKIE_ENV, cookie.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut child_stdin = child.stdin.take().expect("child stdin is piped");
        let child_stdout = child.stdout.take().expect("child stdout is piped");
        let child_stderr = child.stderr.take().expect("child stderr is piped");

        // The pusher may hold its stream open past the protocol's end, so
        // the stdin pump is aborted rather than awaited once the child
        // exits.
        let stdin_pump = tokio::spawn(async move {
            let mut stdin = stdin;
            let _ = tokio::io::copy(&mut stdin, &mut child_stdin).await;
            let _ = child_stdin.shutdown().await;
        });
        let stdout_pump = tokio::spawn(async move {
            let mut from = child_stdout;
            let mut to = stdout;
            let _ = tokio::io::copy(&mut from, &mut to).await;
            let _ = to.flush().await;
        });
        // Chunked copy under the feedback lock, so the hook handler's
        // transcript writes interleave at chunk boundaries.
        let stderr_pump = tokio::spawn(async move {
            let mut from = child_stderr;
            let mut buf = [0u8; 8192];
            loop {
                match from.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let mut sink = feedback.lock().await;
                        if sink.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                        let _ = sink.flush().await;
                    }
                }
            }
        });

        let status = child.wait().await?;
        let _ = stdout_pump.await;
        let _ = stderr_pump.await;
        stdin_pump.abort();

        let code = status.code().unwrap_or(1);
        if code == 0 {
            info!(repo_id = target.repo_id, "push completed");
        } else {
            warn!(repo_id = target.repo_id, code, "push failed");
        }
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use graft_core::models::{ContributionPolicy, UserKind};

    use super::*;
    use crate::session::feedback_handle;
    use crate::store::MemoryStore;

    fn target(repo_id: i64) -> PushTarget {
        PushTarget {
            repo_path: PathBuf::from("/repos/demo.git"),
            repo_id,
            repo_name: "demo".to_owned(),
            group_path: Vec::new(),
        }
    }

    fn bridge(store: Arc<MemoryStore>) -> (Arc<SessionRegistry>, ReceiveBridge) {
        let registry = Arc::new(SessionRegistry::new());
        let bridge = ReceiveBridge::new(
            Arc::clone(&registry),
            store,
            PathBuf::from("/tmp/hooks.sock"),
        )
        .with_command("true");
        (registry, bridge)
    }

    #[tokio::test]
    async fn closed_policy_requires_direct_access() {
        let store = Arc::new(MemoryStore::new());
        let repo = store.add_repo(ContributionPolicy::Closed);
        let (_registry, bridge) = bridge(store);

        let err = bridge
            .run(
                target(repo),
                "ssh-ed25519 AAAA",
                tokio::io::empty(),
                tokio::io::sink(),
                feedback_handle(tokio::io::sink()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiveError::Denied { .. }));
    }

    #[tokio::test]
    async fn registered_user_policy_rejects_pubkey_only() {
        let store = Arc::new(MemoryStore::new());
        let repo = store.add_repo(ContributionPolicy::RegisteredUser);
        store.add_user(UserKind::PubkeyOnly, Some("ssh-ed25519 AAAA"));
        let (_registry, bridge) = bridge(store);

        let err = bridge
            .run(
                target(repo),
                "ssh-ed25519 AAAA",
                tokio::io::empty(),
                tokio::io::sink(),
                feedback_handle(tokio::io::sink()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiveError::Denied { .. }));
    }

    #[tokio::test]
    async fn pubkey_policy_requires_a_key() {
        let store = Arc::new(MemoryStore::new());
        let repo = store.add_repo(ContributionPolicy::SshPubkey);
        let (_registry, bridge) = bridge(store);

        let err = bridge
            .run(
                target(repo),
                "",
                tokio::io::empty(),
                tokio::io::sink(),
                feedback_handle(tokio::io::sink()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiveError::Denied { .. }));
    }

    #[tokio::test]
    async fn unknown_key_is_provisioned_under_pubkey_policy() {
        let store = Arc::new(MemoryStore::new());
        let repo = store.add_repo(ContributionPolicy::SshPubkey);
        let (registry, bridge) = bridge(Arc::clone(&store));

        let code = bridge
            .run(
                target(repo),
                "ssh-ed25519 FRESH",
                tokio::io::empty(),
                tokio::io::sink(),
                feedback_handle(tokio::io::sink()),
            )
            .await
            .unwrap();
        assert_eq!(code, 0);

        // The user now exists with pubkey-only standing.
        let access = store
            .resolve_push_access(repo, "ssh-ed25519 FRESH")
            .unwrap();
        assert_eq!(access.user_kind, UserKind::PubkeyOnly);
        assert!(access.user_id.is_some());

        // The session was removed when the child exited.
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn session_removed_even_when_child_fails() {
        let store = Arc::new(MemoryStore::new());
        let repo = store.add_repo(ContributionPolicy::Public);
        let registry = Arc::new(SessionRegistry::new());
        let bridge = ReceiveBridge::new(
            Arc::clone(&registry),
            store,
            PathBuf::from("/tmp/hooks.sock"),
        )
        .with_command("false");

        let code = bridge
            .run(
                target(repo),
                "",
                tokio::io::empty(),
                tokio::io::sink(),
                feedback_handle(tokio::io::sink()),
            )
            .await
            .unwrap();
        assert_ne!(code, 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn environment_contract_reaches_the_child() {
        let store = Arc::new(MemoryStore::new());
        let repo = store.add_repo(ContributionPolicy::Public);
        let registry = Arc::new(SessionRegistry::new());
        let bridge = ReceiveBridge::new(
            Arc::clone(&registry),
            store,
            PathBuf::from("/run/graft/hooks.sock"),
        )
        .with_command("env");

        let (mut out_rx, out_tx) = tokio::io::duplex(64 * 1024);
        let code = bridge
            .run(
                target(repo),
                "",
                tokio::io::empty(),
                out_tx,
                feedback_handle(tokio::io::sink()),
            )
            .await
            .unwrap();
        assert_eq!(code, 0);

        let mut printed = Vec::new();
        out_rx.read_to_end(&mut printed).await.unwrap();
        let printed = String::from_utf8_lossy(&printed);
        assert!(printed.contains("GRAFT_HOOKS_SOCKET_PATH=/run/graft/hooks.sock"));
        // The cookie is 64 URL-safe characters.
        let cookie_line = printed
            .lines()
            .find_map(|l| l.strip_prefix("GRAFT_HOOKS_COOKIE="))
            .expect("cookie variable present");
        assert_eq!(cookie_line.len(), 64);
    }
}
