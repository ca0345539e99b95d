//! The hook IPC server.
//!
//! Listens on a dedicated Unix socket for connections from the hook
//! helper that `git-receive-pack` spawns, and drives one connection per
//! task through uid check, cookie redemption, frame parse and admission.
//!
//! Authentication and session failures are written back over the hook
//! socket itself (the helper copies everything after the status byte to
//! its stderr); admission transcripts go to the push session's own
//! feedback stream instead, which reaches the pusher directly.

use std::os::unix::fs::FileTypeExt as _;
use std::os::unix::fs::PermissionsExt as _;
use std::path::PathBuf;
use std::sync::Arc;

use subtle::ConstantTimeEq as _;
use thiserror::Error;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use super::admission::{self, AdmissionEnv, AncestryProvider, RefLine, SessionView};
use super::frame::{self, HookFrame};
use crate::ansi;
use crate::fedauth::FederationVerifier;
use crate::notify::Notifier;
use crate::session::{Cookie, SessionRegistry, COOKIE_LEN};
use crate::store::RecordStore;

/// Socket file mode: the helper always runs as the daemon's own user.
const SOCKET_MODE: u32 = 0o600;

/// Errors produced while binding or running the hook server.
#[derive(Debug, Error)]
pub enum HookServerError {
    /// The configured socket path exists but is not a socket.
    #[error("{path} exists and is not a socket")]
    NotASocket {
        /// Offending path.
        path: PathBuf,
    },

    /// Socket setup or accept failure.
    #[error("hook socket: {0}")]
    Io(#[from] std::io::Error),
}

/// Hook server configuration.
#[derive(Debug, Clone)]
pub struct HookServerConfig {
    /// Path of the Unix socket to listen on.
    pub socket_path: PathBuf,
    /// Peer uid to accept; `None` means the daemon's own uid.
    pub expected_uid: Option<u32>,
}

/// Collaborators a hook connection reaches through the server.
pub struct HookDeps {
    /// Push-session registry shared with the receive bridge.
    pub registry: Arc<SessionRegistry>,
    /// Record store for merge requests and users.
    pub store: Arc<dyn RecordStore>,
    /// Fast-forward oracle.
    pub ancestry: Arc<dyn AncestryProvider>,
    /// Federated-identity verifier.
    pub federation: Arc<dyn FederationVerifier>,
    /// Merge-request announcement channel.
    pub notifier: Arc<dyn Notifier>,
    /// Web root for merge-request URLs.
    pub web_root: String,
}

/// The Unix-socket server hook helpers connect back to.
pub struct HookServer {
    listener: UnixListener,
    expected_uid: u32,
    deps: Arc<HookDeps>,
}

impl std::fmt::Debug for HookServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookServer").finish_non_exhaustive()
    }
}

impl HookServer {
    /// Binds the hook socket, replacing a stale socket file if present.
    ///
    /// # Errors
    ///
    /// Returns [`HookServerError`] if the path is occupied by a
    /// non-socket file or the bind fails.
    pub fn bind(config: HookServerConfig, deps: HookDeps) -> Result<Self, HookServerError> {
        let path = &config.socket_path;
        match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_socket() => {
                std::fs::remove_file(path)?;
                debug!(path = %path.display(), "removed stale hook socket");
            }
            Ok(_) => {
                return Err(HookServerError::NotASocket { path: path.clone() });
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))?;

        let expected_uid = config
            .expected_uid
            .unwrap_or_else(|| nix::unistd::getuid().as_raw());
        info!(
            socket = %path.display(),
            expected_uid,
            "hook server bound"
        );

        Ok(Self {
            listener,
            expected_uid,
            deps: Arc::new(deps),
        })
    }

    /// Accepts hook connections forever, one task per connection.
    ///
    /// # Errors
    ///
    /// Returns [`HookServerError::Io`] when the listener itself fails;
    /// per-connection failures are handled inside their task.
    pub async fn run(self) -> Result<(), HookServerError> {
        loop {
            let (stream, _addr) = self.listener.accept().await?;
            let deps = Arc::clone(&self.deps);
            let expected_uid = self.expected_uid;
            tokio::spawn(async move {
                handle_connection(stream, expected_uid, deps).await;
            });
        }
    }
}

/// Writes the failure status byte and a red explanation over the hook
/// socket, then gives up on the connection.
async fn refuse(stream: &mut UnixStream, message: &str) {
    if stream.write_all(&[1]).await.is_err() {
        return;
    }
    let text = format!("\n{}{message}{}\n", ansi::RED, ansi::RESET);
    let _ = stream.write_all(text.as_bytes()).await;
    let _ = stream.shutdown().await;
}

async fn handle_connection(mut stream: UnixStream, expected_uid: u32, deps: Arc<HookDeps>) {
    // Peer uid is the sole authentication on this socket; the cookie
    // then binds the connection to one registered push.
    let peer_uid = match stream.peer_cred() {
        Ok(cred) => cred.uid(),
        Err(e) => {
            warn!(error = %e, "failed to read hook peer credentials");
            refuse(&mut stream, "unable to get peer credentials").await;
            return;
        }
    };
    let uid_ok = peer_uid
        .to_ne_bytes()
        .ct_eq(&expected_uid.to_ne_bytes())
        .unwrap_u8()
        == 1;
    if !uid_ok {
        warn!(peer_uid, expected_uid, "hook connection uid mismatch");
        refuse(&mut stream, "UID mismatch").await;
        return;
    }

    let mut cookie_raw = [0u8; COOKIE_LEN];
    if let Err(e) = stream.read_exact(&mut cookie_raw).await {
        warn!(error = %e, "failed to read hook cookie");
        refuse(&mut stream, "failed to read cookie").await;
        return;
    }
    let session = Cookie::from_raw(&cookie_raw)
        .and_then(|cookie| deps.registry.get(&cookie));
    let Some(session) = session else {
        warn!("hook connection presented an unknown cookie");
        refuse(&mut stream, "invalid handler cookie").await;
        return;
    };

    let frame = match frame::read_frame(&mut stream).await {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "failed to read hook frame");
            refuse(&mut stream, &format!("bad hook frame: {e}")).await;
            return;
        }
    };

    let status = {
        let mut feedback = session.feedback.lock().await;
        let _ = feedback.write_all(b"\n").await;
        let view = SessionView::of(&session);
        let status = dispatch(&view, &frame, &deps, feedback.as_mut()).await;
        let _ = feedback.write_all(b"\n").await;
        let _ = feedback.flush().await;
        status
    };

    let _ = stream.write_all(&[status]).await;
    let _ = stream.shutdown().await;
}

/// Runs the named hook; only `pre-receive` exists.
async fn dispatch(
    view: &SessionView,
    frame: &HookFrame,
    deps: &HookDeps,
    feedback: &mut (dyn tokio::io::AsyncWrite + Send + Unpin),
) -> u8 {
    match frame.hook_name() {
        Some("pre-receive") => pre_receive(view, frame, deps, feedback).await,
        other => {
            let name = other.unwrap_or("<none>");
            warn!(hook = name, "unsupported hook invoked");
            let text = format!("{}invalid hook: {name}{}\n", ansi::RED, ansi::RESET);
            let _ = feedback.write_all(text.as_bytes()).await;
            1
        }
    }
}

async fn pre_receive(
    view: &SessionView,
    frame: &HookFrame,
    deps: &HookDeps,
    feedback: &mut (dyn tokio::io::AsyncWrite + Send + Unpin),
) -> u8 {
    let inputs = frame
        .push_options()
        .map_err(|e| e.to_string())
        .and_then(|options| {
            RefLine::parse_all(&frame.stdin)
                .map(|lines| (lines, options))
                .map_err(|e| e.to_string())
        });
    let (lines, push_options) = match inputs {
        Ok(parsed) => parsed,
        Err(reason) => {
            let text = format!("{}{reason}{}\n", ansi::RED, ansi::RESET);
            let _ = feedback.write_all(text.as_bytes()).await;
            return 1;
        }
    };

    let env = AdmissionEnv {
        store: deps.store.as_ref(),
        ancestry: deps.ancestry.as_ref(),
        federation: deps.federation.as_ref(),
        notifier: deps.notifier.as_ref(),
        web_root: &deps.web_root,
    };
    match admission::evaluate(view, &lines, &push_options, &env, feedback).await {
        Ok(outcome) => outcome.status_byte(),
        Err(e) => {
            warn!(error = %e, repo_id = view.repo_id, "pre-receive evaluation failed");
            let text = format!("{}{e}{}\n", ansi::RED, ansi::RESET);
            let _ = feedback.write_all(text.as_bytes()).await;
            1
        }
    }
}
