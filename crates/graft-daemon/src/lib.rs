//! graft-daemon - Forge daemon library
//!
//! This library provides the network-facing half of the graft forge core:
//! the push session registry, the hook IPC server with its pre-receive
//! admission state machine, and the bridge that runs `git-receive-pack`
//! for an incoming push.
//!
//! # Push flow
//!
//! A transport front end (SSH, smart HTTP) resolves the target repository
//! and hands the push to [`receive::ReceiveBridge`], which registers a
//! [`session::PushSession`] under a one-time cookie and spawns
//! `git-receive-pack` with the hook socket path and the cookie in its
//! environment. The spawned process invokes the hook helper, which connects
//! back to [`hooks::HookServer`]; the server authenticates the peer's OS
//! identity, redeems the cookie, and runs the admission state machine in
//! [`hooks::admission`]. A single status byte decides whether the push's
//! ref-update transaction commits or aborts.
//!
//! # Modules
//!
//! - [`session`]: one-time cookies and the concurrent push-session registry
//! - [`hooks`]: hook socket server, invocation frame, admission state
//!   machine
//! - [`store`]: record store trait, SQLite implementation, in-memory fake
//! - [`fedauth`]: federated-identity verification against remote key lists
//! - [`receive`]: `git-receive-pack` process bridge
//! - [`notify`]: best-effort merge-request announcements
//! - [`urls`]: user-visible URL construction

pub mod ansi;
pub mod fedauth;
pub mod hooks;
pub mod notify;
pub mod receive;
pub mod session;
pub mod store;
pub mod urls;
