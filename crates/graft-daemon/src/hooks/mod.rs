//! Hook IPC: the Unix socket `git-receive-pack`'s hook helper connects
//! back to, and the admission state machine behind it.
//!
//! # Connection lifecycle
//!
//! ```text
//! helper connects ─► peer uid check ─► 64-byte cookie ─► session lookup
//!        │                 │fail             │fail            │miss
//!        │                 └── status 1 + message, close ─────┘
//!        ▼
//! invocation frame (argv, environment, stdin)
//!        ▼
//! dispatch on hook base name (only pre-receive)
//!        ▼
//! admission state machine ─► transcript to pusher ─► status byte
//! ```
//!
//! The peer uid check against the daemon's own uid is the sole
//! authentication mechanism on this socket (trusted-local-users model);
//! the cookie then binds the connection to one registered push.

pub mod admission;
pub mod frame;
pub mod server;

pub use admission::{
    evaluate, AdmissionEnv, AdmissionError, AdmissionOutcome, AncestryError, AncestryProvider,
    LineDecision, LineOutcome, ObjdAncestry, RefLine, RejectReason, SessionView, CONTRIB_PREFIX,
};
pub use frame::{read_frame, FrameError, HookFrame};
pub use server::{HookDeps, HookServer, HookServerConfig, HookServerError};
