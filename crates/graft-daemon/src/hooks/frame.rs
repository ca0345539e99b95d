//! Hook invocation frame.
//!
//! The helper relays its invocation verbatim: a native-endian `u64`
//! argument count, that many NUL-terminated arguments, NUL-terminated
//! `KEY=VALUE` environment lines up to an empty line, then its stdin until
//! end-of-stream. Argc is native-endian because helper and daemon always
//! share a host.
//!
//! # Security considerations
//!
//! Every size is capped before allocation; the helper is spawned by git on
//! the same machine, but the socket itself only requires a matching uid,
//! so the parser does not trust lengths.

use std::collections::HashMap;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum number of relayed arguments.
pub const MAX_ARGS: u64 = 1024;

/// Maximum length of one argument or environment line, in bytes.
pub const MAX_STRING_LEN: usize = 64 * 1024;

/// Maximum relayed stdin size (16 MiB).
pub const MAX_STDIN_LEN: u64 = 16 * 1024 * 1024;

/// Errors produced while reading a hook frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The stream ended before the frame was complete.
    #[error("hook frame cut short while reading {context}")]
    UnexpectedEof {
        /// What was being read.
        context: &'static str,
    },

    /// The argument count exceeds [`MAX_ARGS`].
    #[error("too many hook arguments: {count}")]
    TooManyArgs {
        /// Announced count.
        count: u64,
    },

    /// A NUL-terminated string exceeds [`MAX_STRING_LEN`].
    #[error("hook {context} exceeds {max} bytes", max = MAX_STRING_LEN)]
    StringTooLong {
        /// What was being read.
        context: &'static str,
    },

    /// Relayed stdin exceeds [`MAX_STDIN_LEN`].
    #[error("hook stdin exceeds {MAX_STDIN_LEN} bytes")]
    StdinTooLarge,

    /// An environment line has no `=`.
    #[error("invalid environment line: {line:?}")]
    InvalidEnvLine {
        /// The offending line.
        line: String,
    },

    /// `GIT_PUSH_OPTION_COUNT` is present but not a number, or an indexed
    /// option is missing.
    #[error("invalid push options: {reason}")]
    InvalidPushOptions {
        /// What was wrong.
        reason: String,
    },

    /// Transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One parsed hook invocation.
#[derive(Debug, Clone)]
pub struct HookFrame {
    /// Relayed argv, starting with the hook's own path.
    pub args: Vec<String>,
    /// Relayed `GIT_*` environment.
    pub env: HashMap<String, String>,
    /// Relayed stdin payload.
    pub stdin: Vec<u8>,
}

impl HookFrame {
    /// Base name of the invoked hook, from the first argument.
    #[must_use]
    pub fn hook_name(&self) -> Option<&str> {
        let first = self.args.first()?;
        Some(first.rsplit('/').next().unwrap_or(first))
    }

    /// Push options carried in the environment.
    ///
    /// An absent `GIT_PUSH_OPTION_COUNT` means no options were sent.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidPushOptions`] when the count does not
    /// parse or an indexed option is missing.
    pub fn push_options(&self) -> Result<Vec<String>, FrameError> {
        let Some(count) = self.env.get("GIT_PUSH_OPTION_COUNT") else {
            return Ok(Vec::new());
        };
        let count: usize = count.parse().map_err(|_| FrameError::InvalidPushOptions {
            reason: format!("GIT_PUSH_OPTION_COUNT is {count:?}"),
        })?;
        let mut options = Vec::with_capacity(count.min(64));
        for i in 0..count {
            let key = format!("GIT_PUSH_OPTION_{i}");
            let value = self
                .env
                .get(&key)
                .ok_or_else(|| FrameError::InvalidPushOptions {
                    reason: format!("{key} is missing"),
                })?;
            options.push(value.clone());
        }
        Ok(options)
    }
}

async fn read_cstring<R: AsyncRead + Unpin>(
    reader: &mut R,
    context: &'static str,
) -> Result<String, FrameError> {
    let mut bytes = Vec::new();
    loop {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(FrameError::UnexpectedEof { context });
            }
            Err(e) => return Err(e.into()),
        };
        if byte == 0 {
            return Ok(String::from_utf8_lossy(&bytes).into_owned());
        }
        if bytes.len() >= MAX_STRING_LEN {
            return Err(FrameError::StringTooLong { context });
        }
        bytes.push(byte);
    }
}

/// Reads one complete hook invocation frame.
///
/// Consumes the reader to end-of-stream; the stdin payload is everything
/// after the environment terminator.
///
/// # Errors
///
/// Returns [`FrameError`] on truncation, cap violations, or malformed
/// environment lines.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<HookFrame, FrameError> {
    let mut argc_raw = [0u8; 8];
    reader
        .read_exact(&mut argc_raw)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => FrameError::UnexpectedEof {
                context: "argument count",
            },
            _ => FrameError::Io(e),
        })?;
    let argc = u64::from_ne_bytes(argc_raw);
    if argc > MAX_ARGS {
        return Err(FrameError::TooManyArgs { count: argc });
    }

    let mut args = Vec::with_capacity(argc as usize);
    for _ in 0..argc {
        args.push(read_cstring(reader, "argument").await?);
    }

    let mut env = HashMap::new();
    loop {
        let line = read_cstring(reader, "environment line").await?;
        if line.is_empty() {
            break;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(FrameError::InvalidEnvLine { line });
        };
        env.insert(key.to_owned(), value.to_owned());
    }

    let mut stdin = Vec::new();
    reader
        .take(MAX_STDIN_LEN + 1)
        .read_to_end(&mut stdin)
        .await?;
    if stdin.len() as u64 > MAX_STDIN_LEN {
        return Err(FrameError::StdinTooLarge);
    }

    Ok(HookFrame { args, env, stdin })
}
