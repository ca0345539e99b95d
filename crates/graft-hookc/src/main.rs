//! graft-hookc - hook helper spawned by `git-receive-pack`.
//!
//! git invokes this binary in place of the real hook. It connects to the
//! daemon's hook socket, authenticates with the one-time cookie from its
//! environment, relays its own invocation (argv, `GIT_*` environment,
//! stdin) verbatim, half-closes the socket, and exits with the status
//! byte the daemon sends back. Anything the daemon writes after the
//! status byte is copied to stderr, where git prefixes it with
//! `remote:` for the pusher.
//!
//! The helper is a single-shot pipe, not a server, so it uses plain
//! blocking I/O throughout.

use std::ffi::OsString;
use std::io::{self, Read as _, Write as _};
use std::net::Shutdown;
use std::os::unix::ffi::OsStrExt as _;
use std::os::unix::net::UnixStream;
use std::process;

use anyhow::{bail, Context as _};
use nix::sys::stat::SFlag;

/// Environment variable carrying the hook socket path.
const SOCKET_ENV: &str = "GRAFT_HOOKS_SOCKET_PATH";

/// Environment variable carrying the one-time session cookie.
const COOKIE_ENV: &str = "GRAFT_HOOKS_COOKIE";

/// Cookie length in bytes; fixed so the daemon can read it exactly.
const COOKIE_LEN: usize = 64;

/// Ensures a standard stream is the pipe git gives every hook.
///
/// git always wires hook stdio through pipes; anything else means the
/// helper was invoked outside a hook context.
fn require_pipe(name: &str, fd: std::os::unix::io::RawFd) -> anyhow::Result<()> {
    let stat = nix::sys::stat::fstat(fd).with_context(|| format!("fstat on {name}"))?;
    if stat.st_mode & SFlag::S_IFMT.bits() != SFlag::S_IFIFO.bits() {
        bail!("{name} must be a pipe");
    }
    Ok(())
}

/// Writes the invocation frame: native-endian argc, NUL-terminated args,
/// NUL-terminated `GIT_*` environment lines, and an empty terminator.
fn send_invocation<W: io::Write>(
    out: &mut W,
    args: &[OsString],
    env: impl Iterator<Item = (OsString, OsString)>,
) -> io::Result<()> {
    out.write_all(&(args.len() as u64).to_ne_bytes())?;
    for arg in args {
        out.write_all(arg.as_bytes())?;
        out.write_all(&[0])?;
    }
    for (key, value) in env {
        if !key.as_bytes().starts_with(b"GIT_") {
            continue;
        }
        out.write_all(key.as_bytes())?;
        out.write_all(b"=")?;
        out.write_all(value.as_bytes())?;
        out.write_all(&[0])?;
    }
    out.write_all(&[0])
}

fn run() -> anyhow::Result<i32> {
    let socket_path =
        std::env::var_os(SOCKET_ENV).with_context(|| format!("{SOCKET_ENV} is not set"))?;
    let cookie = std::env::var(COOKIE_ENV).with_context(|| format!("{COOKIE_ENV} is not set"))?;
    if cookie.len() != COOKIE_LEN {
        bail!("{COOKIE_ENV} is not {COOKIE_LEN} characters long");
    }

    require_pipe("stdin", 0)?;
    require_pipe("stderr", 2)?;

    let mut sock = UnixStream::connect(&socket_path)
        .with_context(|| format!("connecting to {}", socket_path.to_string_lossy()))?;
    sock.write_all(cookie.as_bytes()).context("sending cookie")?;

    let args: Vec<OsString> = std::env::args_os().collect();
    send_invocation(&mut sock, &args, std::env::vars_os()).context("sending invocation")?;

    io::copy(&mut io::stdin().lock(), &mut sock).context("relaying stdin")?;
    // Half-close so the daemon's stdin read sees end-of-stream.
    sock.shutdown(Shutdown::Write).context("half-closing socket")?;

    let mut status = [0u8; 1];
    sock.read_exact(&mut status)
        .context("daemon closed without a status byte")?;

    // Whatever follows the status byte is transcript for the pusher.
    let mut stderr = io::stderr().lock();
    match io::copy(&mut sock, &mut stderr) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {}
        Err(e) => return Err(e).context("copying transcript to stderr"),
    }

    Ok(i32::from(status[0]))
}

fn main() {
    match run() {
        Ok(status) => process::exit(status),
        Err(e) => {
            eprintln!("graft-hookc: {e:#}");
            process::exit(1);
        }
    }
}
