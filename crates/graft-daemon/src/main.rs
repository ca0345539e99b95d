//! graftd - the graft forge daemon.
//!
//! Loads configuration, opens the record store, and runs the hook IPC
//! server until SIGINT or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use graft_core::config::Config;
use graft_daemon::fedauth::HttpFederationVerifier;
use graft_daemon::hooks::{HookDeps, HookServer, HookServerConfig, ObjdAncestry};
use graft_daemon::notify::LogNotifier;
use graft_daemon::session::SessionRegistry;
use graft_daemon::store::{RecordStore, SqliteStore};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// graft forge daemon
#[derive(Parser, Debug)]
#[command(name = "graftd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "graft.toml")]
    config: PathBuf,

    /// Override the hook socket path
    #[arg(long)]
    hook_socket: Option<PathBuf>,

    /// Override the object-daemon socket path
    #[arg(long)]
    objd_socket: Option<PathBuf>,

    /// Override the record store database path
    #[arg(long)]
    db: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(path) = args.hook_socket {
        config.hooks.socket = path;
    }
    if let Some(path) = args.objd_socket {
        config.objd.socket = path;
    }
    if let Some(path) = args.db {
        config.db.path = path;
    }

    let store: Arc<dyn RecordStore> =
        Arc::new(SqliteStore::open(&config.db.path).context("opening record store")?);
    let registry = Arc::new(SessionRegistry::new());

    let server = HookServer::bind(
        HookServerConfig {
            socket_path: config.hooks.socket.clone(),
            expected_uid: None,
        },
        HookDeps {
            registry,
            store: Arc::clone(&store),
            ancestry: Arc::new(ObjdAncestry::new(config.objd.socket.clone())),
            federation: Arc::new(HttpFederationVerifier::new(Arc::clone(&store))),
            notifier: Arc::new(LogNotifier),
            web_root: config.web.root.clone(),
        },
    )
    .context("binding hook server")?;

    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT")?;

    info!("graftd started");
    tokio::select! {
        result = server.run() => {
            result.context("hook server failed")?;
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
        }
        _ = sigint.recv() => {
            info!("received SIGINT, shutting down");
        }
    }

    let _ = std::fs::remove_file(&config.hooks.socket);
    Ok(())
}
