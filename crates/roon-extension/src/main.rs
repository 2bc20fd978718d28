//! Roon extension entry point.
//!
//! Loads the configuration, opens the persisted pairing state, and runs the
//! extension until Ctrl+C.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_config()            -- TOML file, CLI overrides on top
//!  └─ Extension::new()         -- validates metadata, loads pairing state
//!  └─ ExtensionRuntime::start()
//!       ├─ event loop          (owns every Core connection)
//!       └─ SOOD discovery      (unless --no-discovery)
//! ```
//!
//! Out of the box the extension provides only the ping and pairing services;
//! it is mainly useful for checking that a Core can see and pair with it.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use roon_extension::application::extension::{Extension, ExtensionOptions};
use roon_extension::infrastructure::runtime::{ChannelHooks, CoreEvent, ExtensionRuntime, RuntimeOptions};
use roon_extension::infrastructure::storage::config::{load_config, ExtensionConfig, FrameLogLevel};
use roon_extension::infrastructure::storage::state::FileStateStore;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// `host:port` of a Core to connect to directly.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CoreAddress {
    host: String,
    port: u16,
}

impl FromStr for CoreAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected HOST:PORT, got {s:?}"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(format!("missing host in {s:?}"));
        }
        let port = port
            .parse()
            .map_err(|_| format!("invalid port in {s:?}"))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// Roon extension: discovers Cores on the LAN, registers, and pairs.
#[derive(Debug, Parser)]
#[command(name = "roon-extension", version)]
struct Cli {
    /// Path to the TOML configuration file.
    ///
    /// Defaults to `config.toml` in the platform config directory; a missing
    /// file means built-in defaults.
    #[arg(long, env = "ROON_EXTENSION_CONFIG")]
    config: Option<PathBuf>,

    /// Connect to this Core directly (HOST:PORT of its WebSocket listener).
    #[arg(long, env = "ROON_CORE")]
    core: Option<CoreAddress>,

    /// MOO frame logging: all, normal or none.
    #[arg(long, env = "ROON_EXTENSION_LOG")]
    log_level: Option<FrameLogLevel>,

    /// Disable SOOD discovery.
    #[arg(long)]
    no_discovery: bool,

    /// Where pairing state is kept.
    #[arg(long, env = "ROON_EXTENSION_STATE")]
    state_file: Option<PathBuf>,
}

impl Cli {
    /// Applies command-line overrides on top of the file configuration.
    fn apply(&self, config: &mut ExtensionConfig) {
        if let Some(level) = self.log_level {
            config.extension.log_level = level;
        }
        if self.no_discovery {
            config.discovery.enabled = false;
        }
        if let Some(path) = &self.state_file {
            config.storage.state_file = Some(path.clone());
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;

    let state_file = config.state_file()?;
    info!(
        "{} {} starting, state in {}",
        config.extension.display_name,
        config.extension.display_version,
        state_file.display()
    );

    let (hooks, mut core_events) = ChannelHooks::new();
    let extension = Extension::new(
        ExtensionOptions::from_config(&config),
        Box::new(FileStateStore::new(state_file)),
        Box::new(hooks),
    )
    .context("failed to initialise extension")?;

    let (handle, task) = ExtensionRuntime::start(extension, RuntimeOptions::from_config(&config))?;

    if let Some(core) = &cli.core {
        match handle.connect(core.host.clone(), core.port).await {
            Ok(id) => info!("connection {id} open to {}:{}", core.host, core.port),
            Err(e) => error!("could not connect to {}:{}: {e}", core.host, core.port),
        }
    }

    tokio::spawn(async move {
        while let Some(event) = core_events.recv().await {
            match event {
                CoreEvent::Paired(core) => info!("ready: paired with {core}"),
                CoreEvent::Unpaired(core) => warn!("paired core {core} unavailable"),
                CoreEvent::Found(core) => info!("core available: {core}"),
                CoreEvent::Lost(core) => info!("core gone: {core}"),
            }
        }
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C, shutting down"),
        Err(e) => error!("failed to listen for Ctrl+C signal: {e}"),
    }
    handle.shutdown();
    task.await.context("extension runtime panicked")?;

    info!("stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
