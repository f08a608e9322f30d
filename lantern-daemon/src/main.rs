//! # lantern-daemon
//!
//! Headless host for a single Lantern node.
//!
//! This daemon is responsible for:
//! - Serving a node directory to the sandboxed script kernel
//! - Polling the directory and reloading when node code changes
//! - Running the render tick
//! - Exposing the node menu on stdin/stdout as a local console client
//! - Aborting scripts that exceed their CPU limit
//!
//! ## Configuration
//!
//! The daemon reads configuration from `$XDG_CONFIG_HOME/lantern/config.toml`,
//! or from the path given as the first argument.
//!
//! ## Running
//!
//! ```bash
//! # Serve the node in the current directory
//! cargo run --bin lantern-daemon
//!
//! # Another node, with debug logging
//! LANTERN_NODE_PATH=/srv/lobby RUST_LOG=debug cargo run --bin lantern-daemon
//! ```

use anyhow::Result;
use lantern_daemon::config::Config;
use lantern_daemon::daemon::Daemon;
use lantern_daemon::monitor::WatchdogMonitor;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let (mut config, source) = match std::env::args().nth(1) {
        Some(path) => (Config::load(&path)?, path),
        None => match Config::load_default() {
            Ok(cfg) => (cfg, "default path".to_string()),
            Err(e) => (Config::default(), format!("built-in defaults ({})", e)),
        },
    };
    config.apply_env(|key| std::env::var(key).ok());
    config.validate()?;

    // Initialize logging; RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.daemon.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting lantern-daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration from {}", source);
    info!("Serving node directory: {}", config.node.path.display());

    let mut daemon = Daemon::new(config.clone())?;
    let mut monitor =
        WatchdogMonitor::spawn(daemon.node().watchdog().clone(), config.watchdog_interval())?;

    daemon.start()?;

    let mut render_tick = interval(config.frame_interval());
    render_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut scan_tick = interval(config.scan_interval());
    scan_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    info!("Daemon startup complete");
    info!("Press Enter for the node menu, Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = render_tick.tick() => {
                daemon.render();
            }
            _ = scan_tick.tick() => {
                daemon.rescan();
            }
            line = stdin.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => daemon.console_line(&line),
                    Ok(None) => {
                        info!("Console closed");
                        stdin_open = false;
                    }
                    Err(e) => {
                        warn!("Failed to read console input: {}", e);
                        stdin_open = false;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    info!("Shutting down...");
    daemon.shutdown();
    monitor.stop();

    info!("Daemon stopped");
    Ok(())
}
