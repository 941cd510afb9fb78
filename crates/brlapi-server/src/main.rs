//! BrlAPI server entry point.
//!
//! Shares one braille display between many client applications.  Clients
//! connect over a local socket or TCP, authenticate with a shared key, attach
//! to a virtual console and then write to the display and receive keys
//! according to console focus.
//!
//! # Usage
//!
//! ```text
//! brlapi-server [OPTIONS]
//!
//! Options:
//!   --config    <PATH>   TOML configuration file [default: /etc/brlapi-server.toml]
//!   --hosts     <LIST>   Endpoints, e.g. ":0+127.0.0.1:0"
//!   --auth-key  <PATH>   File holding the shared key
//!   --log-level <LEVEL>  Fallback when RUST_LOG is unset
//! ```
//!
//! # Architecture overview
//!
//! ```text
//! clients (BrlAPI protocol over local socket / TCP)
//!       ↕
//! infrastructure/network   one task per endpoint, one per session
//!       ↕
//! application              dispatch, tty tree, arbitration
//!       ↕
//! output loop (blocking)   ApiDriver → real braille driver
//! ```

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::{bail, Context};
use brlapi_core::domain::keys::command;
use brlapi_core::DisplaySize;
use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use brlapi_server::application::{ApiDriver, BrlapiServer, ServerSettings};
use brlapi_server::infrastructure::driver::console::{SysfsConsole, SYSFS_ACTIVE_CONSOLE};
use brlapi_server::infrastructure::driver::virtual_display::VirtualDisplay;
use brlapi_server::infrastructure::driver::{BrailleDriver, HostConsole};
use brlapi_server::infrastructure::network::maintenance::run_maintenance;
use brlapi_server::infrastructure::network::{parse_hosts, serve_endpoint, Endpoint};
use brlapi_server::infrastructure::storage::config::{load_auth_key, load_config, ServerConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// BrlAPI server.
#[derive(Debug, Parser)]
#[command(
    name = "brlapi-server",
    about = "Shares a braille display between BrlAPI client applications",
    version
)]
struct Cli {
    /// TOML configuration file.  A missing file means all defaults.
    #[arg(long, default_value = "/etc/brlapi-server.toml", env = "BRLAPI_CONFIG")]
    config: PathBuf,

    /// `+`-separated endpoints; overrides `server.hosts`.
    #[arg(long, env = "BRLAPI_HOSTS")]
    hosts: Option<String>,

    /// Authentication key file; overrides `server.auth_key_path`.
    #[arg(long, env = "BRLAPI_AUTH_KEY")]
    auth_key: Option<PathBuf>,

    /// Log level used when `RUST_LOG` is unset; overrides `server.log_level`.
    #[arg(long, env = "BRLAPI_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    /// Loads the configuration file and applies command-line overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or holds
    /// unusable values.
    fn into_server_config(self) -> anyhow::Result<ServerConfig> {
        let mut config = load_config(&self.config)
            .with_context(|| format!("failed to load config {}", self.config.display()))?;
        if let Some(hosts) = self.hosts {
            config.server.hosts = hosts;
        }
        if let Some(path) = self.auth_key {
            config.server.auth_key_path = path;
        }
        if let Some(level) = self.log_level {
            config.server.log_level = level;
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

/// Builds the braille driver named in the configuration.
fn build_driver(config: &ServerConfig) -> anyhow::Result<Box<dyn BrailleDriver>> {
    let size = DisplaySize::new(config.display.columns, config.display.rows);
    match config.display.driver.as_str() {
        "virtual" => Ok(Box::new(VirtualDisplay::new(size))),
        other => bail!("unknown braille driver {other:?}"),
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.into_server_config()?;

    // ── Logging setup ─────────────────────────────────────────────────────────
    //
    // `RUST_LOG` wins; otherwise the configured level applies.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.server.log_level)),
        )
        .init();

    let auth_key = load_auth_key(&config.server.auth_key_path).with_context(|| {
        format!(
            "failed to load authentication key {}",
            config.server.auth_key_path.display()
        )
    })?;
    let endpoints = parse_hosts(&config.server.hosts, &config.server.socket_dir)
        .with_context(|| format!("invalid host list {:?}", config.server.hosts))?;
    if endpoints.is_empty() {
        warn!("no endpoints configured, no client can connect");
    }

    let console = Arc::new(SysfsConsole::new(SYSFS_ACTIVE_CONSOLE, 1));
    let settings = ServerSettings {
        auth_key,
        unauth_max: config.limits.unauth_max,
        unauth_timeout: Duration::from_secs(config.limits.unauth_timeout_secs),
        max_ttys: config.limits.max_ttys,
    };
    let server = Arc::new(BrlapiServer::new(
        settings,
        build_driver(&config)?,
        Arc::clone(&console) as Arc<dyn HostConsole>,
    ));
    info!("BrlAPI server starting, endpoints: {}", describe(&endpoints));

    // ── Graceful shutdown flag ─────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, initiating graceful shutdown");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    // ── Endpoints and maintenance ──────────────────────────────────────────────
    let retry = Duration::from_millis(config.limits.bind_retry_ms);
    let mut listeners = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        let server = Arc::clone(&server);
        let running = Arc::clone(&running);
        listeners.push(tokio::spawn(async move {
            if let Err(e) = serve_endpoint(server, endpoint, retry, running).await {
                error!("{e}");
            }
        }));
    }
    let poll = Duration::from_millis(config.limits.poll_interval_ms);
    let maintenance = tokio::spawn(run_maintenance(
        Arc::clone(&server),
        Duration::from_secs(1),
        Arc::clone(&running),
    ));

    // ── Display output loop ───────────────────────────────────────────────────
    let output = {
        let server = Arc::clone(&server);
        let running = Arc::clone(&running);
        let console = Arc::clone(&console);
        tokio::task::spawn_blocking(move || run_output_loop(server, &console, &config, poll, &running))
    };

    output.await.context("display output loop panicked")?;
    for listener in listeners {
        let _ = listener.await;
    }
    let _ = maintenance.await;
    server.shutdown();

    info!("BrlAPI server stopped");
    Ok(())
}

/// Drives the display until `running` is cleared, standing in for the host's
/// braille pipeline.
fn run_output_loop(
    server: Arc<BrlapiServer>,
    console: &SysfsConsole,
    config: &ServerConfig,
    poll: Duration,
    running: &AtomicBool,
) {
    let mut api = ApiDriver::new(Arc::clone(&server));
    while running.load(Ordering::Relaxed) {
        match api.read_command() {
            Ok(Some(command::NOOP)) | Ok(None) => {}
            Ok(Some(command::RESTARTBRL)) => console.restart_driver(),
            Ok(Some(cmd)) => debug!(cmd, "command left to the host"),
            Err(e) => {
                warn!("driver error: {e}");
                console.restart_driver();
            }
        }
        if console.take_restart_request() {
            match build_driver(config) {
                Ok(driver) => {
                    if let Err(e) = server.replace_driver(driver) {
                        error!("cannot restart braille driver: {e}");
                    }
                }
                Err(e) => error!("cannot restart braille driver: {e:#}"),
            }
        }
        std::thread::sleep(poll);
    }
}

fn describe(endpoints: &[Endpoint]) -> String {
    endpoints
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        // Arrange / Act
        let cli = Cli::parse_from(["brlapi-server"]);

        // Assert
        assert_eq!(cli.config, PathBuf::from("/etc/brlapi-server.toml"));
        assert!(cli.hosts.is_none());
    }

    #[test]
    fn test_cli_overrides_config_values() {
        let cli = Cli::parse_from([
            "brlapi-server",
            "--config",
            "/nonexistent/brlapi.toml",
            "--hosts",
            ":3",
            "--auth-key",
            "/tmp/key",
        ]);

        let config = cli.into_server_config().unwrap();

        assert_eq!(config.server.hosts, ":3");
        assert_eq!(config.server.auth_key_path, PathBuf::from("/tmp/key"));
    }

    #[test]
    fn test_unknown_driver_is_rejected() {
        let mut config = ServerConfig::default();
        config.display.driver = "alva".to_string();
        assert!(build_driver(&config).is_err());
    }

    #[test]
    fn test_virtual_driver_uses_configured_size() {
        let config = ServerConfig::default();
        let driver = build_driver(&config).unwrap();
        assert_eq!(driver.display_size(), DisplaySize::new(40, 1));
    }
}
