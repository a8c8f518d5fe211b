//! KissDB Daemon
//!
//! Serves the store over HTTP and exposes Prometheus metrics on a separate
//! address.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ data server  │────▶│    Engine    │◀────│metrics server│
//! │  (:1700)     │     │              │     │  (/metrics)  │
//! └──────────────┘     └──────────────┘     └──────────────┘
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kissdb::config::{ConfigOrigin, DaemonConfig, EngineConfig, CONFIG_FILE_NAME};
use kissdb::{server, Engine, Result};

// =============================================================================
// CLI Arguments
// =============================================================================

/// KissDB - journaled hierarchical key-value store
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data directory holding config.yml and the db/ tree
    #[arg(long, env = "KISSDB_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Data server bind address (defaults to 0.0.0.0:<server-bind-port>)
    #[arg(long, env = "KISSDB_BIND")]
    bind: Option<String>,

    /// Metrics server bind address
    #[arg(long, env = "KISSDB_METRICS_ADDR", default_value = "0.0.0.0:9170")]
    metrics_addr: String,

    /// Override box-cache-seconds from the config file
    #[arg(long, env = "KISSDB_BOX_CACHE_SECONDS")]
    box_cache_seconds: Option<u64>,

    /// Override request-timeout-seconds from the config file
    #[arg(long, env = "KISSDB_REQUEST_TIMEOUT_SECONDS")]
    request_timeout_seconds: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // log-color lives in the file, so the subscriber waits for it
    let config_path = args.data_dir.join(CONFIG_FILE_NAME);
    let (daemon, origin) = DaemonConfig::load_or_create(&config_path)?;

    init_logging(&args, daemon.log_color);

    info!("Starting KissDB {}", kissdb::version());
    info!("  Data directory: {}", args.data_dir.display());
    match origin {
        ConfigOrigin::Created => warn!(
            path = %config_path.display(),
            "Configuration not found, created defaults"
        ),
        ConfigOrigin::Loaded => info!("  Configuration: {}", config_path.display()),
    }

    let mut config = EngineConfig::from_daemon(&args.data_dir, &daemon);
    if let Some(seconds) = args.box_cache_seconds {
        config.box_cache_ttl = Duration::from_secs(seconds);
    }
    if let Some(seconds) = args.request_timeout_seconds {
        config.request_timeout = Duration::from_secs(seconds);
    }
    info!("  Box cache TTL: {}s", config.box_cache_ttl.as_secs());
    info!("  Request timeout: {}s", config.request_timeout.as_secs());

    let engine = Engine::start(config).await?;
    let cancel = CancellationToken::new();

    let bind = args
        .bind
        .clone()
        .unwrap_or_else(|| format!("0.0.0.0:{}", daemon.server_bind_port));
    let data_listener = server::bind(&bind, "data").await?;
    let metrics_listener = server::bind(&args.metrics_addr, "metrics").await?;

    let mut data_server = tokio::spawn(server::serve(data_listener, engine.clone(), cancel.clone()));
    let metrics_server = tokio::spawn(server::serve_metrics(
        metrics_listener,
        engine.clone(),
        cancel.clone(),
    ));

    info!("Server successfully started");

    let data_stopped = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down...");
            false
        }
        result = &mut data_server => {
            report("data", result);
            true
        }
    };

    cancel.cancel();
    if !data_stopped {
        report("data", data_server.await);
    }
    report("metrics", metrics_server.await);

    engine.shutdown().await?;
    info!("KissDB shutdown complete");
    Ok(())
}

fn report(name: &str, joined: std::result::Result<Result<()>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("{} server error: {}", name, e),
        Err(e) => error!("{} server task failed: {}", name, e),
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args, color: bool) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "hyper_util=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_ansi(color))
            .init();
    }
}
