//! DShield MCP Server Entry Point
//!
//! Bootstraps configuration, wires the SIEM engine, threat intelligence
//! orchestrator, and cache together, selects a transport, and serves until
//! EOF or a termination signal.

use clap::Parser;
use dshield_core::{load_config, resolve_config_path, AppConfig, DshieldResult, OpCliResolver};
use dshield_server::auth::Authenticator;
use dshield_server::state::ServerState;
use dshield_server::tools::ToolRegistry;
use dshield_server::transport::{
    detect_transport_mode, StdioTransport, TcpTransport, TransportMode,
};
use dshield_siem::{ElasticsearchClient, SearchBackend, SiemEngine};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Hourly sweep of expired persistent cache rows.
const CACHE_JANITOR_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3600);

#[derive(Debug, Parser)]
#[command(name = "dshield-mcp", version, about = "DShield MCP server")]
struct Cli {
    /// Configuration file path (defaults to $DSHIELD_MCP_CONFIG, then ./mcp_config.yaml)
    config: Option<PathBuf>,

    /// Select the networked TCP transport
    #[arg(long)]
    tcp: bool,

    /// Select the networked TCP transport
    #[arg(long = "tcp-mode")]
    tcp_mode: bool,

    /// Select the networked TCP transport
    #[arg(long)]
    network: bool,

    /// Launched under a TUI manager; implies the TCP transport
    #[arg(long = "tui-managed")]
    tui_managed: bool,
}

impl Cli {
    fn tcp_requested(&self) -> bool {
        self.tcp || self.tcp_mode || self.network || self.tui_managed
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("fatal configuration error: {}", err);
            std::process::exit(1);
        }
    };

    init_logging(&config);

    match serve(cli, config).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(err) => {
            tracing::error!(error = %err, "server failed");
            std::process::exit(1);
        }
    }
}

fn load(cli: &Cli) -> DshieldResult<AppConfig> {
    let path = resolve_config_path(cli.config.as_deref());
    Ok(load_config(&path, &OpCliResolver)?)
}

/// JSON-lines logging to stderr; stdout belongs to the stdio transport.
fn init_logging(config: &AppConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.error_handling.logging.level.clone()));
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn serve(cli: Cli, config: AppConfig) -> DshieldResult<i32> {
    let backend: Arc<dyn SearchBackend> = Arc::new(ElasticsearchClient::from_config(
        &config.elasticsearch,
        config.error_handling.retry_settings.clone(),
    )?);

    let siem = SiemEngine::new(
        backend.clone(),
        config.query.clone(),
        config.elasticsearch.index_patterns.clone(),
        config.elasticsearch.fallback_indices.clone(),
    );

    let cache = Arc::new(dshield_cache::TieredCache::open(&dshield_cache::CacheSettings {
        enable_memory: config.performance.enable_memory_cache,
        enable_persistent: config.performance.enable_persistent_cache,
        directory: config.performance.data_directory.join("cache"),
        memory_ttl: chrono::Duration::hours(config.threat_intelligence.cache_ttl_hours as i64),
        persistent_ttl: chrono::Duration::hours(
            config.performance.persistent_cache_ttl_hours as i64,
        ),
        max_entries: config.threat_intelligence.max_cache_size,
        max_disk_mb: 256,
    })?);

    let writeback_backend = config
        .threat_intelligence
        .elasticsearch
        .writeback_enabled
        .then(|| backend.clone());
    let intel = dshield_intel::ThreatIntelManager::from_config(
        &config.threat_intelligence,
        cache,
        writeback_backend,
    )?;

    let state = Arc::new(ServerState::new(config, siem, intel));
    let registry = Arc::new(ToolRegistry::new(&state.config.error_handling.timeouts)?);
    let authenticator = Arc::new(Authenticator::from_config(&state.config.tcp_transport.api_keys));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_code = Arc::new(AtomicI32::new(0));
    tokio::spawn(watch_signals(shutdown_tx, signal_code.clone()));
    tokio::spawn(cache_janitor(state.clone(), shutdown_rx.clone()));

    match detect_transport_mode(cli.tcp_requested()) {
        TransportMode::Stdio => {
            StdioTransport::new(state, registry, authenticator)
                .run(shutdown_rx)
                .await?;
        }
        TransportMode::Tcp => {
            TcpTransport::new(state, registry, authenticator)
                .run(shutdown_rx)
                .await?;
        }
    }

    // Signal-driven shutdown reports the conventional 128+signo exit code
    let signo = signal_code.load(Ordering::Relaxed);
    Ok(if signo > 0 { 128 + signo } else { 0 })
}

async fn watch_signals(shutdown: watch::Sender<bool>, signal_code: Arc<AtomicI32>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("SIGINT received, shutting down");
                signal_code.store(2, Ordering::Relaxed);
            }
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received, shutting down");
                signal_code.store(15, Ordering::Relaxed);
            }
        }
    }
    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            signal_code.store(2, Ordering::Relaxed);
        }
    }
    let _ = shutdown.send(true);
}

async fn cache_janitor(state: Arc<ServerState>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(CACHE_JANITOR_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it, open() already purged
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match state.intel.purge_expired_cache() {
                    Ok(purged) if purged > 0 => {
                        tracing::info!(purged, "cache janitor removed expired rows");
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "cache janitor failed"),
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}
