use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::signal;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sliding_throttle::config::{StoreBackend, ThrottleConfig};
use sliding_throttle::mesh::Cluster;
use sliding_throttle::ratelimit::{Clock, SystemClock, ThrottleSet};
use sliding_throttle::store::{GossipStore, HistoryStore, MemoryStore};

/// Replay a request trace through sliding-window throttles.
///
/// Each input line is `<scope> <ident> [timestamp]`; one JSON decision is
/// printed per request. Lines without a timestamp are checked at wall-clock time.
#[derive(Parser, Debug)]
#[command(name = "sliding-throttle", version, about)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Single ad-hoc rate such as "10/m", registered as scope "default"
    #[arg(long, conflicts_with = "config")]
    rate: Option<String>,

    /// Request trace to read; stdin when omitted
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Serialize)]
struct Verdict {
    line: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ident: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    now: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    admitted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    wait_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Verdict {
    fn rejected(line: usize, error: String) -> Self {
        Self {
            line,
            scope: None,
            ident: None,
            now: None,
            admitted: None,
            wait_secs: None,
            retry_after: None,
            error: Some(error),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting sliding-throttle");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match (&cli.config, &cli.rate) {
        (Some(path), _) => ThrottleConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        (None, Some(rate)) => {
            let mut config = ThrottleConfig::default();
            config.rates = HashMap::from([("default".to_string(), Some(rate.clone()))]);
            config.validate()?;
            config
        }
        (None, None) => bail!("either --config or --rate is required"),
    };
    info!(scopes = config.rates.len(), backend = ?config.store.backend, "Configuration loaded");

    let (store, cluster): (Arc<dyn HistoryStore>, Option<Arc<Cluster>>) = match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            store.spawn_sweeper(Duration::from_secs(config.store.sweep_interval_secs));
            (store as Arc<dyn HistoryStore>, None)
        }
        StoreBackend::Gossip => {
            let cluster = Arc::new(Cluster::start(config.cluster.to_cluster_config()).await?);
            cluster.spawn_sweeper(Duration::from_secs(config.store.sweep_interval_secs));
            let store: Arc<dyn HistoryStore> = Arc::new(GossipStore::new(cluster.clone()));
            (store, Some(cluster))
        }
    };

    let throttles = ThrottleSet::new(store).with_max_retries(config.store.max_retries);
    throttles.set_rates(&config.rates)?;
    info!(scopes = ?throttles.scopes(), "Throttles ready");

    let reader: Box<dyn AsyncRead + Unpin + Send> = match &cli.input {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };

    tokio::select! {
        result = replay(&throttles, reader) => {
            let (admitted, denied) = result?;
            info!(admitted, denied, "Replay finished");
        }
        _ = shutdown_signal() => {}
    }

    drop(throttles);
    if let Some(cluster) = cluster {
        match Arc::try_unwrap(cluster) {
            Ok(cluster) => cluster.shutdown().await?,
            Err(_) => warn!("Cluster still referenced; skipping graceful shutdown"),
        }
    }

    info!("sliding-throttle stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Check every request in `reader`, printing one JSON verdict per line.
async fn replay(
    throttles: &ThrottleSet,
    reader: Box<dyn AsyncRead + Unpin + Send>,
) -> anyhow::Result<(u64, u64)> {
    let mut lines = LinesStream::new(BufReader::new(reader).lines());
    let (mut admitted, mut denied) = (0u64, 0u64);
    let mut line_no = 0;

    while let Some(line) = lines.next().await {
        let line = line?;
        line_no += 1;

        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let verdict = match parse_request(trimmed) {
            Ok((scope, ident, now)) => {
                let now = now.unwrap_or_else(|| SystemClock.now());
                match throttles.check(scope, ident, now).await {
                    Ok(decision) => {
                        if decision.is_admitted() {
                            admitted += 1;
                        } else {
                            denied += 1;
                        }
                        Verdict {
                            line: line_no,
                            scope: Some(scope.to_string()),
                            ident: Some(ident.to_string()),
                            now: Some(now),
                            admitted: Some(decision.is_admitted()),
                            wait_secs: decision.wait().map(|w| w.as_secs_f64()),
                            retry_after: decision.retry_after_secs(),
                            error: None,
                        }
                    }
                    Err(e @ sliding_throttle::ThrottleError::BackendUnavailable(_)) => {
                        return Err(e.into());
                    }
                    Err(e) => {
                        warn!(line = line_no, error = %e, "Request rejected");
                        Verdict::rejected(line_no, e.to_string())
                    }
                }
            }
            Err(reason) => {
                warn!(line = line_no, %reason, "Malformed request line");
                Verdict::rejected(line_no, reason)
            }
        };

        println!("{}", serde_json::to_string(&verdict)?);
    }

    Ok((admitted, denied))
}

/// Split `<scope> <ident> [timestamp]`.
fn parse_request(line: &str) -> Result<(&str, &str, Option<f64>), String> {
    let mut fields = line.split_whitespace();
    let (Some(scope), Some(ident)) = (fields.next(), fields.next()) else {
        return Err("expected '<scope> <ident> [timestamp]'".to_string());
    };
    let now = fields
        .next()
        .map(|ts| ts.parse::<f64>().map_err(|_| format!("invalid timestamp '{}'", ts)))
        .transpose()?;
    if fields.next().is_some() {
        return Err("unexpected trailing fields".to_string());
    }
    Ok((scope, ident, now))
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping replay");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping replay");
        }
    }
}
