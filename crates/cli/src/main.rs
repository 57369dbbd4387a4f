use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use tagger_apply::{EventHandler, StopReason};
use tagger_core::{parse_default_tag, TagSet};
use tagger_ebs::EbsTagger;
use tagger_kubehub::PvLookup;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kube-tagger", version, about = "Sync EBS volume tags from PersistentVolumeClaim annotations")]
struct Cli {
    /// Tag applied to every volume, as key=value (repeatable; the value may contain commas)
    #[arg(long = "default-tag", value_parser = parse_default_tag, action = ArgAction::Append)]
    default_tags: Vec<(String, String)>,

    /// Default tags from the environment, `;`-separated. `--default-tag` wins on key collision.
    #[arg(
        long = "default-tags",
        env = "TAGGER_DEFAULT_TAGS",
        value_delimiter = ';',
        value_parser = parse_default_tag,
        hide = true
    )]
    env_default_tags: Vec<(String, String)>,

    /// Path to a kubeconfig file (default: local kubeconfig, then in-cluster service account)
    #[arg(long = "kube-config", env = "KUBECONFIG_PATH")]
    kube_config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long = "verbose", action = ArgAction::SetTrue)]
    verbose: bool,

    /// Seconds between full redeliveries of every known claim
    #[arg(long = "resync-secs", env = "TAGGER_RESYNC_SECS", default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
    resync_secs: u64,

    /// Bound of the watcher -> handler notification queue
    #[arg(long = "queue-cap", env = "TAGGER_QUEUE_CAP", default_value_t = 1024, value_parser = clap::value_parser!(u64).range(1..))]
    queue_cap: u64,
}

const TAGGER_CRATES: [&str; 5] = ["kube_tagger", "tagger_core", "tagger_kubehub", "tagger_ebs", "tagger_apply"];

/// `--verbose` turns on debug for this binary's crates only; kube, hyper and
/// the AWS SDK stay at info.
fn default_log_filter(verbose: bool) -> String {
    if !verbose {
        return "info".to_string();
    }
    std::iter::once("info".to_string())
        .chain(TAGGER_CRATES.iter().map(|c| format!("{c}=debug")))
        .collect::<Vec<_>>()
        .join(",")
}

fn init_tracing(verbose: bool) {
    let env = std::env::var("TAGGER_LOG").unwrap_or_else(|_| default_log_filter(verbose));
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

/// Serves the tagger's event, resolve and apply counters when `TAGGER_METRICS_ADDR` is set.
fn init_metrics() {
    let Ok(addr) = std::env::var("TAGGER_METRICS_ADDR") else {
        debug!("TAGGER_METRICS_ADDR unset; tagging counters are not exported");
        return;
    };
    match addr.parse::<std::net::SocketAddr>() {
        Ok(sock) => match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
            Ok(()) => info!(addr = %addr, "serving kube-tagger counters on /metrics"),
            Err(e) => warn!(error = %e, "kube-tagger counters will not be exported"),
        },
        Err(_) => warn!(addr = %addr, "invalid TAGGER_METRICS_ADDR; expected host:port, tagging counters not exported"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let term = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Ctrl-C received; shutting down"),
        _ = term => info!("SIGTERM received; shutting down"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    init_metrics();
    info!(version = env!("CARGO_PKG_VERSION"), "kube-tagger starting");

    let defaults: TagSet = cli.env_default_tags.into_iter().chain(cli.default_tags).collect();
    info!(tags = ?defaults, "default tags");

    let kube_config = cli.kube_config.as_deref().filter(|p| !p.as_os_str().is_empty());
    let client = tagger_kubehub::connect(kube_config)
        .await
        .context("failed to create connection to kubernetes api")?;
    let tagger = EbsTagger::from_env().await.context("failed to create AWS client")?;

    let handler = EventHandler::new(Arc::new(PvLookup::new(client.clone())), Arc::new(tagger), defaults);

    let cap = usize::try_from(cli.queue_cap).unwrap_or(usize::MAX);
    let (tx, rx) = mpsc::channel(cap);
    let resync = Duration::from_secs(cli.resync_secs);
    let watcher_handle = tokio::spawn(tagger_kubehub::start_watcher(client, resync, tx));

    let (handled, reason) = handler.run(rx, shutdown_signal()).await;
    watcher_handle.abort();

    // The watcher only drops the queue when its stream ends; exit non-zero so the pod restarts.
    if reason == StopReason::ChannelClosed {
        bail!("claim watcher terminated after {} notifications", handled);
    }
    info!(handled, "kube-tagger stopped");
    Ok(())
}
