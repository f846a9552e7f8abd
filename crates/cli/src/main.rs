use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use berth_kubehub::KubeBinder;
use berth_sched::{default_watch_table, FitPath, HttpOracle, ResyncPolicy, Scheduler, SchedulerConfig};
use berth_store::Mirror;
use clap::{ArgAction, Parser};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "berthd", version, about = "Policy-driven pod scheduler")]
struct Cli {
    /// Path of the fit document evaluated for each pod
    #[arg(long = "fit", env = "BERTH_FIT", default_value = "/io/k8s/scheduler/fit")]
    fit: String,

    /// Base URL of the policy engine serving the fit document
    #[arg(long = "oracle-url", env = "BERTH_ORACLE_URL", default_value = "http://127.0.0.1:8181")]
    oracle_url: String,

    /// Kubeconfig file (default: inferred)
    #[arg(long = "kubeconfig", env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    #[arg(long = "oracle-timeout-secs", default_value_t = 10)]
    oracle_timeout_secs: u64,

    #[arg(long = "bind-timeout-secs", default_value_t = 10)]
    bind_timeout_secs: u64,

    /// Capacity of the shared event queue
    #[arg(long = "queue-cap", env = "BERTH_QUEUE_CAP", default_value_t = 2048)]
    queue_cap: usize,

    /// Leave mirror entries missing from a resync in place
    #[arg(long = "keep-stale", action = ArgAction::SetTrue)]
    keep_stale: bool,

    /// Schedule pods without waiting for the initial resync of the other streams
    #[arg(long = "no-sync-barrier", action = ArgAction::SetTrue)]
    no_sync_barrier: bool,
}

impl Cli {
    fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            queue_cap: self.queue_cap,
            resync: if self.keep_stale { ResyncPolicy::Keep } else { ResyncPolicy::Prune },
            sync_barrier: !self.no_sync_barrier,
        }
    }
}

fn init_tracing() {
    let env = std::env::var("BERTH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("BERTH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid BERTH_METRICS_ADDR; expected host:port");
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let fit = FitPath::parse(&cli.fit)?;
    let oracle = HttpOracle::new(&cli.oracle_url, &fit, Duration::from_secs(cli.oracle_timeout_secs))?;
    info!(url = %oracle.url(), "fit oracle configured");

    let client = berth_kubehub::kube_client(cli.kubeconfig.as_deref()).await?;
    let binder = KubeBinder::new(client.clone(), Duration::from_secs(cli.bind_timeout_secs));

    let (sources, _streams) = berth_sched::start_streams(client, &default_watch_table())?;
    let scheduler = Scheduler::new(Mirror::new(), Arc::new(oracle), Arc::new(binder), cli.scheduler_config());
    let mut dispatcher = scheduler.start(sources).await.context("starting scheduler")?;

    tokio::select! {
        res = &mut dispatcher => {
            // Only returns once every change stream is gone.
            res.context("dispatcher task")?;
            warn!("dispatcher exited");
        }
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received; shutting down");
            dispatcher.abort();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!(error = ?e, "scheduler failed");
        std::process::exit(1);
    }
}
