use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use openai_usage_exporter::{
    client::UsageClient,
    collector::{Exporter, Schedule, Scheduler},
    config::Config,
    dedup::Ledger,
    logging::init_logging,
    metrics::MetricsSink,
    resolver::NameResolver,
    server,
};

#[derive(Parser)]
#[command(name = "openai-usage-exporter")]
#[command(about = "Export OpenAI organization usage and costs as Prometheus metrics")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Seconds between usage collection cycles
    #[arg(long)]
    interval: Option<u64>,

    /// Seconds each usage window reaches back before the cursor
    #[arg(long)]
    query_offset: Option<u64>,

    /// Seconds between cost collection cycles
    #[arg(long)]
    cost_interval: Option<u64>,

    /// Address for the metrics listener, e.g. 0.0.0.0:9100
    #[arg(long)]
    listen: Option<String>,

    /// Disable the daily cost loop
    #[arg(long)]
    no_costs: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(secs) = self.interval {
            config.scrape.interval_secs = secs;
        }
        if let Some(secs) = self.query_offset {
            config.scrape.query_offset_secs = secs;
        }
        if let Some(secs) = self.cost_interval {
            config.scrape.cost_interval_secs = secs;
        }
        if let Some(addr) = &self.listen {
            config.server.listen_addr = addr.clone();
        }
        if self.no_costs {
            config.scrape.costs_enabled = false;
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    Ok(config)
}

fn exit_with(e: anyhow::Error) -> ! {
    eprintln!("Error: {:#}", e);
    process::exit(1);
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = load_config(&cli).unwrap_or_else(|e| exit_with(e));
    let _log_guard = init_logging(&config.logging).unwrap_or_else(|e| exit_with(e));
    match &config.source {
        Some(path) => info!(config_file = %path.display(), "Loaded configuration from file"),
        None => info!("No configuration file found, using defaults and environment"),
    }
    if let Err(e) = config.validate() {
        exit_with(e);
    }

    if let Err(e) = run(config).await {
        error!(error = %format!("{:#}", e), "Exporter failed");
        process::exit(1);
    }
}

async fn run(config: Config) -> Result<()> {
    info!(
        organization_id = %config.api.organization_id,
        resources = ?config.scrape.resources,
        track_open_buckets = config.ledger.track_open_buckets,
        "Starting OpenAI usage exporter"
    );

    let listener = server::bind(&config.server.listen_addr).await?;

    let client = UsageClient::new(&config.api)?;
    let sink = Arc::new(MetricsSink::new()?);
    let exporter = Arc::new(Exporter::new(
        client.clone(),
        Arc::new(Ledger::new(config.ledger.track_open_buckets)),
        Arc::new(NameResolver::new(Arc::new(client))),
        sink.clone(),
        config.api.organization_id.clone(),
        config.scrape.resources.clone(),
    ));

    let cancel = CancellationToken::new();
    let scheduler = Scheduler::start(exporter, Schedule::from_config(&config), cancel.clone());
    let server = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let served = server::serve(listener, sink, cancel.clone()).await;
            // A dead listener takes the loops down with it.
            cancel.cancel();
            served
        })
    };

    tokio::select! {
        _ = shutdown_signal() => cancel.cancel(),
        _ = cancel.cancelled() => {}
    }

    scheduler.shutdown().await;
    server.await??;

    info!("Exporter stopped");
    Ok(())
}
