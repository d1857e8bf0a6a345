// Jobmon distributor binary
// Decision: one process per workflow run; the parent watches stdout for the
//           readiness marker

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use jobmon_core::{JobmonConfig, AUTHORITATIVE_API_VERSION};
use jobmon_distributor::{ApiClient, ClusterPlugin, Distributor, MultiprocessPlugin};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "jobmon-distributor", about = "Jobmon distributor loop")]
struct Args {
    /// The workflow run to bind to
    #[arg(long)]
    workflow_run_id: i64,

    /// Coordination API base url
    #[arg(long, env = "JOBMON_API_URL", default_value = "http://localhost:9100")]
    api_url: String,

    /// API version to target
    #[arg(long, default_value = AUTHORITATIVE_API_VERSION)]
    api_version: String,

    /// Cluster plugin to use
    #[arg(long, default_value = "multiprocess")]
    plugin: String,

    /// Identity sent to the API when auth is enabled
    #[arg(long, env = "JOBMON_USER", default_value = "anonymous")]
    user: String,

    /// Optional configuration file (defaults + JOBMON__ env apply on top)
    #[arg(long)]
    config_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Logs go to stderr so the readiness marker owns stdout.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobmon_distributor=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = JobmonConfig::load(args.config_file.as_deref())
        .context("Failed to load configuration")?;

    let plugin: Arc<dyn ClusterPlugin> = match args.plugin.as_str() {
        "multiprocess" => Arc::new(MultiprocessPlugin::new()),
        other => anyhow::bail!("unknown cluster plugin: {}", other),
    };

    let client = ApiClient::new(&args.api_url, &args.api_version).with_user(&args.user);
    let distributor = Distributor::bind(
        client,
        plugin,
        config.distributor.clone(),
        args.workflow_run_id,
    )
    .await
    .context("Failed to bind distributor")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received");
            let _ = shutdown_tx.send(true);
        }
    });

    distributor.run(shutdown_rx).await
}
