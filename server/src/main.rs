use anyhow::Context;
use clap::Parser;
use meshos_common::ClusterConfig;
use meshos_server::NodeRuntime;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "meshos-node", about = "Simulated distributed-OS cluster node")]
struct Args {
    /// Path to a YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address; overrides the configuration file
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Cluster name to create or join
    #[arg(long, default_value = "meshos")]
    cluster: String,

    /// Address of an existing member to join; omit to create the cluster
    #[arg(long)]
    join: Option<SocketAddr>,
}

fn load_config(args: &Args) -> anyhow::Result<ClusterConfig> {
    let mut builder = config::Config::builder();
    if let Some(path) = &args.config {
        builder = builder.add_source(config::File::from(path.clone()));
    }
    builder = builder.add_source(config::Environment::with_prefix("MESHOS"));

    let mut cluster_config: ClusterConfig = builder
        .build()
        .context("loading configuration")?
        .try_deserialize()
        .context("parsing configuration")?;

    if let Some(bind) = args.bind {
        cluster_config.bind_addr = bind;
    }
    cluster_config.validate()?;
    Ok(cluster_config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let runtime = NodeRuntime::new(config)?;
    runtime.start().await?;

    match args.join {
        Some(seed) => {
            runtime
                .join_cluster(&args.cluster, seed)
                .await
                .with_context(|| format!("joining '{}' via {seed}", args.cluster))?;
        }
        None => runtime.create_cluster(&args.cluster)?,
    }

    let status = runtime.get_cluster_status();
    info!(
        "node {} ready (state {}, role {})",
        status.node_id, status.state, status.role
    );

    tokio::signal::ctrl_c().await?;
    runtime.shutdown().await;
    Ok(())
}
