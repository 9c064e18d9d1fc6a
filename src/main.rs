use clap::Parser;
use k8s_openapi::serde_json;
use kube_gatherer::error::Result;
use kube_gatherer::gatherer::{ConfigDynamic, DynamicGatherer};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML file describing the resource type and namespaces to gather
    #[arg(short, long)]
    config: PathBuf,

    /// Kubeconfig to use, overriding the one named in the config file
    #[arg(short, long)]
    kubeconfig: Option<String>,

    /// Seconds to wait for the initial listing
    #[arg(long, default_value_t = 60)]
    sync_timeout: u64,

    /// Keep running and print a snapshot every this many seconds
    #[arg(short, long)]
    watch: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let args = Args::parse();
    let mut config = ConfigDynamic::load(&args.config)?;
    if let Some(kubeconfig) = args.kubeconfig {
        config.kubeconfig = kubeconfig;
    }

    let gatherer = config.new_data_gatherer().await?;
    let stop = CancellationToken::new();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("🛑 Interrupted, shutting down");
            }
            stop.cancel();
        }
    });

    gatherer.run(stop.clone()).await?;
    gatherer
        .wait_for_cache_sync(&stop, Some(Duration::from_secs(args.sync_timeout)))
        .await?;

    let result = match args.watch {
        None => print_snapshot(&gatherer).await,
        Some(secs) => watch(&gatherer, &stop, Duration::from_secs(secs.max(1))).await,
    };
    stop.cancel();

    if let Err(e) = &result {
        error!("❌ {}", e);
    }
    result
}

async fn watch(gatherer: &DynamicGatherer, stop: &CancellationToken, every: Duration) -> Result<()> {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => return Ok(()),
            _ = interval.tick() => print_snapshot(gatherer).await?,
        }
    }
}

async fn print_snapshot(gatherer: &DynamicGatherer) -> Result<()> {
    let mut list = gatherer.fetch().await?;
    list.sort_by_name();
    println!("{}", serde_json::to_string_pretty(&list)?);
    Ok(())
}
