use std::sync::Arc;

use clap::Parser;
use proxmon::{config::read_config_file, Hub, Monitor};
use tracing::{error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("proxmon", LevelFilter::DEBUG),
        ("proxmond", LevelFilter::DEBUG),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact(),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;
    if config.pve_instances.is_empty() && config.pbs_instances.is_empty() {
        anyhow::bail!("no PVE or PBS instances configured");
    }

    let hub = Arc::new(Hub::default());
    let monitor = Monitor::new(config, Arc::clone(&hub)).await?;

    info!("monitor started, press Ctrl+C to shut down");

    let runner = tokio::spawn(Arc::clone(&monitor).run());

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal, stopping"),
        Err(err) => error!("unable to listen for shutdown signal: {err}"),
    }

    monitor.stop();
    let _ = runner.await;

    info!("monitor stopped, exiting");
    Ok(())
}
