use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wren::cli;
use wren::simulation;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wren=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Parse args and env vars
    let settings = cli::Cli::parse().into_settings();
    settings.validate()?;

    info!(
        "Simulating {} for {} clients",
        settings.limiter.algorithm(),
        settings.clients
    );
    let report = simulation::run(&settings).await?;

    if settings.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for client in &report.limiter.clients {
        info!(
            "{}: admitted {}, denied {}",
            client.client, client.admitted, client.denied
        );
    }
    for shard in &report.cache.shards {
        info!(
            "{}: {} of {} keys ({} capacity)",
            shard.node, shard.entries, report.cache.keys, shard.capacity
        );
    }
    info!(
        "Adding {} relocated {} keys",
        report.cache.added_node, report.cache.relocated_on_add
    );
    Ok(())
}
