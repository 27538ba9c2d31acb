use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use portcullis::config::Config;
use portcullis::server::Server;
use portcullis::storage::sqlite::SqliteLogStore;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct CliArguments {
    /// Path to the gateway configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() {
    let args = CliArguments::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("failed to load {}: {}", args.config, error);
            process::exit(1);
        }
    };

    init_tracing(&config.logging.level);
    info!("loaded configuration from {}", args.config);

    if let Err(error) = run(config).await {
        error!("{}", error);
        process::exit(1);
    }
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let store = SqliteLogStore::connect(&config.logging.database).await?;
    let server = Server::new(config, Arc::new(store))?;
    server.run().await?;
    Ok(())
}
