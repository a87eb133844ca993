//! CLI for FleetLink
//!
//! Subcommands:
//! - `broker`: run the websocket pub/sub broker workers and orchestrators connect to

use clap::Parser;
use fleetlink::broker::Broker;
use fleetlink::config::{load_config, load_config_from};
use fleetlink::transport::start_websocket_server;
use fleetlink::utils::logging;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "fleetlink")]
enum Command {
    /// Start the websocket broker
    Broker {
        /// Configuration file to load instead of `config/default`
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    match Command::parse() {
        Command::Broker { config } => {
            if let Err(e) = run_broker(config.as_deref()).await {
                // no-op if settings were loaded
                logging::init("info");
                error!("Broker failed: {}", e);
            }
        }
    }
}

async fn run_broker(config_path: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let settings = match config_path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    logging::init(&settings.logging.level);

    let addr = settings.server.addr();
    let broker = Broker::shared();

    tokio::select! {
        result = start_websocket_server(&addr, broker) => {
            result?;
            error!("WebSocket broker exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    Ok(())
}
