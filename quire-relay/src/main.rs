use std::path::PathBuf;

use clap::Parser;
use log::{error, info};
use quire_collab::relay::{RelayConfig, RelayServer};

#[derive(Parser, Debug)]
#[command(name = "quire-relay")]
#[command(about = "Stateless WebSocket relay for Quire collaboration rooms")]
#[command(version)]
struct Cli {
    /// JSON config file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    bind: Option<String>,

    #[arg(long)]
    max_peers_per_room: Option<usize>,

    /// Frames buffered per connection
    #[arg(long)]
    broadcast_capacity: Option<usize>,
}

impl Cli {
    fn relay_config(&self) -> Result<RelayConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::from_json(&std::fs::read_to_string(path)?)?,
            None => RelayConfig::default(),
        };
        if let Some(bind) = &self.bind {
            config.bind_addr = bind.clone();
        }
        if let Some(max) = self.max_peers_per_room {
            config.max_peers_per_room = max;
        }
        if let Some(capacity) = self.broadcast_capacity {
            config.broadcast_capacity = capacity;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let config = match cli.relay_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid relay configuration: {e}");
            std::process::exit(2);
        }
    };
    info!(
        "Starting Quire relay on {} (max {} peers per room)",
        config.bind_addr, config.max_peers_per_room
    );

    let relay = RelayServer::new(config);
    tokio::select! {
        result = relay.run() => {
            if let Err(e) = result {
                error!("Relay stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = relay.stats().await;
            info!(
                "Shutting down after {} connections, {} messages",
                stats.total_connections, stats.total_messages
            );
        }
    }
}
