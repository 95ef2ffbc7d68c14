use clap::Parser;
use controller::controller::Controller;
use controller::database::DatabaseStore;
use controller::network::{ControllerServer, ServerMessage};
use log::{error, info};
use shared::config::{self, ControllerConfig, CONTROLLER_OPTIONS};
use shared::metrics::SyncMetrics;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Inventory sync controller")]
struct Args {
    /// IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,

    /// TOML file with an [inventory_sync] table
    #[clap(short, long)]
    config: Option<String>,

    /// Where inventories are persisted
    #[clap(short, long, default_value = "inventories.json")]
    database: String,

    /// Override the default lock lifetime in seconds
    #[clap(long)]
    player_lock_timeout: Option<u64>,

    /// Print the configurable options and exit
    #[clap(long)]
    list_options: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();

    if args.list_options {
        print!("{}", config::describe(CONTROLLER_OPTIONS));
        return Ok(());
    }

    let contents = match &args.config {
        Some(path) => Some(std::fs::read_to_string(path)?),
        None => None,
    };
    let mut overrides = Vec::new();
    if let Some(timeout) = args.player_lock_timeout {
        overrides.push(("player_lock_timeout", timeout));
    }
    let config = ControllerConfig::load(contents.as_deref(), &overrides)?;
    info!(
        "Lock lifetime {}s (max {}s), sweep every {:?}",
        config.player_lock_timeout, config.max_lock_timeout, config.lock_sweep_interval
    );

    let database = DatabaseStore::load(&args.database)?;
    let controller = Controller::new(config, database, Arc::new(SyncMetrics::new()));

    let address = format!("{}:{}", args.host, args.port);
    let mut server = ControllerServer::bind(&address, controller).await?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down gracefully...");
            let _ = shutdown.send(ServerMessage::Shutdown);
        }
    });

    if let Err(e) = server.run().await {
        error!("Controller stopped with error: {}", e);
        return Err(e);
    }

    Ok(())
}
