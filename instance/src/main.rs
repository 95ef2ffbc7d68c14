use clap::Parser;
use instance::bridge::MemoryBridge;
use instance::link::{ControllerLink, UdpLink};
use instance::sessions::InstanceSync;
use log::{error, info, warn};
use shared::config::{self, InstanceConfig, INSTANCE_OPTIONS};
use shared::metrics::SyncMetrics;
use shared::{InstanceId, PlayerKey};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Inventory sync instance", long_about = None)]
struct Args {
    /// Controller address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Name of this instance in the cluster
    #[arg(short = 'i', long, default_value = "instance-1")]
    instance_id: String,

    /// TOML file with an [inventory_sync] table
    #[arg(short, long)]
    config: Option<String>,

    /// Players to check out on start and check in on Ctrl+C
    #[arg(short, long)]
    player: Vec<String>,

    /// Print the controller's database stats and exit
    #[arg(long)]
    stats: bool,

    /// Print the configurable options and exit
    #[arg(long)]
    list_options: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    if args.list_options {
        print!("{}", config::describe(INSTANCE_OPTIONS));
        return Ok(());
    }

    let contents = match &args.config {
        Some(path) => Some(std::fs::read_to_string(path)?),
        None => None,
    };
    let config = InstanceConfig::load(contents.as_deref(), &[])?;

    info!("Connecting to controller at {}", args.server);
    let link = UdpLink::connect(
        &args.server,
        InstanceId::new(args.instance_id.clone()),
        config.request_timeout,
    )
    .await?;
    link.hello().await?;

    if args.stats {
        let stats = link.stats().await?;
        println!(
            "{} records, {} bytes, {} active locks, {} uploads in flight",
            stats.record_count, stats.total_bytes, stats.active_locks, stats.pending_uploads
        );
        return Ok(());
    }

    let players = args
        .player
        .iter()
        .map(|name| PlayerKey::new(name))
        .collect::<Result<Vec<_>, _>>()?;

    let bridge = Arc::new(MemoryBridge::new());
    let metrics = Arc::new(SyncMetrics::new());
    let sync = Arc::new(InstanceSync::new(
        Arc::new(link),
        bridge,
        config,
        Arc::clone(&metrics),
    ));
    let heartbeat = sync.spawn_heartbeat();

    for player in &players {
        match sync.player_joined(player).await {
            Ok(()) => info!("{} checked out", player),
            Err(e) => warn!("Could not check out {}: {}", player, e),
        }
    }

    info!("Press Ctrl+C to check players back in and exit");
    tokio::signal::ctrl_c().await?;
    heartbeat.abort();

    for player in sync.active_players().await {
        match sync.player_left(&player).await {
            Ok(version) => info!("{} checked in as version {}", player, version),
            Err(e) => error!("Could not check in {}: {}", player, e),
        }
    }
    sync.shutdown().await;

    info!("Final metrics: {:?}", metrics.snapshot());
    Ok(())
}
