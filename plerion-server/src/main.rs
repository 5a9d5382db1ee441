use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use plerion_sync::{HookFactory, RoomHook, SchemaFactory, SyncServer};

mod config;
mod schema;

use config::ConfRoot;
use schema::SceneHook;

// === Clap === //

#[derive(Debug, Clone, Parser)]
#[command(about = "room replication server for plerion", long_about = None)]
struct CliArgs {
    #[arg(short = 'c', long = "config", name = "path to config")]
    config: Option<PathBuf>,

    /// Overrides `server.bind`
    #[arg(short = 'b', long = "bind")]
    bind: Option<String>,

    /// Overrides `server.tick_ms`
    #[arg(long = "tick-ms")]
    tick_ms: Option<u64>,
}

// === Driver === //

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Setup debug services
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("INFO"));

    // Parse arguments
    let args = CliArgs::parse();

    // Load config
    let mut config = ConfRoot::load(args.config.as_deref()).await?.into_server_config();
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(tick_ms) = args.tick_ms {
        config.tick_interval_ms = tick_ms;
    }
    config::validate(&config)?;

    // Start server
    let schema: SchemaFactory = Arc::new(|_| schema::scene());
    let hooks: HookFactory = Arc::new(|room_id| {
        log::debug!("Scene hook installed for room {room_id}");
        Box::new(SceneHook::new()) as Box<dyn RoomHook>
    });
    let server = SyncServer::new(config, schema, hooks);
    log::info!("Plerion server starting on {}", server.bind_addr());

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            log::info!(
                "Shutting down: {} connections served, {} rooms active, {} ticks",
                stats.total_connections,
                stats.active_rooms,
                stats.ticks,
            );
        }
    }

    Ok(())
}
