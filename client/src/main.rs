use clap::Parser;
use client::network::{AgentConfig, SyncAgent};
use env_logger::Env;
use log::info;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Websocket URL of the table server
    #[arg(short = 's', long, default_value = "ws://127.0.0.1:8000/ws")]
    server: String,

    /// HTTP origin assets are fetched from
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    http: String,

    /// Directory downloaded assets are cached in
    #[arg(long, default_value = "cache")]
    cache_dir: PathBuf,

    /// Delay between reconnect attempts in milliseconds
    #[arg(long, default_value = "2000")]
    reconnect_ms: u64,

    /// How often the mirror is checked for changes in milliseconds
    #[arg(long, default_value = "100")]
    poll_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    info!("Starting viewer...");
    info!("Server: {}, assets: {}", args.server, args.http);

    let agent = SyncAgent::spawn(AgentConfig {
        server_url: args.server,
        asset_origin: args.http,
        cache_dir: args.cache_dir,
        reconnect_delay: Duration::from_millis(args.reconnect_ms),
        ..AgentConfig::default()
    })?;

    let mut poll = tokio::time::interval(Duration::from_millis(args.poll_ms.max(1)));
    let mut seen = 0;

    loop {
        tokio::select! {
            _ = poll.tick() => {
                let snapshot = agent.snapshot();
                if snapshot.revision == seen {
                    continue;
                }
                seen = snapshot.revision;

                match snapshot.active_scene() {
                    Some(scene) => info!(
                        "Scene {}: {} tokens, {} revealed areas, map {:?}",
                        scene.id,
                        scene.tokens.len(),
                        scene.revealed.len(),
                        scene.map_file
                    ),
                    None => info!("No active scene"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    agent.shutdown().await;
    Ok(())
}
