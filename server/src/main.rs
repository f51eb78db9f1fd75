use clap::Parser;
use env_logger::Env;
use log::{error, info};
use server::network::{Server, ServerConfig};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,
    /// Port to listen on
    #[clap(short, long, default_value_t = shared::DEFAULT_PORT)]
    port: u16,
    /// JSON file the table state is loaded from and saved to
    #[clap(long, default_value = "table_state.json")]
    state_file: PathBuf,
    /// Keep the table in memory only
    #[clap(long)]
    in_memory: bool,
    /// Directory served under /assets
    #[clap(long, default_value = "assets")]
    assets_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = ServerConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
        state_path: (!args.in_memory).then_some(args.state_file),
        assets_dir: args.assets_dir,
    };

    let server = Server::bind(config).await?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped with error: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
