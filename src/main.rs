use clap::{Parser, Subcommand};
use stratocast::commands;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stratocast", about = "High-altitude balloon trajectory prediction core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP surface and the background lifecycle manager.
    Serve,
    /// Print current on-disk and in-memory cache occupancy and exit.
    CacheStatus,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve => commands::handle_serve().await,
        Command::CacheStatus => commands::handle_cache_status().await,
    }
}
