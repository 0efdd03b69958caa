mod cli;
mod server;
mod wiring;
mod work;

use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use wiring::Wiring;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "app=info,tower_http=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = core::Config::from_env()?;
    let wiring = Wiring::build(config).await?;

    match cli.command {
        Command::Serve => server::serve(wiring).await?,
        Command::Work => work::run(wiring).await?,
    }

    Ok(())
}
