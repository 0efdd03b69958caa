use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "app", about = "Crawl orchestration service", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the HTTP admin surface and, for the dispatcher queue variant,
    /// the `/tasks/process` webhook.
    Serve,
    /// Run a Worker Loop instance (broker queue variant only).
    Work,
}
