use clap::Parser;
use tracing_subscriber::EnvFilter;

use remux::cli::{handlers, Cli, Commands};
use remux::utils::report;
use remux::{Config, Result};

#[tokio::main]
async fn main() {
    // Logs go to stderr: stdout belongs to the remote process.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("remux=info".parse().unwrap()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        report::fatal(&format!("{err:#}"));
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    match cli.command {
        Commands::Run { service, command } => {
            handlers::run_remote_command(config, cli.instance, service, command).await
        }
        Commands::Open { service } => handlers::open_service(config, cli.instance, service).await,
        Commands::Config { action } => handlers::configure(config, action),
    }
}
