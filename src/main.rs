mod args;
mod commands;

use args::{Cli, Commands};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            socket,
            no_services,
        } => commands::daemon::cmd_run(cli.config, socket, !no_services).await?,
        Commands::Call {
            method,
            params,
            listen,
            socket,
        } => commands::call::cmd_call(cli.config, socket, &method, params.as_deref(), listen).await?,
        Commands::Services => commands::services::cmd_services(cli.config)?,
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
