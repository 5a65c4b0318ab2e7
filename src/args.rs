use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "kairo-kernel")]
#[command(version)]
#[command(about = "Kairo kernel daemon: processes, streams, events and services", long_about = None)]
pub(crate) struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Config file (default: $KAIRO_KERNEL_CONFIG or ~/.config/kairo/kernel.toml)
    #[arg(long, global = true, env = "KAIRO_KERNEL_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the kernel in the foreground (Ctrl+C to stop)
    Run {
        /// Socket path override
        #[arg(short, long)]
        socket: Option<PathBuf>,

        /// Don't start configured services
        #[arg(long)]
        no_services: bool,
    },

    /// Call one RPC method on a running kernel and print the result
    Call {
        /// Method name (e.g., process.spawn, system.get_metrics)
        method: String,

        /// Params as a JSON object
        params: Option<String>,

        /// Keep printing events and stream chunks after the call
        #[arg(short, long)]
        listen: bool,

        /// Socket path override
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },

    /// Print the service start order from the config, or the cycle preventing it
    Services,
}
