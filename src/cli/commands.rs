use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "remux")]
#[command(about = "Attach to processes running on remote service instances", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Instance to target (defaults to the configured instance)
    #[arg(long, global = true)]
    pub instance: Option<String>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a command on a remote service and attach to it
    Run {
        /// Service name
        service: String,
        /// Command and arguments to execute remotely
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Open a service's web URL in the browser
    Open {
        /// Service name
        service: String,
    },
    /// Show or update the stored configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the active configuration
    Show,
    /// Set the default instance
    SetInstance { instance: String },
    /// Set the control-plane API URL
    SetUrl { url: String },
}
