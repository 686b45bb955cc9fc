use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "tecdsa-operator")]
#[command(about = "CLI for the t-ECDSA keep operator", long_about = None)]
pub struct Cli {
    /// Full path to the configuration file
    #[arg(short, long, default_value = "./configs/config.toml")]
    pub config: PathBuf,

    /// External service used to broadcast transactions to the blockchain
    #[arg(long, default_value = "blockcypher")]
    pub broadcast_api: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the operator against the configured chain
    Start,
    /// Run a self-contained smoke group on an in-memory chain and network
    StartLocal,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
