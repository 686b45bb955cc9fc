#[path = "tecdsa-operator/cli.rs"]
mod cli;
#[path = "tecdsa-operator/setup.rs"]
mod setup;

use crate::cli::{Cli, Command};
use tecdsa_core::foundation::Result;
use tracing::error;

#[tokio::main]
async fn main() {
    let args = Cli::parse_args();
    if let Err(err) = setup::init_logging(&args.log_level) {
        eprintln!("failed to configure logging: {}", err);
    }

    if let Err(err) = run(args).await {
        error!(%err, "operator terminated");
        std::process::exit(1);
    }
}

async fn run(args: Cli) -> Result<()> {
    let config = tecdsa_core::infrastructure::config::read_config(&args.config)?;
    match args.command {
        Command::Start => tecdsa_service::runner::start(config, &args.broadcast_api).await,
        Command::StartLocal => tecdsa_service::runner::start_local(config).await,
    }
}
