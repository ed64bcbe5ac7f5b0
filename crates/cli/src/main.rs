use clap::Parser;
use tether_cli::cli::Cli;
use tether_cli::{commands, logging};
use tracing::error;

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);

	if let Err(err) = commands::dispatch(cli).await {
		error!(target = "tether", error = %err, "command failed");
		std::process::exit(1);
	}
}
