mod backups;
mod control;
mod run;

pub use control::render_status;

use crate::cli::{BackupsAction, Cli, Commands};
use crate::config::{FileConfig, Settings, detect_profile_from_env};
use crate::error::Result;

pub async fn dispatch(cli: Cli) -> Result<()> {
	let overrides = cli.overrides();
	let file = FileConfig::load(cli.config.as_deref())?;
	let settings = Settings::resolve(file, overrides, detect_profile_from_env())?;

	match cli.command {
		Commands::Run(_) => run::run(settings).await?,
		Commands::Status { json } => control::status(&settings, json).await?,
		Commands::Reset => control::reset(&settings).await?,
		Commands::Stop => control::stop(&settings).await?,
		Commands::Backups { action } => match action {
			BackupsAction::List => backups::list(&settings)?,
			BackupsAction::Restore => backups::restore(&settings).await?,
		},
	}

	Ok(())
}
