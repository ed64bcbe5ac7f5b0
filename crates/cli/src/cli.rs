use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tether_runtime::backoff::EnvironmentProfile;

use crate::config::Overrides;

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Keeps one messaging session alive and its credentials safe")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug, -vvv trace)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// JSON config file (defaults to ./tether.json when present)
	#[arg(long, global = true, env = "TETHER_CONFIG", value_name = "FILE")]
	pub config: Option<PathBuf>,

	/// Directory holding sessions, backups and the control socket
	#[arg(long, global = true, env = "TETHER_DATA_DIR", value_name = "DIR")]
	pub data_dir: Option<PathBuf>,

	/// Session identity to operate on
	#[arg(long, global = true, env = "TETHER_IDENTITY")]
	pub identity: Option<String>,

	/// Separate directory for credential snapshots
	#[arg(long, global = true, env = "TETHER_BACKUP_DIR", value_name = "DIR")]
	pub backup_dir: Option<PathBuf>,

	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Run the supervisor in the foreground
	Run(RunArgs),

	/// Show the state of a running supervisor
	Status {
		/// Print the raw state snapshot as JSON
		#[arg(long)]
		json: bool,
	},

	/// Wipe credentials and restart device linking
	Reset,

	/// Stop a running supervisor gracefully
	Stop,

	/// Inspect or restore credential snapshots
	Backups {
		#[command(subcommand)]
		action: BackupsAction,
	},
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
	/// Retry profile: interactive or unattended (auto-detected when omitted)
	#[arg(long, env = "TETHER_PROFILE")]
	pub profile: Option<EnvironmentProfile>,

	/// WebSocket URL of the relay bridge
	#[arg(long, env = "TETHER_RELAY_URL")]
	pub relay_url: Option<String>,

	/// Link with a pairing code for this phone number instead of a QR code
	#[arg(long, env = "TETHER_PHONE")]
	pub phone: Option<String>,

	/// Country code prepended to numbers given without one
	#[arg(long, env = "TETHER_COUNTRY_CODE")]
	pub country_code: Option<String>,

	/// Conversation that receives status messages
	#[arg(long, env = "TETHER_OWNER")]
	pub owner: Option<String>,

	/// Serve GET /status on this address
	#[arg(long, env = "TETHER_STATUS_ADDR")]
	pub status_addr: Option<SocketAddr>,
}

#[derive(Subcommand, Debug)]
pub enum BackupsAction {
	/// List snapshots, newest first
	List,
	/// Copy the newest usable snapshot back into place
	Restore,
}

impl Cli {
	/// Command-line values that take precedence over the config file.
	pub fn overrides(&self) -> Overrides {
		let mut overrides = Overrides {
			identity: self.identity.clone(),
			data_dir: self.data_dir.clone(),
			backup_dir: self.backup_dir.clone(),
			..Overrides::default()
		};
		if let Commands::Run(run) = &self.command {
			overrides.profile = run.profile;
			overrides.relay_url = run.relay_url.clone();
			overrides.phone_number = run.phone.clone();
			overrides.country_code = run.country_code.clone();
			overrides.owner_target = run.owner.clone();
			overrides.status_addr = run.status_addr;
		}
		overrides
	}
}
