use tether_protocol::ControlRequest;
use tracing::info;

use crate::config::Settings;
use crate::daemon;
use crate::error::{CliError, Result};

pub(super) fn list(settings: &Settings) -> Result<()> {
	let store = settings.store();
	let records = store.list_backups(&settings.identity)?;
	if records.is_empty() {
		println!("No snapshots in {}", store.backup_dir(&settings.identity).display());
		return Ok(());
	}

	let pinned = store.known_good(&settings.identity)?;
	for record in records {
		let marker = if pinned == Some(record.taken_at) { " (known good)" } else { "" };
		println!("{}{marker}  {}", record.taken_at, record.blob_ref.display());
	}
	Ok(())
}

/// Offline restore; refuses while a supervisor owns the session.
pub(super) async fn restore(settings: &Settings) -> Result<()> {
	match daemon::request(&settings.control_socket(), &ControlRequest::Ping).await {
		Err(CliError::NotRunning { .. }) => {}
		Ok(_) => {
			return Err(CliError::Config(
				"a supervisor is running for this data directory; run `tether stop` first".to_string(),
			));
		}
		Err(err) => return Err(err),
	}

	let store = settings.store();
	match store.load(&settings.identity) {
		Ok(Some(_)) => {
			println!("Primary credentials are intact; nothing to restore.");
			return Ok(());
		}
		Ok(None) => {}
		Err(err) => info!(target = "tether", error = %err, "primary credentials unreadable; restoring"),
	}

	match store.restore_latest(&settings.identity)? {
		Some(credentials) => {
			println!(
				"Restored credentials for {} (saved at {}).",
				settings.identity, credentials.meta.saved_at
			);
			Ok(())
		}
		None => Err(CliError::Config(format!(
			"no usable snapshot in {}",
			store.backup_dir(&settings.identity).display()
		))),
	}
}
