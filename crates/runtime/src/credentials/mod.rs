//! Durable credential storage with timestamped backup snapshots.
//!
//! Layout, per session identity:
//!
//! ```text
//! <sessions_root>/<identity>/creds.json         primary blob
//! <sessions_root>/<identity>/creds.wiped.json   last wiped blob, out of live use
//! <backups_root>/<identity>/<taken_at>.json     snapshots
//! <backups_root>/<identity>/known_good.json     snapshot validated by a connect
//! <backups_root>/<identity>/wiped.json          last wipe
//! ```
//!
//! Every mutation runs behind one store-wide lock, so a snapshot never reads a
//! primary blob that a concurrent save is still writing. Primary writes go
//! through write-temp-then-rename.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tether_protocol::{Credentials, SessionIdentity};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::now_ms;

mod record;

pub use record::BackupRecord;
use record::{KnownGoodMarker, WipeMarker, retained_records};

#[cfg(test)]
mod tests;

const CREDENTIALS_SCHEMA_VERSION: u32 = 1;
const PRIMARY_FILE: &str = "creds.json";
const WIPED_FILE: &str = "creds.wiped.json";
const KNOWN_GOOD_FILE: &str = "known_good.json";
const WIPE_MARKER_FILE: &str = "wiped.json";
/// Snapshots kept by default in addition to the known-good one.
pub const DEFAULT_BACKUP_RETENTION: usize = 5;

/// On-disk envelope shared by the primary blob and its snapshots.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredCredentials {
	schema: u32,
	identity: SessionIdentity,
	credentials: Credentials,
}

/// File-backed credential store for one or more session identities.
#[derive(Debug)]
pub struct CredentialStore {
	sessions_root: PathBuf,
	backups_root: PathBuf,
	retention: usize,
	write_lock: Mutex<()>,
}

impl CredentialStore {
	/// Creates a store rooted at the given session and backup directories.
	///
	/// The backup root may live on a different (replicated) volume.
	pub fn new(sessions_root: impl Into<PathBuf>, backups_root: impl Into<PathBuf>) -> Self {
		Self {
			sessions_root: sessions_root.into(),
			backups_root: backups_root.into(),
			retention: DEFAULT_BACKUP_RETENTION,
			write_lock: Mutex::new(()),
		}
	}

	/// Sets how many recent snapshots survive pruning.
	pub fn with_retention(mut self, keep: usize) -> Self {
		self.retention = keep.max(1);
		self
	}

	pub fn session_dir(&self, identity: &SessionIdentity) -> PathBuf {
		self.sessions_root.join(identity.as_str())
	}

	pub fn backup_dir(&self, identity: &SessionIdentity) -> PathBuf {
		self.backups_root.join(identity.as_str())
	}

	pub fn primary_path(&self, identity: &SessionIdentity) -> PathBuf {
		self.session_dir(identity).join(PRIMARY_FILE)
	}

	/// Reads the primary blob. Missing file is `Ok(None)`; backups are not consulted.
	pub fn load(&self, identity: &SessionIdentity) -> Result<Option<Credentials>> {
		check_identity(identity)?;
		let path = self.primary_path(identity);
		let Some(bytes) = read_optional(&path)? else {
			return Ok(None);
		};
		decode(&path, identity, &bytes).map(Some)
	}

	/// Atomically replaces the primary blob.
	pub fn save(&self, identity: &SessionIdentity, credentials: &Credentials) -> Result<()> {
		check_identity(identity)?;
		let _guard = self.write_lock.lock();
		self.save_locked(identity, credentials)
	}

	/// Moves the primary blob out of live use and tombstones older snapshots.
	///
	/// Snapshot files are left in place, but [`restore_latest`](Self::restore_latest)
	/// ignores anything taken before the wipe. Returns whether a primary blob existed.
	pub fn wipe(&self, identity: &SessionIdentity) -> Result<bool> {
		check_identity(identity)?;
		let _guard = self.write_lock.lock();

		let primary = self.primary_path(identity);
		let existed = match fs::rename(&primary, self.session_dir(identity).join(WIPED_FILE)) {
			Ok(()) => true,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
			Err(err) => return Err(Error::persistence(&primary, err)),
		};

		let marker_path = self.backup_dir(identity).join(WIPE_MARKER_FILE);
		write_atomic(&marker_path, &serde_json::to_vec_pretty(&WipeMarker { wiped_at: now_ms() })?)?;

		info!(target = "tether.store", identity = %identity, existed, "credentials wiped");
		Ok(existed)
	}

	/// Copies the current primary blob into a new timestamped snapshot.
	///
	/// Returns `Ok(None)` (logged) when there is no primary blob yet.
	pub fn snapshot(&self, identity: &SessionIdentity) -> Result<Option<BackupRecord>> {
		check_identity(identity)?;
		let _guard = self.write_lock.lock();
		self.snapshot_locked(identity)
	}

	/// Snapshot for crash paths: gives up after `wait` instead of blocking on the lock.
	///
	/// A panicking thread may itself hold the lock, so this never waits forever.
	pub fn try_snapshot(&self, identity: &SessionIdentity, wait: Duration) -> Result<Option<BackupRecord>> {
		check_identity(identity)?;
		let Some(_guard) = self.write_lock.try_lock_for(wait) else {
			warn!(target = "tether.store", identity = %identity, "store busy; emergency snapshot skipped");
			return Ok(None);
		};
		self.snapshot_locked(identity)
	}

	fn snapshot_locked(&self, identity: &SessionIdentity) -> Result<Option<BackupRecord>> {
		let primary = self.primary_path(identity);
		let Some(bytes) = read_optional(&primary)? else {
			debug!(target = "tether.store", identity = %identity, "no primary credentials; snapshot skipped");
			return Ok(None);
		};

		let dir = self.backup_dir(identity);
		let floor = self.wipe_marker(identity)?.map(|m| m.wiped_at + 1).unwrap_or(0);
		let mut taken_at = now_ms().max(floor);
		while dir.join(record::file_name(taken_at)).exists() {
			taken_at += 1;
		}

		let blob_ref = dir.join(record::file_name(taken_at));
		write_atomic(&blob_ref, &bytes)?;
		let record = BackupRecord {
			identity: identity.clone(),
			taken_at,
			blob_ref,
		};
		debug!(target = "tether.store", identity = %identity, taken_at, "credential snapshot written");

		if let Err(err) = self.prune_locked(identity) {
			warn!(target = "tether.store", identity = %identity, error = %err, "snapshot pruning failed");
		}
		Ok(Some(record))
	}

	/// Restores the newest structurally valid snapshot into the primary slot.
	///
	/// Snapshots taken before the most recent wipe are never candidates.
	pub fn restore_latest(&self, identity: &SessionIdentity) -> Result<Option<Credentials>> {
		check_identity(identity)?;
		let _guard = self.write_lock.lock();

		let wiped_at = self.wipe_marker(identity)?.map(|m| m.wiped_at);
		for record in self.list_backups(identity)? {
			if wiped_at.is_some_and(|wiped_at| record.taken_at <= wiped_at) {
				debug!(target = "tether.store", identity = %identity, taken_at = record.taken_at, "remaining snapshots predate wipe");
				break;
			}

			let bytes = match fs::read(&record.blob_ref) {
				Ok(bytes) => bytes,
				Err(err) => {
					warn!(target = "tether.store", path = %record.blob_ref.display(), error = %err, "unreadable snapshot skipped");
					continue;
				}
			};
			match decode(&record.blob_ref, identity, &bytes) {
				Ok(credentials) if credentials.is_structurally_valid() => {
					self.save_locked(identity, &credentials)?;
					info!(target = "tether.store", identity = %identity, taken_at = record.taken_at, "credentials restored from snapshot");
					return Ok(Some(credentials));
				}
				Ok(_) => {
					warn!(target = "tether.store", path = %record.blob_ref.display(), "empty snapshot skipped");
				}
				Err(err) => {
					warn!(target = "tether.store", path = %record.blob_ref.display(), error = %err, "invalid snapshot skipped");
				}
			}
		}
		Ok(None)
	}

	/// Lists snapshot records, newest first.
	pub fn list_backups(&self, identity: &SessionIdentity) -> Result<Vec<BackupRecord>> {
		check_identity(identity)?;
		let dir = self.backup_dir(identity);
		let entries = match fs::read_dir(&dir) {
			Ok(entries) => entries,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(err) => return Err(Error::persistence(&dir, err)),
		};

		let mut records = Vec::new();
		for entry in entries {
			let entry = entry.map_err(|err| Error::persistence(&dir, err))?;
			let Some(taken_at) = entry.file_name().to_str().and_then(record::parse_file_name) else {
				continue;
			};
			records.push(BackupRecord {
				identity: identity.clone(),
				taken_at,
				blob_ref: entry.path(),
			});
		}
		records.sort_by(|a, b| b.taken_at.cmp(&a.taken_at));
		Ok(records)
	}

	/// Pins a snapshot taken after a successful connect so pruning never drops it.
	pub fn mark_known_good(&self, record: &BackupRecord) -> Result<()> {
		check_identity(&record.identity)?;
		let _guard = self.write_lock.lock();
		let path = self.backup_dir(&record.identity).join(KNOWN_GOOD_FILE);
		write_atomic(&path, &serde_json::to_vec_pretty(&KnownGoodMarker { taken_at: record.taken_at })?)
	}

	/// `takenAt` of the pinned known-good snapshot, if any.
	pub fn known_good(&self, identity: &SessionIdentity) -> Result<Option<u64>> {
		check_identity(identity)?;
		Ok(read_marker::<KnownGoodMarker>(&self.backup_dir(identity).join(KNOWN_GOOD_FILE))?.map(|m| m.taken_at))
	}

	/// Deletes snapshots outside the retention window. Returns how many were removed.
	pub fn prune(&self, identity: &SessionIdentity) -> Result<usize> {
		check_identity(identity)?;
		let _guard = self.write_lock.lock();
		self.prune_locked(identity)
	}

	fn save_locked(&self, identity: &SessionIdentity, credentials: &Credentials) -> Result<()> {
		let envelope = StoredCredentials {
			schema: CREDENTIALS_SCHEMA_VERSION,
			identity: identity.clone(),
			credentials: credentials.clone(),
		};
		write_atomic(&self.primary_path(identity), &serde_json::to_vec_pretty(&envelope)?)
	}

	fn prune_locked(&self, identity: &SessionIdentity) -> Result<usize> {
		let records = self.list_backups(identity)?;
		let known_good = read_marker::<KnownGoodMarker>(&self.backup_dir(identity).join(KNOWN_GOOD_FILE))?.map(|m| m.taken_at);
		let keep = retained_records(&records, self.retention, known_good);

		let mut removed = 0;
		for record in records.iter().filter(|r| !keep.contains(&r.taken_at)) {
			match fs::remove_file(&record.blob_ref) {
				Ok(()) => removed += 1,
				Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
				Err(err) => return Err(Error::persistence(&record.blob_ref, err)),
			}
		}
		if removed > 0 {
			debug!(target = "tether.store", identity = %identity, removed, "pruned old snapshots");
		}
		Ok(removed)
	}

	fn wipe_marker(&self, identity: &SessionIdentity) -> Result<Option<WipeMarker>> {
		read_marker(&self.backup_dir(identity).join(WIPE_MARKER_FILE))
	}
}

fn check_identity(identity: &SessionIdentity) -> Result<()> {
	if identity.is_path_safe() {
		Ok(())
	} else {
		Err(Error::Config(format!("session identity {identity:?} is not a valid directory name")))
	}
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
	match fs::read(path) {
		Ok(bytes) => Ok(Some(bytes)),
		Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(err) => Err(Error::persistence(path, err)),
	}
}

fn read_marker<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
	let Some(bytes) = read_optional(path)? else {
		return Ok(None);
	};
	match serde_json::from_slice(&bytes) {
		Ok(marker) => Ok(Some(marker)),
		Err(err) => {
			warn!(target = "tether.store", path = %path.display(), error = %err, "ignoring unreadable marker");
			Ok(None)
		}
	}
}

fn decode(path: &Path, identity: &SessionIdentity, bytes: &[u8]) -> Result<Credentials> {
	let corrupt = |message: String| Error::CorruptCredentials {
		path: path.to_path_buf(),
		message,
	};
	let envelope: StoredCredentials = serde_json::from_slice(bytes).map_err(|err| corrupt(err.to_string()))?;
	if envelope.schema != CREDENTIALS_SCHEMA_VERSION {
		return Err(corrupt(format!("unsupported schema {}", envelope.schema)));
	}
	if &envelope.identity != identity {
		return Err(corrupt(format!("belongs to identity {}", envelope.identity)));
	}
	Ok(envelope.credentials)
}

/// Writes `bytes` next to `path` and renames into place.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent).map_err(|err| Error::persistence(parent, err))?;
	}

	let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
	tmp_name.push(".tmp");
	let tmp = path.with_file_name(tmp_name);

	let write = || -> std::io::Result<()> {
		let mut file = fs::File::create(&tmp)?;
		file.write_all(bytes)?;
		file.sync_all()?;
		fs::rename(&tmp, path)
	};
	write().map_err(|err| {
		let _ = fs::remove_file(&tmp);
		Error::persistence(path, err)
	})
}
