use std::fs;

use tempfile::TempDir;
use tether_protocol::{CredentialMeta, Credentials, SessionIdentity};

use super::*;

fn store(tmp: &TempDir) -> CredentialStore {
	CredentialStore::new(tmp.path().join("sessions"), tmp.path().join("backups"))
}

fn identity() -> SessionIdentity {
	SessionIdentity::new("main-bot")
}

fn creds(tag: &str) -> Credentials {
	Credentials::new(
		CredentialMeta {
			registered: true,
			device_label: "Ubuntu Chrome".to_string(),
			saved_at: 1_700_000_000_000,
		},
		format!("session-material-{tag}").into_bytes(),
	)
}

#[test]
fn save_then_load_returns_equal_credentials() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp);
	let original = creds("a");

	store.save(&identity(), &original).unwrap();

	assert_eq!(store.load(&identity()).unwrap(), Some(original));
}

#[test]
fn load_without_primary_is_not_found() {
	let tmp = TempDir::new().unwrap();
	assert_eq!(store(&tmp).load(&identity()).unwrap(), None);
}

#[test]
fn load_does_not_fall_back_to_backups() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp);
	store.save(&identity(), &creds("a")).unwrap();
	store.snapshot(&identity()).unwrap();
	fs::remove_file(store.primary_path(&identity())).unwrap();

	assert_eq!(store.load(&identity()).unwrap(), None);
}

#[test]
fn corrupt_primary_is_reported() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp);
	let path = store.primary_path(&identity());
	fs::create_dir_all(path.parent().unwrap()).unwrap();
	fs::write(&path, b"{ half a file").unwrap();

	let err = store.load(&identity()).unwrap_err();
	assert!(matches!(err, Error::CorruptCredentials { .. }), "got {err:?}");
}

#[test]
fn primary_from_another_identity_is_rejected() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp);
	store.save(&SessionIdentity::new("other"), &creds("a")).unwrap();
	fs::create_dir_all(store.session_dir(&identity())).unwrap();
	fs::copy(store.primary_path(&SessionIdentity::new("other")), store.primary_path(&identity())).unwrap();

	assert!(store.load(&identity()).is_err());
}

#[test]
fn save_leaves_no_temp_file_behind() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp);
	store.save(&identity(), &creds("a")).unwrap();
	store.save(&identity(), &creds("b")).unwrap();

	let names: Vec<String> = fs::read_dir(store.session_dir(&identity()))
		.unwrap()
		.map(|e| e.unwrap().file_name().to_string_lossy().to_string())
		.collect();
	assert_eq!(names, vec!["creds.json".to_string()]);
	assert_eq!(store.load(&identity()).unwrap(), Some(creds("b")));
}

#[test]
fn unsafe_identity_is_a_config_error() {
	let tmp = TempDir::new().unwrap();
	let err = store(&tmp).load(&SessionIdentity::new("../escape")).unwrap_err();
	assert!(matches!(err, Error::Config(_)));
}

#[test]
fn wipe_removes_primary_but_keeps_snapshots() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp);
	store.save(&identity(), &creds("a")).unwrap();
	store.snapshot(&identity()).unwrap().unwrap();

	assert!(store.wipe(&identity()).unwrap());

	assert_eq!(store.load(&identity()).unwrap(), None);
	assert_eq!(store.list_backups(&identity()).unwrap().len(), 1);
	assert!(store.session_dir(&identity()).join("creds.wiped.json").exists());
}

#[test]
fn wipe_without_primary_reports_false() {
	let tmp = TempDir::new().unwrap();
	assert!(!store(&tmp).wipe(&identity()).unwrap());
}

#[test]
fn snapshot_without_primary_is_skipped() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp);
	assert_eq!(store.snapshot(&identity()).unwrap(), None);
	assert!(store.list_backups(&identity()).unwrap().is_empty());
}

#[test]
fn restore_after_primary_loss_returns_snapshot_and_repopulates() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp);
	store.save(&identity(), &creds("t1")).unwrap();
	let record = store.snapshot(&identity()).unwrap().unwrap();

	// Simulates an ephemeral filesystem losing the session directory.
	fs::remove_dir_all(store.session_dir(&identity())).unwrap();
	assert_eq!(store.load(&identity()).unwrap(), None);

	let restored = store.restore_latest(&identity()).unwrap();
	assert_eq!(restored, Some(creds("t1")));
	assert_eq!(store.load(&identity()).unwrap(), Some(creds("t1")));
	assert!(record.blob_ref.exists(), "restore must not consume the snapshot");
}

#[test]
fn restore_prefers_newest_valid_snapshot() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp);
	store.save(&identity(), &creds("old")).unwrap();
	store.snapshot(&identity()).unwrap().unwrap();
	store.save(&identity(), &creds("new")).unwrap();
	let newest = store.snapshot(&identity()).unwrap().unwrap();
	fs::write(&newest.blob_ref, b"not json").unwrap();
	fs::remove_file(store.primary_path(&identity())).unwrap();

	assert_eq!(store.restore_latest(&identity()).unwrap(), Some(creds("old")));
}

#[test]
fn restore_with_no_snapshots_is_not_found() {
	let tmp = TempDir::new().unwrap();
	assert_eq!(store(&tmp).restore_latest(&identity()).unwrap(), None);
}

#[test]
fn restore_ignores_snapshots_taken_before_wipe() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp);
	store.save(&identity(), &creds("revoked")).unwrap();
	store.snapshot(&identity()).unwrap().unwrap();
	store.wipe(&identity()).unwrap();

	assert_eq!(store.restore_latest(&identity()).unwrap(), None);

	store.save(&identity(), &creds("fresh")).unwrap();
	store.snapshot(&identity()).unwrap().unwrap();
	fs::remove_file(store.primary_path(&identity())).unwrap();
	assert_eq!(store.restore_latest(&identity()).unwrap(), Some(creds("fresh")));
}

#[test]
fn snapshots_are_pruned_to_retention_plus_known_good() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp).with_retention(2);
	store.save(&identity(), &creds("a")).unwrap();
	let pinned = store.snapshot(&identity()).unwrap().unwrap();
	assert_eq!(store.known_good(&identity()).unwrap(), None);
	store.mark_known_good(&pinned).unwrap();
	assert_eq!(store.known_good(&identity()).unwrap(), Some(pinned.taken_at));

	for _ in 0..4 {
		store.snapshot(&identity()).unwrap().unwrap();
	}

	let remaining: Vec<u64> = store.list_backups(&identity()).unwrap().iter().map(|r| r.taken_at).collect();
	assert_eq!(remaining.len(), 3, "two newest plus the pinned one: {remaining:?}");
	assert!(remaining.contains(&pinned.taken_at));
}

#[test]
fn snapshot_timestamps_are_unique() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp).with_retention(10);
	store.save(&identity(), &creds("a")).unwrap();
	let first = store.snapshot(&identity()).unwrap().unwrap();
	let second = store.snapshot(&identity()).unwrap().unwrap();
	assert!(second.taken_at > first.taken_at);
}

#[test]
fn emergency_snapshot_gives_up_while_store_is_locked() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp);
	store.save(&identity(), &creds("a")).unwrap();

	{
		let _held = store.write_lock.lock();
		let skipped = store.try_snapshot(&identity(), std::time::Duration::from_millis(20)).unwrap();
		assert_eq!(skipped, None);
	}

	let taken = store.try_snapshot(&identity(), std::time::Duration::from_millis(20)).unwrap();
	assert!(taken.is_some());
}
