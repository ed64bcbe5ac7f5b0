use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tempfile::TempDir;
use tether_cli::cli::Cli;
use tether_cli::config::{FileConfig, Settings};
use tether_runtime::auth::AuthMode;
use tether_runtime::backoff::EnvironmentProfile;

fn settings_for(args: &[&str], file: FileConfig, detected: EnvironmentProfile) -> Settings {
	let cli = Cli::try_parse_from(args).unwrap();
	Settings::resolve(file, cli.overrides(), detected).unwrap()
}

#[test]
fn full_config_file_round_trips_into_settings() {
	let tmp = TempDir::new().unwrap();
	let path = tmp.path().join("tether.json");
	std::fs::write(
		&path,
		r#"{
			"identity": "support-bot",
			"dataDir": "/var/lib/tether",
			"backupDir": "/mnt/replicated/tether",
			"relayUrl": "ws://127.0.0.1:7070",
			"backupIntervalSecs": 300,
			"backupRetention": 8,
			"ownerTarget": "owner@chat",
			"notifyBackups": true,
			"statusAddr": "127.0.0.1:8088",
			"retry": { "baseDelayMs": 500, "maxDelayMs": 30000, "jitterRatio": 0.0 },
			"fingerprint": { "platform": "Linux", "browser": "Firefox", "version": "126" }
		}"#,
	)
	.unwrap();

	let file = FileConfig::load(Some(&path)).unwrap();
	let settings = settings_for(&["tether", "run"], file, EnvironmentProfile::Interactive);

	assert_eq!(settings.identity.as_str(), "support-bot");
	assert_eq!(settings.sessions_dir(), PathBuf::from("/var/lib/tether/sessions"));
	assert_eq!(settings.backup_dir, PathBuf::from("/mnt/replicated/tether"));
	assert_eq!(settings.backup_interval, Duration::from_secs(300));
	assert_eq!(settings.backup_retention, 8);
	assert_eq!(settings.retry.base_delay, Duration::from_millis(500));
	assert_eq!(settings.retry.attempt_ceiling, 10);
	assert_eq!(settings.fingerprint.label(), "Linux Firefox");
	assert_eq!(settings.status_addr, Some("127.0.0.1:8088".parse().unwrap()));

	let supervisor = settings.supervisor_config();
	assert_eq!(supervisor.owner_target.as_deref(), Some("owner@chat"));
	assert!(supervisor.notify_backups);
	assert_eq!(supervisor.retry, settings.retry);
}

#[test]
fn run_flags_override_file_and_detection() {
	let file = FileConfig::parse(r#"{"relayUrl":"ws://file","ownerTarget":"file-owner"}"#).unwrap();
	let settings = settings_for(
		&[
			"tether",
			"--data-dir",
			"/tmp/flag-data",
			"run",
			"--relay-url",
			"ws://flag",
			"--phone",
			"+44 20 7946 0958",
			"--profile",
			"interactive",
		],
		file,
		EnvironmentProfile::Unattended,
	);

	assert_eq!(settings.relay_url.as_deref(), Some("ws://flag"));
	assert_eq!(settings.owner_target.as_deref(), Some("file-owner"));
	assert_eq!(settings.profile, EnvironmentProfile::Interactive);
	assert_eq!(settings.data_dir, PathBuf::from("/tmp/flag-data"));
	assert!(matches!(settings.auth.mode, AuthMode::PairingCode { .. }));
}

#[test]
fn detected_profile_applies_without_explicit_choice() {
	let settings = settings_for(&["tether", "status"], FileConfig::default(), EnvironmentProfile::Unattended);
	assert_eq!(settings.profile, EnvironmentProfile::Unattended);
	assert!(settings.retry.infinite_in_production);
	assert_eq!(settings.retry.max_delay, Duration::from_secs(300));
}

#[test]
fn backups_subcommands_use_the_replicated_backup_dir() {
	let file = FileConfig::parse(r#"{"dataDir":"/data"}"#).unwrap();
	let settings = settings_for(
		&["tether", "backups", "--backup-dir", "/replicated/backups", "list"],
		file,
		EnvironmentProfile::Interactive,
	);
	assert_eq!(settings.backup_dir, PathBuf::from("/replicated/backups"));
	assert_eq!(
		settings.store().backup_dir(&settings.identity),
		PathBuf::from("/replicated/backups/default")
	);
}
