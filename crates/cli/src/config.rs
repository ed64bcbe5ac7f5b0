//! Layered configuration: defaults, then `tether.json`, then flags and environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tether_protocol::{ClientFingerprint, SessionIdentity};
use tether_runtime::auth::{AuthConfig, AuthMode, DEFAULT_CHALLENGE_TTL};
use tether_runtime::backoff::{EnvironmentProfile, RetryPolicy};
use tether_runtime::backup::DEFAULT_BACKUP_INTERVAL;
use tether_runtime::credentials::{CredentialStore, DEFAULT_BACKUP_RETENTION};
use tether_runtime::supervisor::SupervisorConfig;
use tracing::debug;

use crate::error::{CliError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "tether.json";
pub const DEFAULT_IDENTITY: &str = "default";
pub const CONTROL_SOCKET_FILE: &str = "tether.sock";

/// Hosting markers that mean nobody is watching the terminal.
const UNATTENDED_MARKERS: &[&str] = &["KUBERNETES_SERVICE_HOST", "DYNO", "RENDER", "RAILWAY_ENVIRONMENT", "FLY_APP_NAME"];

/// Contents of `tether.json`. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct FileConfig {
	pub identity: Option<String>,
	pub data_dir: Option<PathBuf>,
	pub backup_dir: Option<PathBuf>,
	pub profile: Option<String>,
	pub relay_url: Option<String>,
	pub phone_number: Option<String>,
	pub default_country_code: Option<String>,
	pub challenge_ttl_secs: Option<u64>,
	/// Zero disables periodic snapshots.
	pub backup_interval_secs: Option<u64>,
	pub backup_retention: Option<usize>,
	pub owner_target: Option<String>,
	pub notify_backups: Option<bool>,
	pub status_addr: Option<SocketAddr>,
	pub retry: RetryOverrides,
	pub fingerprint: Option<ClientFingerprint>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct RetryOverrides {
	pub base_delay_ms: Option<u64>,
	pub multiplier: Option<f64>,
	pub max_delay_ms: Option<u64>,
	pub jitter_ratio: Option<f64>,
	pub infinite_in_production: Option<bool>,
	pub attempt_ceiling: Option<u32>,
	pub fast_retry_delay_ms: Option<u64>,
	pub fast_retry_limit: Option<u32>,
}

impl FileConfig {
	pub fn parse(raw: &str) -> Result<Self> {
		serde_json::from_str(raw).map_err(|err| CliError::Config(format!("invalid config: {err}")))
	}

	/// Reads `path`, or `./tether.json` when no path was given.
	///
	/// An explicit path must exist; the implicit default may be absent.
	pub fn load(path: Option<&Path>) -> Result<Self> {
		let (path, required) = match path {
			Some(path) => (path.to_path_buf(), true),
			None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
		};
		match std::fs::read_to_string(&path) {
			Ok(raw) => {
				debug!(target = "tether", path = %path.display(), "loaded config file");
				Self::parse(&raw).map_err(|err| CliError::Config(format!("{}: {err}", path.display())))
			}
			Err(err) if err.kind() == std::io::ErrorKind::NotFound && !required => Ok(Self::default()),
			Err(err) => Err(CliError::Config(format!("cannot read {}: {err}", path.display()))),
		}
	}
}

/// Flag and environment values; `Some` beats the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
	pub identity: Option<String>,
	pub data_dir: Option<PathBuf>,
	pub backup_dir: Option<PathBuf>,
	pub profile: Option<EnvironmentProfile>,
	pub relay_url: Option<String>,
	pub phone_number: Option<String>,
	pub country_code: Option<String>,
	pub owner_target: Option<String>,
	pub status_addr: Option<SocketAddr>,
}

/// Fully resolved settings for one process.
#[derive(Debug, Clone)]
pub struct Settings {
	pub identity: SessionIdentity,
	pub data_dir: PathBuf,
	pub backup_dir: PathBuf,
	pub profile: EnvironmentProfile,
	pub relay_url: Option<String>,
	pub auth: AuthConfig,
	pub retry: RetryPolicy,
	pub fingerprint: ClientFingerprint,
	pub backup_interval: Duration,
	pub backup_retention: usize,
	pub owner_target: Option<String>,
	pub notify_backups: bool,
	pub status_addr: Option<SocketAddr>,
}

impl Settings {
	/// Merges defaults, `file` and `overrides`. `detected` is used when no profile was chosen.
	pub fn resolve(file: FileConfig, overrides: Overrides, detected: EnvironmentProfile) -> Result<Self> {
		let identity = SessionIdentity::new(
			overrides
				.identity
				.or(file.identity)
				.unwrap_or_else(|| DEFAULT_IDENTITY.to_string()),
		);
		if !identity.is_path_safe() {
			return Err(CliError::Config(format!("identity {identity:?} must be a plain name")));
		}

		let data_dir = overrides.data_dir.or(file.data_dir).unwrap_or_else(default_data_dir);
		let backup_dir = overrides
			.backup_dir
			.or(file.backup_dir)
			.unwrap_or_else(|| data_dir.join("backups"));

		let profile = match (overrides.profile, file.profile.as_deref()) {
			(Some(profile), _) => profile,
			(None, Some(raw)) => raw.parse().map_err(CliError::Config)?,
			(None, None) => detected,
		};

		let mode = match overrides.phone_number.or(file.phone_number) {
			Some(phone_number) => AuthMode::PairingCode { phone_number },
			None => AuthMode::Qr,
		};
		if file.challenge_ttl_secs == Some(0) {
			return Err(CliError::Config("challengeTtlSecs must be positive".to_string()));
		}
		let auth = AuthConfig {
			mode,
			default_country_code: overrides
				.country_code
				.or(file.default_country_code)
				.unwrap_or_default(),
			challenge_ttl: file
				.challenge_ttl_secs
				.map(Duration::from_secs)
				.unwrap_or(DEFAULT_CHALLENGE_TTL),
		};

		Ok(Self {
			identity,
			data_dir,
			backup_dir,
			profile,
			relay_url: overrides.relay_url.or(file.relay_url),
			auth,
			retry: file.retry.apply(profile.retry_policy())?,
			fingerprint: file.fingerprint.unwrap_or_else(|| default_fingerprint(profile)),
			backup_interval: file
				.backup_interval_secs
				.map(Duration::from_secs)
				.unwrap_or(DEFAULT_BACKUP_INTERVAL),
			backup_retention: file.backup_retention.unwrap_or(DEFAULT_BACKUP_RETENTION),
			owner_target: overrides.owner_target.or(file.owner_target),
			notify_backups: file.notify_backups.unwrap_or(false),
			status_addr: overrides.status_addr.or(file.status_addr),
		})
	}

	pub fn sessions_dir(&self) -> PathBuf {
		self.data_dir.join("sessions")
	}

	pub fn control_socket(&self) -> PathBuf {
		self.data_dir.join(CONTROL_SOCKET_FILE)
	}

	pub fn store(&self) -> CredentialStore {
		CredentialStore::new(self.sessions_dir(), self.backup_dir.clone()).with_retention(self.backup_retention)
	}

	pub fn supervisor_config(&self) -> SupervisorConfig {
		SupervisorConfig {
			identity: self.identity.clone(),
			retry: self.retry.clone(),
			auth: self.auth.clone(),
			fingerprint: self.fingerprint.clone(),
			backup_interval: self.backup_interval,
			owner_target: self.owner_target.clone(),
			notify_backups: self.notify_backups,
			reclaim_live_marker: false,
		}
	}
}

impl RetryOverrides {
	fn apply(&self, mut policy: RetryPolicy) -> Result<RetryPolicy> {
		if let Some(ms) = self.base_delay_ms {
			policy.base_delay = Duration::from_millis(ms);
		}
		if let Some(multiplier) = self.multiplier {
			policy.multiplier = multiplier;
		}
		if let Some(ms) = self.max_delay_ms {
			policy.max_delay = Duration::from_millis(ms);
		}
		if let Some(ratio) = self.jitter_ratio {
			policy.jitter_ratio = ratio;
		}
		if let Some(infinite) = self.infinite_in_production {
			policy.infinite_in_production = infinite;
		}
		if let Some(ceiling) = self.attempt_ceiling {
			policy.attempt_ceiling = ceiling;
		}
		if let Some(ms) = self.fast_retry_delay_ms {
			policy.fast_retry_delay = Duration::from_millis(ms);
		}
		if let Some(limit) = self.fast_retry_limit {
			policy.fast_retry_limit = limit;
		}

		if policy.multiplier < 1.0 || !policy.multiplier.is_finite() {
			return Err(CliError::Config(format!("retry.multiplier must be at least 1, got {}", policy.multiplier)));
		}
		if !(0.0..=1.0).contains(&policy.jitter_ratio) {
			return Err(CliError::Config(format!("retry.jitterRatio must be within 0..=1, got {}", policy.jitter_ratio)));
		}
		if policy.base_delay > policy.max_delay {
			return Err(CliError::Config("retry.baseDelayMs exceeds retry.maxDelayMs".to_string()));
		}
		if policy.attempt_ceiling == 0 {
			return Err(CliError::Config("retry.attemptCeiling must be positive".to_string()));
		}
		Ok(policy)
	}
}

/// Picks the profile from well-known hosting markers.
///
/// `var` is the environment lookup, injectable for tests.
pub fn detect_profile(var: impl Fn(&str) -> Option<String>) -> EnvironmentProfile {
	match UNATTENDED_MARKERS.iter().find(|name| var(name).is_some_and(|v| !v.is_empty())) {
		Some(marker) => {
			debug!(target = "tether", marker, "hosting marker found; using unattended profile");
			EnvironmentProfile::Unattended
		}
		None => EnvironmentProfile::Interactive,
	}
}

pub fn detect_profile_from_env() -> EnvironmentProfile {
	detect_profile(|name| std::env::var(name).ok())
}

fn default_fingerprint(profile: EnvironmentProfile) -> ClientFingerprint {
	match profile {
		EnvironmentProfile::Interactive => ClientFingerprint::new("macOS", "Desktop", "14.4.1"),
		EnvironmentProfile::Unattended => ClientFingerprint::default(),
	}
}

fn default_data_dir() -> PathBuf {
	dirs::data_local_dir()
		.map(|dir| dir.join("tether"))
		.unwrap_or_else(|| PathBuf::from(".tether"))
}
