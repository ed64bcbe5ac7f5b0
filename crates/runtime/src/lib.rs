//! Connection lifecycle supervision and credential persistence.
//!
//! The actor behind a [`supervisor::SupervisorHandle`] owns the long-lived
//! session with the remote messaging service. It loads credentials from the
//! [`credentials::CredentialStore`], drives connection attempts through a
//! [`client::ProtocolClient`], classifies every disconnect with
//! [`classify::classify`], waits according to [`backoff::RetryPolicy`], and
//! falls back to the [`auth::AuthFlowController`] when no usable credentials
//! exist. While connected, the [`backup::BackupScheduler`] snapshots the
//! credential blob so a session survives hosts whose filesystem resets.

pub mod auth;
pub mod backoff;
pub mod backup;
pub mod classify;
pub mod client;
pub mod credentials;
pub mod error;
pub mod process;
pub mod relay;
pub mod sinks;
pub mod supervisor;
pub mod testing;

pub use error::{Error, Result};
pub use tether_protocol as protocol;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_millis() as u64)
		.unwrap_or(0)
}
