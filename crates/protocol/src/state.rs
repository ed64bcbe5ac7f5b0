//! Published connection-state snapshot.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle phase of the single supervised session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
	#[default]
	Idle,
	AwaitingChallenge,
	Connecting,
	Connected,
	Closing,
	Faulted,
}

impl ConnectionPhase {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Idle => "idle",
			Self::AwaitingChallenge => "awaiting_challenge",
			Self::Connecting => "connecting",
			Self::Connected => "connected",
			Self::Closing => "closing",
			Self::Faulted => "faulted",
		}
	}
}

impl fmt::Display for ConnectionPhase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Stable classification of the most recent failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	Transport,
	ProtocolRejection,
	AuthExpired,
	Persistence,
	Config,
	/// No credentials existed when a cycle started.
	CredentialsMissing,
	/// The previous process ended while connected.
	CrashRecovered,
}

impl ErrorKind {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Transport => "transport",
			Self::ProtocolRejection => "protocol_rejection",
			Self::AuthExpired => "auth_expired",
			Self::Persistence => "persistence",
			Self::Config => "config",
			Self::CredentialsMissing => "credentials_missing",
			Self::CrashRecovered => "crash_recovered",
		}
	}
}

impl fmt::Display for ErrorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
	pub kind: ErrorKind,
	pub message: String,
	pub at: u64,
}

/// Immutable snapshot published on every supervisor transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
	pub phase: ConnectionPhase,
	/// Long-horizon backoff counter; reset on every successful connect.
	pub attempt_count: u32,
	pub last_error: Option<LastError>,
	pub connected_at: Option<u64>,
	/// Successful connects after the first one in this process.
	pub reconnect_count: u32,
	/// When the scheduled retry fires, while idle between attempts.
	#[serde(default)]
	pub retry_at: Option<u64>,
	/// Latest credential write/snapshot failure, surfaced to operators.
	#[serde(default)]
	pub persistence_error: Option<LastError>,
}

impl ConnectionState {
	pub fn is_connected(&self) -> bool {
		self.phase == ConnectionPhase::Connected
	}
}
