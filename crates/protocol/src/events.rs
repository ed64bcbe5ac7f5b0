//! Events reported by the remote service: disconnect reasons, authentication
//! challenges, and inbound chat messages.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Remote close status codes understood by the failure classifier.
pub mod status_code {
	pub const LOGGED_OUT: u16 = 401;
	pub const FORBIDDEN: u16 = 403;
	pub const CONNECTION_LOST: u16 = 408;
	pub const MULTIDEVICE_MISMATCH: u16 = 411;
	pub const CONNECTION_CLOSED: u16 = 428;
	pub const RATE_LIMITED: u16 = 429;
	pub const CONNECTION_REPLACED: u16 = 440;
	pub const BAD_SESSION: u16 = 500;
	pub const UNAVAILABLE_SERVICE: u16 = 503;
	pub const RESTART_REQUIRED: u16 = 515;
}

/// Why a session (or a connection attempt) ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DisconnectReason {
	/// The remote closed the session with a status code.
	Remote {
		code: u16,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		message: Option<String>,
	},
	/// Local socket/network failure.
	Transport { message: String },
	/// The session event stream ended without a close frame.
	StreamEnded,
}

impl DisconnectReason {
	pub fn remote(code: u16) -> Self {
		Self::Remote { code, message: None }
	}

	pub fn transport(message: impl Into<String>) -> Self {
		Self::Transport { message: message.into() }
	}

	/// Returns the remote status code, if any.
	pub fn code(&self) -> Option<u16> {
		match self {
			Self::Remote { code, .. } => Some(*code),
			_ => None,
		}
	}
}

impl fmt::Display for DisconnectReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Remote { code, message: Some(message) } => write!(f, "remote closed session ({code}): {message}"),
			Self::Remote { code, message: None } => write!(f, "remote closed session ({code})"),
			Self::Transport { message } => write!(f, "transport failure: {message}"),
			Self::StreamEnded => f.write_str("session stream ended"),
		}
	}
}

/// A challenge presented to a human to authorize a new session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Challenge {
	/// Raw QR payload; rendering is the presentation layer's job.
	Qr { payload: String },
	/// Out-of-band pairing code to type on the phone.
	PairingCode { code: String, expires_in_secs: u64 },
}

/// Reasons a challenge could not be shown or is no longer usable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChallengeProblem {
	/// The challenge timed out before the session was linked.
	Expired,
	/// Pairing configuration is missing or invalid.
	Misconfigured { message: String },
	/// The remote refused or failed the pairing-code request.
	RequestFailed { message: String },
}

impl fmt::Display for ChallengeProblem {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Expired => f.write_str("challenge expired, please reset the connection"),
			Self::Misconfigured { message } => write!(f, "pairing is misconfigured: {message}"),
			Self::RequestFailed { message } => write!(f, "pairing code request failed: {message}"),
		}
	}
}

/// A chat message received on the live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
	pub id: String,
	/// Conversation the message arrived in; replies go here.
	pub chat: String,
	/// Author of the message (equals `chat` in direct conversations).
	pub sender: String,
	#[serde(default)]
	pub text: Option<String>,
	#[serde(default)]
	pub timestamp: u64,
}
