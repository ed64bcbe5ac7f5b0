//! JSON frames exchanged with a relay bridge over WebSocket.
//!
//! The bridge owns the messaging network's own wire protocol; these frames are
//! the narrow contract between it and the supervisor.

use serde::{Deserialize, Serialize};

use crate::{ClientFingerprint, Credentials, InboundMessage, SessionIdentity};

/// Frames sent to the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
	/// First frame on every connection.
	Hello {
		identity: SessionIdentity,
		credentials: Option<Credentials>,
		fingerprint: ClientFingerprint,
	},
	Send {
		target: String,
		content: String,
	},
	RequestPairingCode {
		request_id: u64,
		number: String,
	},
	Close,
}

/// Frames received from the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
	Qr {
		payload: String,
	},
	Open,
	Credentials {
		credentials: Credentials,
	},
	PairingCode {
		request_id: u64,
		code: String,
	},
	PairingCodeError {
		request_id: u64,
		message: String,
	},
	Message {
		message: InboundMessage,
	},
	Close {
		code: u16,
		#[serde(default)]
		message: Option<String>,
	},
}
