//! Error taxonomy for the session runtime.

use std::path::PathBuf;

use tether_protocol::{DisconnectReason, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum Error {
	/// Socket or network failure.
	#[error("transport error: {0}")]
	Transport(String),

	/// The remote refused the handshake or closed the session.
	#[error("protocol rejection: {reason}")]
	ProtocolRejection { reason: DisconnectReason },

	/// A QR or pairing challenge timed out locally.
	#[error("authentication challenge expired")]
	AuthExpired,

	#[error("persistence error at {}: {source}", path.display())]
	Persistence {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("corrupt credential file {}: {message}", path.display())]
	CorruptCredentials { path: PathBuf, message: String },

	#[error("configuration error: {0}")]
	Config(String),

	/// A blocking store call panicked or was cancelled.
	#[error("blocking task failed: {0}")]
	Blocking(String),

	/// The supervisor task has stopped.
	#[error("supervisor is not running")]
	Shutdown,

	#[error(transparent)]
	Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
	pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
		Self::Persistence { path: path.into(), source }
	}

	/// Stable kind recorded in the published connection state.
	pub fn kind(&self) -> ErrorKind {
		match self {
			Self::Transport(_) | Self::Shutdown => ErrorKind::Transport,
			Self::ProtocolRejection { .. } => ErrorKind::ProtocolRejection,
			Self::AuthExpired => ErrorKind::AuthExpired,
			Self::Persistence { .. } | Self::CorruptCredentials { .. } | Self::Blocking(_) | Self::Json(_) => ErrorKind::Persistence,
			Self::Config(_) => ErrorKind::Config,
		}
	}

	/// Reason handed to the failure classifier when a connect attempt fails.
	pub fn disconnect_reason(&self) -> DisconnectReason {
		match self {
			Self::ProtocolRejection { reason } => reason.clone(),
			Self::Transport(message) => DisconnectReason::transport(message.clone()),
			other => DisconnectReason::transport(other.to_string()),
		}
	}
}
