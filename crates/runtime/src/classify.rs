//! Maps disconnect reasons to a retry disposition.

use tether_protocol::{DisconnectReason, status_code};

/// How the supervisor reacts to a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
	/// The remote invalidated the session: wipe credentials and re-authenticate.
	Fatal,
	/// Transient drop of a still-valid session: retry within seconds.
	RecoverableFast,
	/// Anything else: retry on the backoff schedule.
	RecoverableBackoff,
}

impl Disposition {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Fatal => "fatal",
			Self::RecoverableFast => "recoverable_fast",
			Self::RecoverableBackoff => "recoverable_backoff",
		}
	}
}

/// Classifies a disconnect. Pure and total.
pub fn classify(reason: &DisconnectReason) -> Disposition {
	match reason.code() {
		Some(status_code::LOGGED_OUT | status_code::FORBIDDEN) => Disposition::Fatal,
		Some(
			status_code::CONNECTION_CLOSED
			| status_code::CONNECTION_LOST
			| status_code::CONNECTION_REPLACED
			| status_code::RESTART_REQUIRED,
		) => Disposition::RecoverableFast,
		_ => Disposition::RecoverableBackoff,
	}
}
