//! Challenge selection for linking a new session: QR payloads or pairing codes.
//!
//! The controller holds no timers or I/O. The supervisor feeds it protocol
//! events and acts on what it returns, so every decision stays on the
//! supervisor's execution context.

use std::time::Duration;

use tether_protocol::{Challenge, ChallengeProblem};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// How long a presented challenge stays usable.
pub const DEFAULT_CHALLENGE_TTL: Duration = Duration::from_secs(60);

const MIN_PHONE_DIGITS: usize = 8;
const MAX_PHONE_DIGITS: usize = 15;
/// Longest national number we assume never carries a country code.
const NATIONAL_NUMBER_DIGITS: usize = 10;

/// Challenge style, fixed by configuration for the whole process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthMode {
	#[default]
	Qr,
	PairingCode {
		phone_number: String,
	},
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
	pub mode: AuthMode,
	/// Calling code prepended to numbers given without one, e.g. `"1"`.
	pub default_country_code: String,
	pub challenge_ttl: Duration,
}

impl Default for AuthConfig {
	fn default() -> Self {
		Self {
			mode: AuthMode::Qr,
			default_country_code: String::new(),
			challenge_ttl: DEFAULT_CHALLENGE_TTL,
		}
	}
}

/// What the supervisor should do with a QR event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QrAction {
	Present { challenge: Challenge, arm_expiry: bool },
	Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChallengePhase {
	Idle,
	QrShown,
	CodeRequested,
	CodeIssued,
	Stale,
}

/// Per-attempt challenge bookkeeping.
#[derive(Debug)]
pub struct AuthFlowController {
	config: AuthConfig,
	phase: ChallengePhase,
}

impl AuthFlowController {
	pub fn new(config: AuthConfig) -> Self {
		Self {
			config,
			phase: ChallengePhase::Idle,
		}
	}

	pub fn mode(&self) -> &AuthMode {
		&self.config.mode
	}

	pub fn challenge_ttl(&self) -> Duration {
		self.config.challenge_ttl
	}

	/// Forgets any challenge from a previous connection attempt.
	pub fn begin_attempt(&mut self) {
		self.phase = ChallengePhase::Idle;
	}

	/// Whether the current attempt's challenge has expired or failed.
	pub fn is_stale(&self) -> bool {
		self.phase == ChallengePhase::Stale
	}

	/// Handles a QR payload from the protocol client.
	///
	/// Only the first QR of an attempt arms the expiry timer; rotated payloads
	/// are re-presented under the same deadline.
	pub fn on_qr(&mut self, payload: String) -> QrAction {
		match (&self.config.mode, self.phase) {
			(AuthMode::Qr, ChallengePhase::Stale) => QrAction::Ignore,
			(AuthMode::Qr, phase) => {
				self.phase = ChallengePhase::QrShown;
				QrAction::Present {
					challenge: Challenge::Qr { payload },
					arm_expiry: phase == ChallengePhase::Idle,
				}
			}
			(AuthMode::PairingCode { .. }, _) => {
				debug!(target = "tether.auth", "qr payload ignored in pairing-code mode");
				QrAction::Ignore
			}
		}
	}

	/// Returns the normalized number to request a pairing code for.
	///
	/// Yields `Some` at most once per attempt, and only in pairing-code mode.
	pub fn pairing_request(&mut self) -> Result<Option<String>> {
		let AuthMode::PairingCode { phone_number } = &self.config.mode else {
			return Ok(None);
		};
		if self.phase != ChallengePhase::Idle {
			return Ok(None);
		}
		let number = normalize_phone_number(phone_number, &self.config.default_country_code)?;
		self.phase = ChallengePhase::CodeRequested;
		info!(target = "tether.auth", number = %mask(&number), "requesting pairing code");
		Ok(Some(number))
	}

	pub fn on_pairing_code(&mut self, code: String) -> Challenge {
		self.phase = ChallengePhase::CodeIssued;
		Challenge::PairingCode {
			code,
			expires_in_secs: self.config.challenge_ttl.as_secs(),
		}
	}

	pub fn on_pairing_failed(&mut self, message: impl Into<String>) -> ChallengeProblem {
		self.phase = ChallengePhase::Stale;
		ChallengeProblem::RequestFailed { message: message.into() }
	}

	/// Marks the current challenge stale. A fresh one needs a new attempt.
	pub fn on_expired(&mut self) -> ChallengeProblem {
		self.phase = ChallengePhase::Stale;
		ChallengeProblem::Expired
	}
}

/// Normalizes a phone number to bare international digits.
///
/// Non-digits are dropped. A leading `+` or `00` marks the number as already
/// international. A number that starts with the default country code and is
/// longer than a national number is kept as is. Anything else loses its
/// leading trunk zeros and gets the default country code prepended.
pub fn normalize_phone_number(raw: &str, default_country_code: &str) -> Result<String> {
	let raw = raw.trim();
	let mut digits: String = raw.chars().filter(char::is_ascii_digit).collect();
	let country_code: String = default_country_code.chars().filter(char::is_ascii_digit).collect();

	if raw.starts_with('+') {
		// already international
	} else if let Some(rest) = digits.strip_prefix("00") {
		digits = rest.to_string();
	} else if !country_code.is_empty() && digits.starts_with(&country_code) && digits.len() > NATIONAL_NUMBER_DIGITS {
		// already carries the default code
	} else {
		let national = digits.trim_start_matches('0');
		digits = format!("{country_code}{national}");
	}

	if !(MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits.len()) || digits.starts_with('0') {
		return Err(Error::Config(format!(
			"phone number '{raw}' does not normalize to a valid international number"
		)));
	}
	Ok(digits)
}

fn mask(number: &str) -> String {
	let hidden = number.len().saturating_sub(4);
	format!("{}{}", "*".repeat(hidden), &number[hidden..])
}
