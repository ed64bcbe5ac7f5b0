//! Session identity key.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque key naming one logical bot session.
///
/// Immutable for the lifetime of a process; every credential blob and backup
/// record belongs to exactly one identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionIdentity(String);

impl SessionIdentity {
	/// Wraps a raw identity string.
	pub fn new(value: impl Into<String>) -> Self {
		Self(value.into())
	}

	/// Returns the identity as a string slice.
	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Returns `true` when the identity can be used as a single path component.
	pub fn is_path_safe(&self) -> bool {
		let value = self.0.as_str();
		!value.is_empty()
			&& value != "."
			&& value != ".."
			&& value.len() <= 128
			&& value.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
	}
}

impl fmt::Display for SessionIdentity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for SessionIdentity {
	fn from(value: &str) -> Self {
		Self::new(value)
	}
}

impl From<String> for SessionIdentity {
	fn from(value: String) -> Self {
		Self(value)
	}
}
