//! Connection options passed through to the protocol client.

use serde::{Deserialize, Serialize};

/// Client/browser fingerprint announced to the remote service.
///
/// Selected once from configuration; the connection logic never branches on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFingerprint {
	pub platform: String,
	pub browser: String,
	pub version: String,
}

impl ClientFingerprint {
	pub fn new(platform: impl Into<String>, browser: impl Into<String>, version: impl Into<String>) -> Self {
		Self {
			platform: platform.into(),
			browser: browser.into(),
			version: version.into(),
		}
	}

	/// Label stored as the credential device label.
	pub fn label(&self) -> String {
		format!("{} {}", self.platform, self.browser)
	}
}

impl Default for ClientFingerprint {
	fn default() -> Self {
		Self::new("Ubuntu", "Chrome", "22.04.4")
	}
}
