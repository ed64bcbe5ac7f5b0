//! Credential envelope: opaque session material plus a small metadata header.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Metadata header readable by components other than the credential store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialMeta {
	/// Whether the remote service has completed device registration.
	pub registered: bool,
	/// Human-readable label of the linked device.
	#[serde(default)]
	pub device_label: String,
	/// Milliseconds since the Unix epoch when these credentials were produced.
	pub saved_at: u64,
}

/// Opaque authentication and session-resumption material.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
	pub meta: CredentialMeta,
	#[serde(with = "base64_bytes")]
	pub blob: Vec<u8>,
}

impl Credentials {
	pub fn new(meta: CredentialMeta, blob: impl Into<Vec<u8>>) -> Self {
		Self { meta, blob: blob.into() }
	}

	pub fn is_registered(&self) -> bool {
		self.meta.registered
	}

	/// Minimal structural check used when choosing a restore candidate.
	pub fn is_structurally_valid(&self) -> bool {
		!self.blob.is_empty()
	}
}

// The blob is secret material; never print it.
impl fmt::Debug for Credentials {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Credentials")
			.field("meta", &self.meta)
			.field("blob_len", &self.blob.len())
			.finish()
	}
}

mod base64_bytes {
	use base64::Engine;
	use base64::engine::general_purpose::STANDARD;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&STANDARD.encode(bytes))
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
	where
		D: Deserializer<'de>,
	{
		let encoded = String::deserialize(deserializer)?;
		STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
	}
}
