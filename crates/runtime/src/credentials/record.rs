//! Snapshot records, marker files, and the retention rule.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tether_protocol::SessionIdentity;

/// One durable, timestamped copy of a credential blob. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
	pub identity: SessionIdentity,
	pub taken_at: u64,
	pub blob_ref: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct KnownGoodMarker {
	/// Snapshot taken right after a successful connect.
	pub(super) taken_at: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct WipeMarker {
	pub(super) wiped_at: u64,
}

pub(super) fn file_name(taken_at: u64) -> String {
	format!("{taken_at}.json")
}

pub(super) fn parse_file_name(name: &str) -> Option<u64> {
	let stem = name.strip_suffix(".json")?;
	if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
		return None;
	}
	stem.parse().ok()
}

/// Returns the `taken_at` keys that survive pruning.
///
/// `records` must be sorted newest first. Keeps the `keep` newest records plus
/// the known-good snapshot, however old it is.
pub(super) fn retained_records(records: &[BackupRecord], keep: usize, known_good: Option<u64>) -> HashSet<u64> {
	let mut retained: HashSet<u64> = records.iter().take(keep).map(|r| r.taken_at).collect();
	if let Some(known_good) = known_good.filter(|k| records.iter().any(|r| r.taken_at == *k)) {
		retained.insert(known_good);
	}
	retained
}
