//! Run marker and process liveness checks.
//!
//! The supervisor records its pid and phase in `run.json` next to the primary
//! credentials. A marker left in `connected` by a dead pid means the previous
//! run crashed; a marker owned by a live pid means another process is already
//! driving this identity.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tether_protocol::ConnectionPhase;
use tracing::warn;

use crate::error::{Error, Result};
use crate::now_ms;

pub const RUN_MARKER_FILE: &str = "run.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMarker {
	pub pid: u32,
	pub phase: ConnectionPhase,
	pub updated_at: u64,
}

/// What a leftover run marker says about the previous run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreviousRun {
	/// No marker, our own pid, or a clean exit.
	Clean,
	/// The previous process died while connected.
	Crashed(RunMarker),
	/// Another live process owns the identity.
	Running(RunMarker),
}

impl RunMarker {
	pub fn current(phase: ConnectionPhase) -> Self {
		Self {
			pid: std::process::id(),
			phase,
			updated_at: now_ms(),
		}
	}

	pub fn read(path: &Path) -> Result<Option<Self>> {
		let bytes = match fs::read(path) {
			Ok(bytes) => bytes,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(err) => return Err(Error::persistence(path, err)),
		};
		match serde_json::from_slice(&bytes) {
			Ok(marker) => Ok(Some(marker)),
			Err(err) => {
				warn!(target = "tether.supervisor", path = %path.display(), error = %err, "ignoring unreadable run marker");
				Ok(None)
			}
		}
	}

	pub fn write(&self, path: &Path) -> Result<()> {
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent).map_err(|err| Error::persistence(parent, err))?;
		}
		let tmp = path.with_extension("json.tmp");
		fs::write(&tmp, serde_json::to_vec_pretty(self)?).map_err(|err| Error::persistence(&tmp, err))?;
		fs::rename(&tmp, path).map_err(|err| Error::persistence(path, err))
	}
}

/// Inspects the run marker at `path`.
pub fn inspect_previous_run(path: &Path) -> Result<PreviousRun> {
	let Some(marker) = RunMarker::read(path)? else {
		return Ok(PreviousRun::Clean);
	};
	if marker.pid == std::process::id() {
		return Ok(PreviousRun::Clean);
	}
	if pid_is_alive(marker.pid) {
		return Ok(PreviousRun::Running(marker));
	}
	if marker.phase == ConnectionPhase::Connected {
		return Ok(PreviousRun::Crashed(marker));
	}
	Ok(PreviousRun::Clean)
}

/// Returns `true` when a process with `pid` appears alive on this platform.
pub fn pid_is_alive(pid: u32) -> bool {
	if pid == 0 {
		return false;
	}
	if pid == std::process::id() {
		return true;
	}

	#[cfg(unix)]
	{
		if PathBuf::from("/proc").join(pid.to_string()).exists() {
			return true;
		}
		std::process::Command::new("kill")
			.arg("-0")
			.arg(pid.to_string())
			.stderr(std::process::Stdio::null())
			.status()
			.map(|status| status.success())
			.unwrap_or(false)
	}

	#[cfg(windows)]
	{
		let filter = format!("PID eq {pid}");
		match std::process::Command::new("tasklist").args(["/FI", &filter, "/FO", "CSV", "/NH"]).output() {
			Ok(output) if output.status.success() => tasklist_has_pid(&String::from_utf8_lossy(&output.stdout), pid),
			_ => false,
		}
	}

	#[cfg(not(any(unix, windows)))]
	{
		false
	}
}

#[cfg(any(test, windows))]
fn tasklist_has_pid(output: &str, pid: u32) -> bool {
	let pid = pid.to_string();
	output.lines().filter_map(|line| line.trim().strip_prefix('"')).any(|line| {
		line.trim_end_matches('"')
			.split("\",\"")
			.nth(1)
			.is_some_and(|field| field.trim() == pid)
	})
}
