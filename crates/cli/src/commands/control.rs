use std::fmt::Write;

use tether_protocol::{ConnectionState, ControlRequest, ControlResponse, SessionIdentity};
use tether_runtime::now_ms;

use crate::config::Settings;
use crate::daemon;
use crate::error::{CliError, Result};

pub(super) async fn status(settings: &Settings, json: bool) -> Result<()> {
	let state = match daemon::expect_ok(&settings.control_socket(), &ControlRequest::Status).await? {
		ControlResponse::Status { state } => state,
		other => return Err(unexpected(other)),
	};
	if json {
		println!("{}", serde_json::to_string_pretty(&state)?);
	} else {
		print!("{}", render_status(&settings.identity, &state, now_ms()));
	}
	Ok(())
}

pub(super) async fn reset(settings: &Settings) -> Result<()> {
	daemon::expect_ok(&settings.control_socket(), &ControlRequest::Reset).await?;
	println!("Credentials wiped; a new linking challenge will follow.");
	Ok(())
}

pub(super) async fn stop(settings: &Settings) -> Result<()> {
	daemon::expect_ok(&settings.control_socket(), &ControlRequest::Shutdown).await?;
	println!("Stop requested.");
	Ok(())
}

fn unexpected(response: ControlResponse) -> CliError {
	CliError::Control {
		code: "unexpected_response".to_string(),
		message: format!("{response:?}"),
	}
}

/// Human-readable status block, one field per line.
pub fn render_status(identity: &SessionIdentity, state: &ConnectionState, now: u64) -> String {
	let mut out = String::new();
	let _ = writeln!(out, "identity:    {identity}");
	let _ = writeln!(out, "phase:       {}", state.phase);
	if let Some(since) = state.connected_at.filter(|_| state.is_connected()) {
		let _ = writeln!(out, "connected:   {} ago", ago(now, since));
	}
	let _ = writeln!(out, "reconnects:  {}", state.reconnect_count);
	if state.attempt_count > 0 {
		let _ = writeln!(out, "attempt:     {}", state.attempt_count);
	}
	if let Some(at) = state.retry_at {
		let _ = writeln!(out, "next retry:  in {}", ago(at, now));
	}
	if let Some(error) = &state.last_error {
		let _ = writeln!(out, "last error:  {} ({}, {} ago)", error.message, error.kind, ago(now, error.at));
	}
	if let Some(error) = &state.persistence_error {
		let _ = writeln!(out, "storage:     {} ({} ago)", error.message, ago(now, error.at));
	}
	out
}

fn ago(later: u64, earlier: u64) -> String {
	let secs = later.saturating_sub(earlier) / 1000;
	match secs {
		s if s < 60 => format!("{s}s"),
		s if s < 3600 => format!("{}m{}s", s / 60, s % 60),
		s => format!("{}h{}m", s / 3600, (s % 3600) / 60),
	}
}
