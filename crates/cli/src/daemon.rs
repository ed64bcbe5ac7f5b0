//! Control socket: line-delimited JSON between `tether` subcommands and a running supervisor.
//!
//! Each connection carries any number of [`ControlRequest`] lines and gets one
//! [`ControlResponse`] line back per request, in order.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tether_protocol::{ControlRequest, ControlResponse};
use tether_runtime::supervisor::SupervisorHandle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{CliError, Result};

/// Asks `tether run` to stop; notified when a `Shutdown` request arrives.
pub type StopSignal = Arc<Notify>;

/// Serves control requests until dropped.
pub struct ControlServer {
	path: PathBuf,
	task: JoinHandle<()>,
}

impl ControlServer {
	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl Drop for ControlServer {
	fn drop(&mut self) {
		self.task.abort();
		let _ = std::fs::remove_file(&self.path);
	}
}

/// Maps one request onto the supervisor.
pub async fn handle_request(request: ControlRequest, supervisor: &SupervisorHandle, stop: &StopSignal) -> ControlResponse {
	let result = match request {
		ControlRequest::Ping => return ControlResponse::Pong,
		ControlRequest::Status => {
			return ControlResponse::Status {
				state: supervisor.state(),
			};
		}
		ControlRequest::Reset => supervisor.trigger_reset().await,
		ControlRequest::Shutdown => {
			stop.notify_one();
			Ok(())
		}
	};
	match result {
		Ok(()) => ControlResponse::Ok,
		Err(err) => ControlResponse::Error {
			code: err.kind().as_str().to_string(),
			message: err.to_string(),
		},
	}
}

#[cfg(unix)]
mod unix {
	use anyhow::Context;
	use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
	use tokio::net::{UnixListener, UnixStream};
	use tracing::{info, warn};

	use super::*;

	pub async fn serve(path: &Path, supervisor: SupervisorHandle, stop: StopSignal) -> Result<ControlServer> {
		if path.exists() {
			if UnixStream::connect(path).await.is_ok() {
				return Err(CliError::Config(format!(
					"another tether instance is serving {}",
					path.display()
				)));
			}
			debug!(target = "tether.daemon", path = %path.display(), "removing stale control socket");
			std::fs::remove_file(path).with_context(|| format!("removing stale control socket {}", path.display()))?;
		}
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
		}

		let listener = UnixListener::bind(path).with_context(|| format!("binding control socket {}", path.display()))?;
		info!(target = "tether.daemon", path = %path.display(), "control socket listening");

		let task = tokio::spawn(async move {
			loop {
				match listener.accept().await {
					Ok((stream, _)) => {
						let supervisor = supervisor.clone();
						let stop = Arc::clone(&stop);
						tokio::spawn(async move {
							if let Err(err) = handle_connection(stream, supervisor, stop).await {
								debug!(target = "tether.daemon", error = %err, "control connection ended with error");
							}
						});
					}
					Err(err) => {
						warn!(target = "tether.daemon", error = %err, "control socket accept failed");
						return;
					}
				}
			}
		});

		Ok(ControlServer {
			path: path.to_path_buf(),
			task,
		})
	}

	async fn handle_connection(stream: UnixStream, supervisor: SupervisorHandle, stop: StopSignal) -> Result<()> {
		let (reader, mut writer) = stream.into_split();
		let mut lines = BufReader::new(reader).lines();
		while let Some(line) = lines.next_line().await? {
			if line.trim().is_empty() {
				continue;
			}
			let response = match serde_json::from_str::<ControlRequest>(&line) {
				Ok(request) => {
					debug!(target = "tether.daemon", ?request, "control request");
					handle_request(request, &supervisor, &stop).await
				}
				Err(err) => ControlResponse::Error {
					code: "bad_request".to_string(),
					message: err.to_string(),
				},
			};
			let mut bytes = serde_json::to_vec(&response)?;
			bytes.push(b'\n');
			writer.write_all(&bytes).await?;
		}
		Ok(())
	}

	pub async fn request(path: &Path, request: &ControlRequest) -> Result<ControlResponse> {
		let stream = match UnixStream::connect(path).await {
			Ok(stream) => stream,
			Err(err) if matches!(err.kind(), std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused) => {
				return Err(CliError::NotRunning { path: path.to_path_buf() });
			}
			Err(err) => return Err(err.into()),
		};
		let (reader, mut writer) = stream.into_split();

		let mut bytes = serde_json::to_vec(request)?;
		bytes.push(b'\n');
		writer.write_all(&bytes).await?;

		let mut line = String::new();
		BufReader::new(reader).read_line(&mut line).await?;
		if line.trim().is_empty() {
			return Err(CliError::Config("supervisor closed the control connection".to_string()));
		}
		Ok(serde_json::from_str(&line)?)
	}
}

#[cfg(unix)]
pub use unix::{request, serve};

#[cfg(not(unix))]
pub async fn serve(path: &Path, _supervisor: SupervisorHandle, _stop: StopSignal) -> Result<ControlServer> {
	Err(CliError::Config(format!(
		"control socket {} needs Unix domain sockets",
		path.display()
	)))
}

#[cfg(not(unix))]
pub async fn request(path: &Path, _request: &ControlRequest) -> Result<ControlResponse> {
	Err(CliError::NotRunning { path: path.to_path_buf() })
}

/// Whether a supervisor answers on `path`.
///
/// Only a missing or refused socket counts as "nobody"; any other failure is
/// treated as a live but unhealthy server.
pub async fn is_serving(path: &Path) -> bool {
	match self::request(path, &ControlRequest::Ping).await {
		Ok(_) => true,
		Err(CliError::NotRunning { .. }) => false,
		Err(err) => {
			debug!(target = "tether.daemon", path = %path.display(), error = %err, "control socket ping failed");
			true
		}
	}
}

/// Sends `request` and turns an error response into [`CliError::Control`].
pub async fn expect_ok(path: &Path, request: &ControlRequest) -> Result<ControlResponse> {
	match self::request(path, request).await? {
		ControlResponse::Error { code, message } => Err(CliError::Control { code, message }),
		response => Ok(response),
	}
}
