use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
	#[error(transparent)]
	Runtime(#[from] tether_runtime::Error),

	#[error("configuration error: {0}")]
	Config(String),

	#[error("no tether supervisor is listening on {}", path.display())]
	NotRunning { path: PathBuf },

	/// The supervisor gave up reconnecting.
	#[error("supervisor faulted: {0}")]
	Faulted(String),

	#[error("supervisor refused request ({code}): {message}")]
	Control { code: String, message: String },

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Json(#[from] serde_json::Error),

	#[error("{0:#}")]
	Anyhow(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CliError>;
