//! Control-socket messages between `tether` subcommands and a running supervisor.

use serde::{Deserialize, Serialize};

use crate::ConnectionState;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
	Ping,
	Status,
	Reset,
	Shutdown,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
	Pong,
	Status { state: ConnectionState },
	Ok,
	Error { code: String, message: String },
}
