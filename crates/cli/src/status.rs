//! Read-only HTTP view of the connection state.

use std::net::SocketAddr;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tether_protocol::ConnectionState;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{CliError, Result};

/// Router serving `GET /status` from the supervisor's state channel.
pub fn router(state: watch::Receiver<ConnectionState>) -> Router {
	Router::new().route("/status", get(status)).with_state(state)
}

async fn status(State(state): State<watch::Receiver<ConnectionState>>) -> Json<ConnectionState> {
	Json(state.borrow().clone())
}

/// Binds `addr` and serves the status router in the background.
///
/// Returns the bound address (useful with port 0) and the server task.
pub async fn serve(addr: SocketAddr, state: watch::Receiver<ConnectionState>) -> Result<(SocketAddr, JoinHandle<()>)> {
	let listener = TcpListener::bind(addr)
		.await
		.map_err(|e| CliError::Config(format!("Failed to bind status endpoint to {addr}: {e}")))?;
	let local = listener.local_addr()?;
	info!(target = "tether", addr = %local, "status endpoint listening");

	let app = router(state);
	let task = tokio::spawn(async move {
		if let Err(err) = axum::serve(listener, app).await {
			warn!(target = "tether", error = %err, "status endpoint stopped");
		}
	});
	Ok((local, task))
}
