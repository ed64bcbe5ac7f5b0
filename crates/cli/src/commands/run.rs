use std::sync::Arc;

use tether_protocol::{ConnectionPhase, ConnectionState};
use tether_runtime::backup::EmergencySnapshot;
use tether_runtime::relay::RelayClient;
use tether_runtime::supervisor::{self, Collaborators};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Settings;
use crate::daemon::{self, StopSignal};
use crate::error::{CliError, Result};
use crate::sinks::{PingDispatch, TerminalPresenter, install_panic_hook};
use crate::status;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitReason {
	Signal,
	Requested,
	Faulted,
}

/// `tether run`: supervises the session until a signal, `tether stop`, or a fault.
pub(super) async fn run(settings: Settings) -> Result<()> {
	let relay_url = settings
		.relay_url
		.clone()
		.ok_or_else(|| CliError::Config("no relay URL configured; pass --relay-url or set relayUrl".to_string()))?;
	info!(
		target = "tether",
		identity = %settings.identity,
		profile = %settings.profile,
		data_dir = %settings.data_dir.display(),
		"starting supervisor"
	);

	let store = Arc::new(settings.store());
	install_panic_hook(EmergencySnapshot::new(Arc::clone(&store), settings.identity.clone()));

	let collaborators = Collaborators::new(Arc::new(TerminalPresenter)).with_dispatch(Arc::new(PingDispatch));
	let client = Arc::new(RelayClient::new(relay_url));
	let socket = settings.control_socket();
	let mut config = settings.supervisor_config();
	config.reclaim_live_marker = !daemon::is_serving(&socket).await;
	let supervisor = supervisor::spawn(config, store, client, collaborators)?;

	let stop: StopSignal = Arc::default();
	let control = daemon::serve(&socket, supervisor.clone(), Arc::clone(&stop)).await?;
	let status_task = match settings.status_addr {
		Some(addr) => Some(status::serve(addr, supervisor.watch()).await?.1),
		None => None,
	};

	supervisor.start().await?;
	let reason = wait_for_exit(&stop, supervisor.watch()).await;
	info!(target = "tether", ?reason, "stopping supervisor");

	supervisor.shutdown().await?;
	drop(control);
	if let Some(task) = status_task {
		task.abort();
	}

	let state = supervisor.state();
	match reason {
		ExitReason::Faulted => Err(CliError::Faulted(fault_message(&state))),
		_ => Ok(()),
	}
}

async fn wait_for_exit(stop: &StopSignal, mut state: watch::Receiver<ConnectionState>) -> ExitReason {
	tokio::select! {
		_ = shutdown_signal() => ExitReason::Signal,
		_ = stop.notified() => ExitReason::Requested,
		result = state.wait_for(|s| s.phase == ConnectionPhase::Faulted) => match result {
			Ok(_) => ExitReason::Faulted,
			Err(_) => ExitReason::Requested,
		},
	}
}

fn fault_message(state: &ConnectionState) -> String {
	match &state.last_error {
		Some(error) => format!("gave up after {} attempts; last error ({}): {}", state.attempt_count, error.kind, error.message),
		None => format!("gave up after {} attempts", state.attempt_count),
	}
}

async fn shutdown_signal() {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{SignalKind, signal};
		match signal(SignalKind::terminate()) {
			Ok(mut terminate) => {
				tokio::select! {
					_ = tokio::signal::ctrl_c() => {}
					_ = terminate.recv() => {}
				}
			}
			Err(err) => {
				warn!(target = "tether", error = %err, "SIGTERM handler unavailable");
				let _ = tokio::signal::ctrl_c().await;
			}
		}
	}
	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
	}
}
