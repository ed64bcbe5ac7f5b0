use std::time::Duration;

use tether_protocol::ConnectionState;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use super::{Command, Input};
use crate::error::{Error, Result};

/// Cloneable control surface of a running supervisor.
///
/// State is read through snapshots only; nothing here can mutate it directly.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
	tx: mpsc::Sender<Input>,
	state: watch::Receiver<ConnectionState>,
	changes: broadcast::Sender<ConnectionState>,
}

impl SupervisorHandle {
	pub(super) fn new(
		tx: mpsc::Sender<Input>,
		state: watch::Receiver<ConnectionState>,
		changes: broadcast::Sender<ConnectionState>,
	) -> Self {
		Self { tx, state, changes }
	}

	/// Begins the first connection cycle. Repeated calls are ignored.
	pub async fn start(&self) -> Result<()> {
		self.command(Command::Start).await
	}

	/// Wipes credentials and restarts the cycle from `Idle`.
	pub async fn trigger_reset(&self) -> Result<()> {
		self.command(Command::Reset).await
	}

	/// Stops the supervisor: cancels timers, snapshots and closes the session.
	///
	/// Resolves once the actor has finished. Stopping twice is not an error.
	pub async fn shutdown(&self) -> Result<()> {
		let (done, finished) = oneshot::channel();
		if self.tx.send(Input::Command(Command::Shutdown { done })).await.is_err() {
			return Ok(());
		}
		let _ = finished.await;
		self.tx.closed().await;
		Ok(())
	}

	/// Latest published state.
	pub fn state(&self) -> ConnectionState {
		self.state.borrow().clone()
	}

	/// Receiver that always holds the latest state.
	pub fn watch(&self) -> watch::Receiver<ConnectionState> {
		self.state.clone()
	}

	/// Stream of every published state, in transition order.
	pub fn state_changes(&self) -> broadcast::Receiver<ConnectionState> {
		self.changes.subscribe()
	}

	/// Waits until the published state satisfies `predicate`.
	pub async fn wait_for<F>(&self, timeout: Duration, mut predicate: F) -> Result<ConnectionState>
	where
		F: FnMut(&ConnectionState) -> bool,
	{
		let mut state = self.state.clone();
		match tokio::time::timeout(timeout, state.wait_for(|s| predicate(s))).await {
			Ok(Ok(snapshot)) => Ok(snapshot.clone()),
			Ok(Err(_)) => Err(Error::Shutdown),
			Err(_) => Err(Error::Transport(format!("state not reached within {timeout:?}"))),
		}
	}

	pub fn outbox(&self) -> Outbox {
		Outbox::new(self.tx.downgrade())
	}

	pub async fn send(&self, target: &str, content: &str) -> Result<()> {
		self.outbox().send(target, content).await
	}

	pub fn is_running(&self) -> bool {
		!self.tx.is_closed()
	}

	async fn command(&self, command: Command) -> Result<()> {
		self.tx.send(Input::Command(command)).await.map_err(|_| Error::Shutdown)
	}
}

/// Sends chat messages through whatever session is currently connected.
///
/// Holds no strong reference to the supervisor, so it never keeps a stopped
/// supervisor alive.
#[derive(Debug, Clone)]
pub struct Outbox {
	tx: mpsc::WeakSender<Input>,
}

impl Outbox {
	pub(super) fn new(tx: mpsc::WeakSender<Input>) -> Self {
		Self { tx }
	}

	/// Fails with [`Error::Transport`] when no session is connected.
	pub async fn send(&self, target: &str, content: &str) -> Result<()> {
		let tx = self.tx.upgrade().ok_or(Error::Shutdown)?;
		let (reply, response) = oneshot::channel();
		tx.send(Input::Command(Command::Send {
			target: target.to_string(),
			content: content.to_string(),
			reply,
		}))
		.await
		.map_err(|_| Error::Shutdown)?;
		drop(tx);
		response.await.map_err(|_| Error::Shutdown)?
	}
}
