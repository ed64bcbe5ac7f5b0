//! Scripted protocol client for exercising the supervisor without a network.
//!
//! # Example
//!
//! ```ignore
//! let (client, script) = ScriptedClient::new();
//! script.push(ConnectOutcome::refuse(DisconnectReason::remote(515)));
//! script.push(ConnectOutcome::open());
//! let handle = supervisor::spawn(config, store, client, Collaborators::default())?;
//! handle.start().await?;
//! script.emit(SessionEvent::Closed(DisconnectReason::remote(401)));
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_protocol::{Credentials, DisconnectReason};
use tokio::sync::mpsc;

use crate::client::{ConnectOptions, ProtocolClient, Session, SessionEvent, SessionHandle};
use crate::error::{Error, Result};

const EVENT_CAPACITY: usize = 64;
pub const DEFAULT_PAIRING_CODE: &str = "TEST-CODE";

/// What the next `connect` call does.
#[derive(Debug, Clone)]
pub enum ConnectOutcome {
	/// Connect succeeds and the session immediately reports these events.
	Events(Vec<SessionEvent>),
	/// Connect fails with this reason.
	Fail(DisconnectReason),
}

impl ConnectOutcome {
	/// Handshake completes right away.
	pub fn open() -> Self {
		Self::Events(vec![SessionEvent::Open])
	}

	/// Transport is up but nothing happens until the script emits events.
	pub fn silent() -> Self {
		Self::Events(Vec::new())
	}

	pub fn refuse(reason: DisconnectReason) -> Self {
		Self::Fail(reason)
	}
}

#[derive(Default)]
struct ScriptState {
	outcomes: VecDeque<ConnectOutcome>,
	connect_delay: Duration,
	connects: Vec<Option<Credentials>>,
	sessions: Vec<Option<mpsc::Sender<SessionEvent>>>,
	sent: Vec<(String, String)>,
	pairing_requests: Vec<String>,
	pairing_response: Option<std::result::Result<String, String>>,
}

#[derive(Default)]
struct Shared {
	state: Mutex<ScriptState>,
	in_flight: AtomicUsize,
	max_in_flight: AtomicUsize,
	closed: AtomicUsize,
}

/// [`ProtocolClient`] driven by a [`ScriptController`].
///
/// With no queued outcome, `connect` behaves like [`ConnectOutcome::silent`].
pub struct ScriptedClient {
	shared: Arc<Shared>,
}

impl ScriptedClient {
	pub fn new() -> (Arc<Self>, ScriptController) {
		let shared = Arc::new(Shared::default());
		let client = Arc::new(Self {
			shared: Arc::clone(&shared),
		});
		(client, ScriptController { shared })
	}
}

struct InFlight<'a>(&'a Shared);

impl<'a> InFlight<'a> {
	fn enter(shared: &'a Shared) -> Self {
		let now = shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
		shared.max_in_flight.fetch_max(now, Ordering::SeqCst);
		Self(shared)
	}
}

impl Drop for InFlight<'_> {
	fn drop(&mut self) {
		self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
	}
}

#[async_trait]
impl ProtocolClient for ScriptedClient {
	async fn connect(&self, credentials: Option<Credentials>, _options: &ConnectOptions) -> Result<Session> {
		let _guard = InFlight::enter(&self.shared);
		let delay = {
			let mut state = self.shared.state.lock();
			state.connects.push(credentials);
			state.connect_delay
		};
		if !delay.is_zero() {
			tokio::time::sleep(delay).await;
		}

		let mut state = self.shared.state.lock();
		let outcome = state.outcomes.pop_front().unwrap_or_else(ConnectOutcome::silent);
		match outcome {
			ConnectOutcome::Fail(DisconnectReason::Transport { message }) => Err(Error::Transport(message)),
			ConnectOutcome::Fail(reason) => Err(Error::ProtocolRejection { reason }),
			ConnectOutcome::Events(events) => {
				let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
				for event in events {
					let _ = tx.try_send(event);
				}
				state.sessions.push(Some(tx));
				Ok(Session {
					handle: Arc::new(ScriptedSession {
						shared: Arc::clone(&self.shared),
						closed: AtomicBool::new(false),
					}),
					events: rx,
				})
			}
		}
	}
}

struct ScriptedSession {
	shared: Arc<Shared>,
	closed: AtomicBool,
}

#[async_trait]
impl SessionHandle for ScriptedSession {
	async fn send(&self, target: &str, content: &str) -> Result<()> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(Error::Transport("session closed".to_string()));
		}
		self.shared.state.lock().sent.push((target.to_string(), content.to_string()));
		Ok(())
	}

	async fn request_pairing_code(&self, number: &str) -> Result<String> {
		let mut state = self.shared.state.lock();
		state.pairing_requests.push(number.to_string());
		match state.pairing_response.clone() {
			Some(Ok(code)) => Ok(code),
			Some(Err(message)) => Err(Error::ProtocolRejection {
				reason: DisconnectReason::transport(message),
			}),
			None => Ok(DEFAULT_PAIRING_CODE.to_string()),
		}
	}

	async fn close(&self) -> Result<()> {
		if !self.closed.swap(true, Ordering::SeqCst) {
			self.shared.closed.fetch_add(1, Ordering::SeqCst);
		}
		Ok(())
	}
}

/// Drives a [`ScriptedClient`] and inspects what the supervisor did with it.
#[derive(Clone)]
pub struct ScriptController {
	shared: Arc<Shared>,
}

impl ScriptController {
	/// Queues the outcome of a future `connect` call.
	pub fn push(&self, outcome: ConnectOutcome) {
		self.shared.state.lock().outcomes.push_back(outcome);
	}

	/// Makes every `connect` take at least `delay` before resolving.
	pub fn set_connect_delay(&self, delay: Duration) {
		self.shared.state.lock().connect_delay = delay;
	}

	/// Answer for pairing-code requests; `Err` makes them fail.
	pub fn set_pairing_response(&self, response: std::result::Result<String, String>) {
		self.shared.state.lock().pairing_response = Some(response);
	}

	/// Delivers an event on the most recent session. Returns whether it was accepted.
	pub fn emit(&self, event: SessionEvent) -> bool {
		let state = self.shared.state.lock();
		match state.sessions.last() {
			Some(Some(tx)) => tx.try_send(event).is_ok(),
			_ => false,
		}
	}

	/// Ends the most recent session's event stream without a close event.
	pub fn end_stream(&self) {
		if let Some(tx) = self.shared.state.lock().sessions.last_mut() {
			tx.take();
		}
	}

	pub fn connect_count(&self) -> usize {
		self.shared.state.lock().connects.len()
	}

	/// Credentials passed to each `connect`, in call order.
	pub fn connect_credentials(&self) -> Vec<Option<Credentials>> {
		self.shared.state.lock().connects.clone()
	}

	/// Highest number of `connect` calls ever running at once.
	pub fn max_in_flight(&self) -> usize {
		self.shared.max_in_flight.load(Ordering::SeqCst)
	}

	pub fn closed_sessions(&self) -> usize {
		self.shared.closed.load(Ordering::SeqCst)
	}

	pub fn sent(&self) -> Vec<(String, String)> {
		self.shared.state.lock().sent.clone()
	}

	pub fn pairing_requests(&self) -> Vec<String> {
		self.shared.state.lock().pairing_requests.clone()
	}

	/// Polls until `connect` has been called `count` times.
	pub async fn wait_for_connects(&self, count: usize, timeout: Duration) -> bool {
		let deadline = tokio::time::Instant::now() + timeout;
		while tokio::time::Instant::now() < deadline {
			if self.connect_count() >= count {
				return true;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
		self.connect_count() >= count
	}
}
