use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tether_protocol::{
	ChallengeProblem, ConnectionPhase, ConnectionState, Credentials, DisconnectReason, ErrorKind, InboundMessage, LastError,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::{CLOSE_TIMEOUT, Collaborators, Command, Input, Outbox, SupervisorConfig};
use crate::auth::{AuthFlowController, QrAction};
use crate::backoff::RetryDecision;
use crate::backup::{BackupScheduler, blocking};
use crate::classify::{Disposition, classify};
use crate::client::{ConnectOptions, ProtocolClient, SessionEvent, SessionHandle};
use crate::credentials::{BackupRecord, CredentialStore};
use crate::error::{Error, Result};
use crate::now_ms;
use crate::process::RunMarker;
use crate::sinks::{CommandDispatch, NotificationSink, PresentationSink};

pub(super) struct Channels {
	pub(super) inbox: mpsc::Receiver<Input>,
	pub(super) tx: mpsc::WeakSender<Input>,
	pub(super) state_tx: watch::Sender<ConnectionState>,
	pub(super) changes: broadcast::Sender<ConnectionState>,
	pub(super) marker_path: PathBuf,
}

pub(super) struct Actor {
	config: SupervisorConfig,
	store: Arc<CredentialStore>,
	client: Arc<dyn ProtocolClient>,
	presentation: Arc<dyn PresentationSink>,
	notifications: Arc<dyn NotificationSink>,
	channels: Channels,
	state: ConnectionState,
	auth: AuthFlowController,
	backups: BackupScheduler,
	rng: StdRng,
	/// Bumped whenever an attempt is torn down; tags every spawned task.
	epoch: u64,
	started: bool,
	ever_connected: bool,
	fast_streak: u32,
	session: Option<Arc<dyn SessionHandle>>,
	connect_task: Option<JoinHandle<()>>,
	pump_task: Option<JoinHandle<()>>,
	pairing_task: Option<JoinHandle<()>>,
	retry_timer: Option<JoinHandle<()>>,
	challenge_timer: Option<JoinHandle<()>>,
	dispatch: Option<mpsc::UnboundedSender<InboundMessage>>,
}

impl Actor {
	pub(super) fn new(
		config: SupervisorConfig,
		store: Arc<CredentialStore>,
		client: Arc<dyn ProtocolClient>,
		collaborators: Collaborators,
		channels: Channels,
		initial: ConnectionState,
		outbox: Outbox,
	) -> Self {
		let notifications = collaborators
			.notifications
			.unwrap_or_else(|| Arc::new(outbox.clone()) as Arc<dyn NotificationSink>);
		let dispatch = collaborators.dispatch.map(|dispatch| spawn_dispatch(dispatch, outbox));
		let backups = BackupScheduler::new(Arc::clone(&store), config.identity.clone(), config.backup_interval);
		let auth = AuthFlowController::new(config.auth.clone());

		Self {
			config,
			store,
			client,
			presentation: collaborators.presentation,
			notifications,
			channels,
			state: initial,
			auth,
			backups,
			rng: StdRng::from_entropy(),
			epoch: 0,
			started: false,
			ever_connected: false,
			fast_streak: 0,
			session: None,
			connect_task: None,
			pump_task: None,
			pairing_task: None,
			retry_timer: None,
			challenge_timer: None,
			dispatch,
		}
	}

	pub(super) async fn run(mut self) {
		while let Some(input) = self.channels.inbox.recv().await {
			if self.handle(input).await.is_break() {
				return;
			}
		}
		debug!(target = "tether.supervisor", "all handles dropped");
		self.stop().await;
	}

	async fn handle(&mut self, input: Input) -> ControlFlow<()> {
		match input {
			Input::Command(Command::Start) => self.start().await,
			Input::Command(Command::Reset) => self.reset().await,
			Input::Command(Command::Shutdown { done }) => {
				self.stop().await;
				let _ = done.send(());
				return ControlFlow::Break(());
			}
			Input::Command(Command::Send { target, content, reply }) => self.send(target, content, reply),
			Input::Connected { epoch, result } if epoch == self.epoch => self.on_connect_result(result).await,
			Input::Connected { result: Ok(session), .. } => {
				trace!(target = "tether.supervisor", "closing session from a superseded attempt");
				tokio::spawn(async move {
					let _ = tokio::time::timeout(CLOSE_TIMEOUT, session.handle.close()).await;
				});
			}
			Input::Session { epoch, event } if epoch == self.epoch => self.on_session_event(event).await,
			Input::SessionEnded { epoch } if epoch == self.epoch => self.on_session_ended().await,
			Input::RetryDue { epoch } if epoch == self.epoch => self.on_retry_due().await,
			Input::ChallengeExpired { epoch } if epoch == self.epoch => self.on_challenge_expired().await,
			Input::PairingCode { epoch, result } if epoch == self.epoch => self.on_pairing_code(result).await,
			Input::Backup { epoch, result } if epoch == self.epoch => self.on_periodic_backup(result),
			_ => trace!(target = "tether.supervisor", "dropping stale event"),
		}
		ControlFlow::Continue(())
	}

	async fn start(&mut self) {
		if self.started {
			debug!(target = "tether.supervisor", "start ignored; already started");
			return;
		}
		self.started = true;
		info!(
			target = "tether.supervisor",
			identity = %self.config.identity,
			fingerprint = %self.config.fingerprint.label(),
			"supervisor starting"
		);
		self.begin_cycle().await;
	}

	/// `Idle -> Connecting | AwaitingChallenge`: loads credentials and launches one attempt.
	async fn begin_cycle(&mut self) {
		self.teardown_attempt().await;
		self.auth.begin_attempt();
		self.state.retry_at = None;

		let credentials = self.load_credentials().await;
		let Some(tx) = self.channels.tx.upgrade() else {
			return;
		};

		match &credentials {
			Some(_) => self.set_phase(ConnectionPhase::Connecting),
			None => {
				if self.state.last_error.is_none() {
					self.record_error(ErrorKind::CredentialsMissing, "no stored credentials; device linking required");
				}
				self.set_phase(ConnectionPhase::AwaitingChallenge);
			}
		}

		let epoch = self.epoch;
		let client = Arc::clone(&self.client);
		let options = ConnectOptions {
			identity: self.config.identity.clone(),
			fingerprint: self.config.fingerprint.clone(),
		};
		debug!(target = "tether.supervisor", epoch, with_credentials = credentials.is_some(), "connecting");
		self.connect_task = Some(tokio::spawn(async move {
			let result = client.connect(credentials, &options).await;
			let _ = tx.send(Input::Connected { epoch, result }).await;
		}));
	}

	/// Primary blob first, then the newest valid snapshot. Read failures count as missing.
	async fn load_credentials(&mut self) -> Option<Credentials> {
		let store = Arc::clone(&self.store);
		let identity = self.config.identity.clone();
		match blocking(move || store.load(&identity)).await {
			Ok(Some(credentials)) => return Some(credentials),
			Ok(None) => {}
			Err(err) => warn!(target = "tether.supervisor", error = %err, "credential read failed; treating as missing"),
		}

		let store = Arc::clone(&self.store);
		let identity = self.config.identity.clone();
		match blocking(move || store.restore_latest(&identity)).await {
			Ok(Some(credentials)) => {
				info!(target = "tether.supervisor", identity = %self.config.identity, "session restored from snapshot");
				Some(credentials)
			}
			Ok(None) => None,
			Err(err) => {
				warn!(target = "tether.supervisor", error = %err, "snapshot restore failed");
				None
			}
		}
	}

	async fn on_connect_result(&mut self, result: Result<crate::client::Session>) {
		self.connect_task = None;
		match result {
			Ok(session) => {
				let Some(tx) = self.channels.tx.upgrade() else {
					return;
				};
				self.session = Some(Arc::clone(&session.handle));
				self.pump_task = Some(spawn_pump(self.epoch, session.events, tx));
				if self.state.phase == ConnectionPhase::AwaitingChallenge {
					self.maybe_request_pairing_code().await;
				}
			}
			Err(err) => {
				let kind = err.kind();
				self.handle_failure(err.disconnect_reason(), kind, err.to_string()).await;
			}
		}
	}

	async fn on_session_event(&mut self, event: SessionEvent) {
		match event {
			SessionEvent::Qr(payload) => self.on_qr(payload).await,
			SessionEvent::CredentialsUpdated(credentials) => {
				let registered = credentials.is_registered();
				self.persist(credentials).await;
				if registered && self.state.phase == ConnectionPhase::AwaitingChallenge {
					debug!(target = "tether.supervisor", "device linked; completing handshake");
					abort(&mut self.challenge_timer);
					abort(&mut self.pairing_task);
					self.set_phase(ConnectionPhase::Connecting);
				}
			}
			SessionEvent::Open => self.on_open().await,
			SessionEvent::Closed(reason) => {
				let kind = match reason {
					DisconnectReason::Remote { .. } => ErrorKind::ProtocolRejection,
					_ => ErrorKind::Transport,
				};
				let message = reason.to_string();
				self.handle_failure(reason, kind, message).await;
			}
			SessionEvent::Message(message) => match &self.dispatch {
				Some(tx) => {
					let _ = tx.send(message);
				}
				None => trace!(target = "tether.supervisor", id = %message.id, "no dispatcher; message dropped"),
			},
		}
	}

	async fn on_qr(&mut self, payload: String) {
		match self.state.phase {
			ConnectionPhase::AwaitingChallenge => {}
			ConnectionPhase::Connecting => {
				info!(target = "tether.supervisor", "remote requested device linking");
				self.set_phase(ConnectionPhase::AwaitingChallenge);
			}
			phase => {
				debug!(target = "tether.supervisor", %phase, "qr ignored");
				return;
			}
		}

		if let QrAction::Present { challenge, arm_expiry } = self.auth.on_qr(payload) {
			self.presentation.show_challenge(&challenge);
			if arm_expiry {
				self.arm_challenge_timer();
			}
		}
		self.maybe_request_pairing_code().await;
	}

	async fn maybe_request_pairing_code(&mut self) {
		let Some(session) = self.session.clone() else {
			return;
		};
		match self.auth.pairing_request() {
			Ok(None) => {}
			Ok(Some(number)) => {
				let Some(tx) = self.channels.tx.upgrade() else {
					return;
				};
				let epoch = self.epoch;
				self.pairing_task = Some(tokio::spawn(async move {
					let result = session.request_pairing_code(&number).await;
					let _ = tx.send(Input::PairingCode { epoch, result }).await;
				}));
			}
			Err(err) => self.park_misconfigured(err).await,
		}
	}

	async fn on_pairing_code(&mut self, result: Result<String>) {
		self.pairing_task = None;
		if self.state.phase != ConnectionPhase::AwaitingChallenge {
			return;
		}
		match result {
			Ok(code) => {
				let challenge = self.auth.on_pairing_code(code);
				self.presentation.show_challenge(&challenge);
				self.arm_challenge_timer();
			}
			Err(err) => {
				let problem = self.auth.on_pairing_failed(err.to_string());
				self.presentation.challenge_unavailable(&problem);
				let kind = err.kind();
				self.handle_failure(err.disconnect_reason(), kind, err.to_string()).await;
			}
		}
	}

	async fn on_challenge_expired(&mut self) {
		self.challenge_timer = None;
		if self.state.phase != ConnectionPhase::AwaitingChallenge {
			return;
		}
		let problem = self.auth.on_expired();
		warn!(target = "tether.auth", "challenge expired before the device was linked");
		self.presentation.challenge_unavailable(&problem);
		self.record_error(Error::AuthExpired.kind(), problem.to_string());
		self.teardown_attempt().await;
		self.backoff_or_fault();
	}

	/// Pairing configuration is unusable: report it and wait for an operator.
	async fn park_misconfigured(&mut self, err: Error) {
		error!(target = "tether.auth", error = %err, "pairing-code mode misconfigured");
		self.presentation.challenge_unavailable(&ChallengeProblem::Misconfigured { message: err.to_string() });
		self.record_error(err.kind(), err.to_string());
		self.teardown_attempt().await;
		self.state.retry_at = None;
		self.set_phase(ConnectionPhase::Idle);
	}

	/// `Connecting -> Connected`.
	async fn on_open(&mut self) {
		if self.state.phase == ConnectionPhase::Connected {
			return;
		}
		abort(&mut self.challenge_timer);
		abort(&mut self.pairing_task);

		self.state.attempt_count = 0;
		self.fast_streak = 0;
		self.state.connected_at = Some(now_ms());
		self.state.retry_at = None;
		if self.ever_connected {
			self.state.reconnect_count += 1;
		}
		self.ever_connected = true;

		match self.backups.on_connected().await {
			Ok(Some(record)) => {
				debug!(target = "tether.backup", taken_at = record.taken_at, "on-connect snapshot pinned");
				self.state.persistence_error = None;
			}
			Ok(None) => warn!(target = "tether.backup", "connected without stored credentials; nothing to snapshot"),
			Err(err) => self.record_persistence_error(&err),
		}
		self.arm_periodic_backups();
		self.set_phase(ConnectionPhase::Connected);
		info!(
			target = "tether.supervisor",
			identity = %self.config.identity,
			reconnects = self.state.reconnect_count,
			"session connected"
		);

		let status = if self.state.reconnect_count == 0 {
			format!("{} is online", self.config.identity)
		} else {
			format!("{} reconnected ({} reconnects)", self.config.identity, self.state.reconnect_count)
		};
		self.notify_owner(status);
		self.write_run_marker(ConnectionPhase::Connected).await;
	}

	async fn on_session_ended(&mut self) {
		if matches!(
			self.state.phase,
			ConnectionPhase::Connecting | ConnectionPhase::AwaitingChallenge | ConnectionPhase::Connected
		) {
			let reason = DisconnectReason::StreamEnded;
			let message = reason.to_string();
			self.handle_failure(reason, ErrorKind::Transport, message).await;
		}
	}

	/// `-> Closing -> {Connecting, AwaitingChallenge, Idle (retry pending), Faulted}`.
	async fn handle_failure(&mut self, reason: DisconnectReason, kind: ErrorKind, message: String) {
		let disposition = classify(&reason);
		let was_linking = self.state.phase == ConnectionPhase::AwaitingChallenge;
		let was_connected = self.state.phase == ConnectionPhase::Connected;
		info!(
			target = "tether.supervisor",
			%reason,
			disposition = disposition.as_str(),
			attempt = self.state.attempt_count,
			"session closed"
		);

		self.record_error(kind, message);
		self.set_phase(ConnectionPhase::Closing);
		self.teardown_attempt().await;
		if was_connected {
			self.write_run_marker(ConnectionPhase::Closing).await;
		}

		match disposition {
			Disposition::Fatal => {
				warn!(target = "tether.supervisor", identity = %self.config.identity, "session invalidated by remote; wiping credentials");
				self.wipe_credentials().await;
				self.fast_streak = 0;
				self.state.attempt_count = 0;
				if was_linking {
					// Rejected while linking: nothing left to wipe, so back off.
					self.backoff_or_fault();
				} else {
					self.begin_cycle().await;
				}
			}
			Disposition::RecoverableFast if self.fast_streak < self.config.retry.fast_retry_limit => {
				self.fast_streak += 1;
				let delay = self.config.retry.fast_delay(&mut self.rng);
				debug!(target = "tether.supervisor", streak = self.fast_streak, delay_ms = delay.as_millis() as u64, "fast retry");
				self.schedule_retry(delay);
			}
			Disposition::RecoverableFast => {
				warn!(target = "tether.supervisor", streak = self.fast_streak, "fast retries exhausted; backing off");
				self.backoff_or_fault();
			}
			Disposition::RecoverableBackoff => self.backoff_or_fault(),
		}
	}

	fn backoff_or_fault(&mut self) {
		match self.config.retry.schedule(self.state.attempt_count, &mut self.rng) {
			RetryDecision::Wait { attempt, delay } => {
				self.state.attempt_count = attempt;
				debug!(target = "tether.supervisor", attempt, delay_ms = delay.as_millis() as u64, "backoff retry");
				self.schedule_retry(delay);
			}
			RetryDecision::GiveUp { attempts } => {
				error!(target = "tether.supervisor", attempts, "retry ceiling reached; supervisor faulted");
				self.state.retry_at = None;
				self.set_phase(ConnectionPhase::Faulted);
			}
		}
	}

	/// Enters `Idle` with a single pending retry timer.
	fn schedule_retry(&mut self, delay: Duration) {
		abort(&mut self.retry_timer);
		let Some(tx) = self.channels.tx.upgrade() else {
			return;
		};
		let epoch = self.epoch;
		self.state.retry_at = Some(now_ms().saturating_add(delay.as_millis() as u64));
		self.set_phase(ConnectionPhase::Idle);
		self.retry_timer = Some(tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			let _ = tx.send(Input::RetryDue { epoch }).await;
		}));
	}

	async fn on_retry_due(&mut self) {
		self.retry_timer = None;
		if self.state.phase == ConnectionPhase::Idle {
			self.begin_cycle().await;
		}
	}

	async fn reset(&mut self) {
		info!(target = "tether.supervisor", identity = %self.config.identity, "connection reset requested");
		if self.state.phase == ConnectionPhase::Faulted {
			self.wipe_credentials().await;
			warn!(target = "tether.supervisor", "supervisor is faulted; credentials wiped, restart the process to reconnect");
			return;
		}

		let was_connected = self.state.phase == ConnectionPhase::Connected;
		if was_connected {
			self.set_phase(ConnectionPhase::Closing);
		}
		self.teardown_attempt().await;
		if was_connected {
			self.write_run_marker(ConnectionPhase::Closing).await;
		}
		self.wipe_credentials().await;

		self.state.attempt_count = 0;
		self.state.last_error = None;
		self.state.retry_at = None;
		self.fast_streak = 0;
		self.set_phase(ConnectionPhase::Idle);
		if self.started {
			self.begin_cycle().await;
		}
	}

	/// Local shutdown: no reconnect is scheduled afterwards.
	async fn stop(&mut self) {
		info!(target = "tether.supervisor", identity = %self.config.identity, "supervisor shutting down");
		abort(&mut self.retry_timer);
		abort(&mut self.challenge_timer);
		self.backups.cancel();

		let was_connected = self.state.phase == ConnectionPhase::Connected;
		if was_connected {
			match self.backups.snapshot_now().await {
				Ok(record) => debug!(target = "tether.backup", taken = record.is_some(), "final snapshot"),
				Err(err) => warn!(target = "tether.backup", error = %err, "final snapshot failed"),
			}
			self.set_phase(ConnectionPhase::Closing);
		}
		self.teardown_attempt().await;
		self.state.retry_at = None;
		if self.state.phase != ConnectionPhase::Faulted {
			self.set_phase(ConnectionPhase::Idle);
		}
		if self.started {
			self.write_run_marker(self.state.phase).await;
		}

		// The dispatch task drains what it already holds; its sends fail once the inbox is gone.
		self.dispatch = None;
	}

	/// Cancels everything tied to the current attempt and closes its session.
	async fn teardown_attempt(&mut self) {
		self.epoch += 1;
		abort(&mut self.retry_timer);
		abort(&mut self.challenge_timer);
		abort(&mut self.pairing_task);
		abort(&mut self.pump_task);
		self.backups.cancel();

		if let Some(task) = self.connect_task.take() {
			task.abort();
			let _ = task.await;
		}
		if let Some(session) = self.session.take() {
			match tokio::time::timeout(CLOSE_TIMEOUT, session.close()).await {
				Ok(Ok(())) => {}
				Ok(Err(err)) => debug!(target = "tether.supervisor", error = %err, "session close failed"),
				Err(_) => warn!(target = "tether.supervisor", "session close timed out"),
			}
		}
	}

	fn send(&mut self, target: String, content: String, reply: oneshot::Sender<Result<()>>) {
		let session = self.session.clone().filter(|_| self.state.is_connected());
		let Some(session) = session else {
			let _ = reply.send(Err(Error::Transport("no connected session".to_string())));
			return;
		};
		tokio::spawn(async move {
			let _ = reply.send(session.send(&target, &content).await);
		});
	}

	fn arm_challenge_timer(&mut self) {
		abort(&mut self.challenge_timer);
		let Some(tx) = self.channels.tx.upgrade() else {
			return;
		};
		let epoch = self.epoch;
		let ttl = self.auth.challenge_ttl();
		self.challenge_timer = Some(tokio::spawn(async move {
			tokio::time::sleep(ttl).await;
			let _ = tx.send(Input::ChallengeExpired { epoch }).await;
		}));
	}

	fn arm_periodic_backups(&mut self) {
		let tx = self.channels.tx.clone();
		let epoch = self.epoch;
		self.backups.arm(move |result| {
			if let Some(tx) = tx.upgrade() {
				if tx.try_send(Input::Backup { epoch, result }).is_err() {
					warn!(target = "tether.backup", "supervisor busy; snapshot result dropped");
				}
			}
		});
	}

	fn on_periodic_backup(&mut self, result: Result<Option<BackupRecord>>) {
		match result {
			Ok(Some(record)) => {
				if self.state.persistence_error.take().is_some() {
					self.publish();
				}
				if self.config.notify_backups {
					self.notify_owner(format!("credentials backed up ({})", record.taken_at));
				}
			}
			Ok(None) => {}
			Err(err) => self.record_persistence_error(&err),
		}
	}

	async fn persist(&mut self, credentials: Credentials) {
		let store = Arc::clone(&self.store);
		let identity = self.config.identity.clone();
		match blocking(move || store.save(&identity, &credentials)).await {
			Ok(()) => {
				if self.state.persistence_error.take().is_some() {
					self.publish();
				}
			}
			Err(err) => self.record_persistence_error(&err),
		}
	}

	async fn wipe_credentials(&mut self) {
		let store = Arc::clone(&self.store);
		let identity = self.config.identity.clone();
		if let Err(err) = blocking(move || store.wipe(&identity)).await {
			self.record_persistence_error(&err);
		}
	}

	async fn write_run_marker(&mut self, phase: ConnectionPhase) {
		let path = self.channels.marker_path.clone();
		let marker = RunMarker::current(phase);
		if let Err(err) = blocking(move || marker.write(&path)).await {
			warn!(target = "tether.supervisor", error = %err, "run marker not written");
		}
	}

	fn notify_owner(&self, content: String) {
		let Some(owner) = self.config.owner_target.clone() else {
			return;
		};
		let sink = Arc::clone(&self.notifications);
		tokio::spawn(async move {
			if let Err(err) = sink.notify(&owner, &content).await {
				warn!(target = "tether.supervisor", to = %owner, error = %err, "owner notification failed");
			}
		});
	}

	fn record_error(&mut self, kind: ErrorKind, message: impl Into<String>) {
		self.state.last_error = Some(LastError {
			kind,
			message: message.into(),
			at: now_ms(),
		});
	}

	/// Write failures never stop the connection; they surface on the status snapshot.
	fn record_persistence_error(&mut self, err: &Error) {
		error!(target = "tether.store", error = %err, "credential persistence failed");
		self.state.persistence_error = Some(LastError {
			kind: err.kind(),
			message: err.to_string(),
			at: now_ms(),
		});
		self.publish();
	}

	fn set_phase(&mut self, phase: ConnectionPhase) {
		if self.state.phase != phase {
			debug!(target = "tether.supervisor", from = %self.state.phase, to = %phase, "phase transition");
		}
		self.state.phase = phase;
		self.publish();
	}

	fn publish(&self) {
		self.channels.state_tx.send_replace(self.state.clone());
		let _ = self.channels.changes.send(self.state.clone());
	}
}

fn abort(task: &mut Option<JoinHandle<()>>) {
	if let Some(task) = task.take() {
		task.abort();
	}
}

/// Forwards session events into the inbox, tagged with their attempt.
fn spawn_pump(epoch: u64, mut events: mpsc::Receiver<SessionEvent>, tx: mpsc::Sender<Input>) -> JoinHandle<()> {
	tokio::spawn(async move {
		while let Some(event) = events.recv().await {
			if tx.send(Input::Session { epoch, event }).await.is_err() {
				return;
			}
		}
		let _ = tx.send(Input::SessionEnded { epoch }).await;
	})
}

/// Delivers inbound messages one at a time so handlers see arrival order.
fn spawn_dispatch(dispatch: Arc<dyn CommandDispatch>, outbox: Outbox) -> mpsc::UnboundedSender<InboundMessage> {
	let (tx, mut rx) = mpsc::unbounded_channel::<InboundMessage>();
	tokio::spawn(async move {
		while let Some(message) = rx.recv().await {
			dispatch.on_message(message, outbox.clone()).await;
		}
	});
	tx
}
