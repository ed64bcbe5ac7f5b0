//! The connection supervisor.
//!
//! One actor task owns the session, the [`ConnectionState`] and every timer.
//! Protocol events, worker results and operator commands all arrive as
//! [`Input`]s on a single inbox, so no two transitions ever race. Work that
//! waits (connecting, pairing-code requests, file I/O, backoff sleeps) runs in
//! spawned tasks that post their result back, tagged with the epoch of the
//! attempt that started them; results from an older epoch are dropped.

use std::sync::Arc;
use std::time::Duration;

use tether_protocol::{ClientFingerprint, ConnectionPhase, ConnectionState, ErrorKind, LastError, SessionIdentity};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::warn;

use crate::auth::AuthConfig;
use crate::backoff::RetryPolicy;
use crate::backup::DEFAULT_BACKUP_INTERVAL;
use crate::client::{ProtocolClient, Session, SessionEvent};
use crate::credentials::{BackupRecord, CredentialStore};
use crate::error::{Error, Result};
use crate::now_ms;
use crate::process::{PreviousRun, RUN_MARKER_FILE, inspect_previous_run};
use crate::sinks::{CommandDispatch, NoPresentation, NotificationSink, PresentationSink};

mod actor;
mod handle;

pub use handle::{Outbox, SupervisorHandle};

const INBOX_CAPACITY: usize = 256;
const STATE_HISTORY: usize = 64;
/// Longest a graceful session close may take before it is abandoned.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Supervisor settings, fixed for the life of the process.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
	pub identity: SessionIdentity,
	pub retry: RetryPolicy,
	pub auth: AuthConfig,
	pub fingerprint: ClientFingerprint,
	/// Zero disables periodic snapshots; the on-connect snapshot still runs.
	pub backup_interval: Duration,
	/// Conversation that receives status pings.
	pub owner_target: Option<String>,
	/// Also tell the owner about each periodic snapshot.
	pub notify_backups: bool,
	/// Treat a live pid in the run marker as reused by an unrelated process.
	///
	/// Callers set this once they have confirmed no supervisor answers for the identity.
	pub reclaim_live_marker: bool,
}

impl SupervisorConfig {
	pub fn new(identity: SessionIdentity) -> Self {
		Self {
			identity,
			retry: RetryPolicy::default(),
			auth: AuthConfig::default(),
			fingerprint: ClientFingerprint::default(),
			backup_interval: DEFAULT_BACKUP_INTERVAL,
			owner_target: None,
			notify_backups: false,
			reclaim_live_marker: false,
		}
	}
}

/// Collaborators the supervisor reports to.
pub struct Collaborators {
	pub presentation: Arc<dyn PresentationSink>,
	/// Defaults to sending through the supervised session itself.
	pub notifications: Option<Arc<dyn NotificationSink>>,
	pub dispatch: Option<Arc<dyn CommandDispatch>>,
}

impl Collaborators {
	pub fn new(presentation: Arc<dyn PresentationSink>) -> Self {
		Self {
			presentation,
			notifications: None,
			dispatch: None,
		}
	}

	pub fn with_notifications(mut self, notifications: Arc<dyn NotificationSink>) -> Self {
		self.notifications = Some(notifications);
		self
	}

	pub fn with_dispatch(mut self, dispatch: Arc<dyn CommandDispatch>) -> Self {
		self.dispatch = Some(dispatch);
		self
	}
}

impl Default for Collaborators {
	fn default() -> Self {
		Self::new(Arc::new(NoPresentation))
	}
}

impl std::fmt::Debug for Collaborators {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Collaborators")
			.field("notifications", &self.notifications.is_some())
			.field("dispatch", &self.dispatch.is_some())
			.finish_non_exhaustive()
	}
}

pub(crate) enum Command {
	Start,
	Reset,
	Shutdown {
		done: oneshot::Sender<()>,
	},
	Send {
		target: String,
		content: String,
		reply: oneshot::Sender<Result<()>>,
	},
}

/// Everything the actor reacts to.
pub(crate) enum Input {
	Command(Command),
	Connected { epoch: u64, result: Result<Session> },
	Session { epoch: u64, event: SessionEvent },
	SessionEnded { epoch: u64 },
	RetryDue { epoch: u64 },
	ChallengeExpired { epoch: u64 },
	PairingCode { epoch: u64, result: Result<String> },
	Backup { epoch: u64, result: Result<Option<BackupRecord>> },
}

/// Spawns the supervisor actor in `Idle`. Call [`SupervisorHandle::start`] to begin.
///
/// Fails with [`Error::Config`] when another live process owns the identity.
/// Must be called from within a Tokio runtime.
pub fn spawn(
	config: SupervisorConfig,
	store: Arc<CredentialStore>,
	client: Arc<dyn ProtocolClient>,
	collaborators: Collaborators,
) -> Result<SupervisorHandle> {
	if !config.identity.is_path_safe() {
		return Err(Error::Config(format!("session identity {:?} is not a valid directory name", config.identity)));
	}

	let marker_path = store.session_dir(&config.identity).join(RUN_MARKER_FILE);
	let mut initial = ConnectionState::default();
	let previous = match inspect_previous_run(&marker_path)? {
		PreviousRun::Running(marker) if config.reclaim_live_marker => {
			warn!(
				target = "tether.supervisor",
				identity = %config.identity,
				pid = marker.pid,
				"run marker pid is alive but not supervising; assuming it was reused"
			);
			if marker.phase == ConnectionPhase::Connected {
				PreviousRun::Crashed(marker)
			} else {
				PreviousRun::Clean
			}
		}
		previous => previous,
	};
	match previous {
		PreviousRun::Clean => {}
		PreviousRun::Running(marker) => {
			return Err(Error::Config(format!(
				"session {} is already supervised by running process {}",
				config.identity, marker.pid
			)));
		}
		PreviousRun::Crashed(marker) => {
			warn!(
				target = "tether.supervisor",
				identity = %config.identity,
				pid = marker.pid,
				"previous run ended while connected; recovering"
			);
			initial.last_error = Some(LastError {
				kind: ErrorKind::CrashRecovered,
				message: format!("process {} exited while connected", marker.pid),
				at: now_ms(),
			});
		}
	}

	let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);
	let (state_tx, state_rx) = watch::channel(initial.clone());
	let (changes, _) = broadcast::channel(STATE_HISTORY);

	let outbox = Outbox::new(tx.downgrade());
	let actor = actor::Actor::new(
		config,
		store,
		client,
		collaborators,
		actor::Channels {
			inbox,
			tx: tx.downgrade(),
			state_tx,
			changes: changes.clone(),
			marker_path,
		},
		initial,
		outbox,
	);
	tokio::spawn(actor.run());

	Ok(SupervisorHandle::new(tx, state_rx, changes))
}
