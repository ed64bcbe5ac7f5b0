//! Supervisor behavior against a scripted protocol client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tether_runtime::auth::{AuthConfig, AuthMode};
use tether_runtime::backoff::RetryPolicy;
use tether_runtime::client::SessionEvent;
use tether_runtime::credentials::CredentialStore;
use tether_runtime::process::{PreviousRun, RUN_MARKER_FILE, RunMarker, inspect_previous_run};
use tether_runtime::protocol::{
	Challenge, ChallengeProblem, ConnectionPhase, ConnectionState, CredentialMeta, Credentials, DisconnectReason, ErrorKind,
	InboundMessage, SessionIdentity, status_code,
};
use tether_runtime::sinks::{CommandDispatch, PresentationSink};
use tether_runtime::supervisor::{self, Collaborators, Outbox, SupervisorConfig, SupervisorHandle};
use tether_runtime::testing::{ConnectOutcome, DEFAULT_PAIRING_CODE, ScriptController, ScriptedClient};
use tether_runtime::{Error, Result};

const WAIT: Duration = Duration::from_secs(3);

fn identity() -> SessionIdentity {
	SessionIdentity::new("test-bot")
}

fn credentials() -> Credentials {
	Credentials::new(
		CredentialMeta {
			registered: true,
			device_label: "Ubuntu Chrome".to_string(),
			saved_at: 1_700_000_000_000,
		},
		b"linked-device-keys".to_vec(),
	)
}

fn store(tmp: &TempDir) -> Arc<CredentialStore> {
	Arc::new(CredentialStore::new(tmp.path().join("sessions"), tmp.path().join("backups")))
}

fn quick_retries() -> RetryPolicy {
	RetryPolicy {
		base_delay: Duration::from_millis(10),
		multiplier: 2.0,
		max_delay: Duration::from_millis(80),
		jitter_ratio: 0.0,
		infinite_in_production: false,
		attempt_ceiling: 3,
		fast_retry_delay: Duration::from_millis(5),
		fast_retry_limit: 5,
	}
}

fn config() -> SupervisorConfig {
	SupervisorConfig {
		retry: quick_retries(),
		backup_interval: Duration::ZERO,
		..SupervisorConfig::new(identity())
	}
}

#[derive(Default)]
struct RecordingPresenter {
	challenges: Mutex<Vec<Challenge>>,
	problems: Mutex<Vec<ChallengeProblem>>,
}

impl PresentationSink for RecordingPresenter {
	fn show_challenge(&self, challenge: &Challenge) {
		self.challenges.lock().push(challenge.clone());
	}

	fn challenge_unavailable(&self, problem: &ChallengeProblem) {
		self.problems.lock().push(problem.clone());
	}
}

struct PingPong;

#[async_trait]
impl CommandDispatch for PingPong {
	async fn on_message(&self, message: InboundMessage, outbox: Outbox) {
		if message.text.as_deref() == Some("!ping") {
			let _ = outbox.send(&message.chat, "pong").await;
		}
	}
}

fn start_with(
	config: SupervisorConfig,
	store: Arc<CredentialStore>,
	collaborators: Collaborators,
) -> Result<(SupervisorHandle, ScriptController)> {
	let (client, script) = ScriptedClient::new();
	let handle = supervisor::spawn(config, store, client, collaborators)?;
	Ok((handle, script))
}

async fn phase(handle: &SupervisorHandle, phase: ConnectionPhase) -> ConnectionState {
	handle.wait_for(WAIT, |s| s.phase == phase).await.unwrap()
}

async fn eventually(mut condition: impl FnMut() -> bool) {
	let deadline = tokio::time::Instant::now() + WAIT;
	while !condition() {
		assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
}

#[tokio::test]
async fn stored_credentials_connect_and_take_known_good_snapshot() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp);
	store.save(&identity(), &credentials()).unwrap();
	let (handle, script) = start_with(config(), Arc::clone(&store), Collaborators::default()).unwrap();
	script.push(ConnectOutcome::open());

	handle.start().await.unwrap();
	let state = phase(&handle, ConnectionPhase::Connected).await;

	assert_eq!(state.attempt_count, 0);
	assert!(state.connected_at.is_some());
	assert_eq!(script.connect_credentials(), vec![Some(credentials())]);
	assert_eq!(store.list_backups(&identity()).unwrap().len(), 1);
	assert!(store.backup_dir(&identity()).join("known_good.json").exists());

	let marker_path = store.session_dir(&identity()).join(RUN_MARKER_FILE);
	eventually(|| matches!(RunMarker::read(&marker_path), Ok(Some(m)) if m.phase == ConnectionPhase::Connected)).await;

	handle.shutdown().await.unwrap();
	assert_eq!(RunMarker::read(&marker_path).unwrap().unwrap().phase, ConnectionPhase::Idle);
}

#[tokio::test]
async fn lost_primary_is_restored_from_snapshot_before_connecting() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp);
	store.save(&identity(), &credentials()).unwrap();
	store.snapshot(&identity()).unwrap().unwrap();
	std::fs::remove_dir_all(store.session_dir(&identity())).unwrap();

	let (handle, script) = start_with(config(), Arc::clone(&store), Collaborators::default()).unwrap();
	script.push(ConnectOutcome::open());
	handle.start().await.unwrap();
	phase(&handle, ConnectionPhase::Connected).await;

	assert_eq!(script.connect_credentials(), vec![Some(credentials())]);
	assert_eq!(store.load(&identity()).unwrap(), Some(credentials()));
	handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn missing_credentials_present_qr_until_linked() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp);
	let presenter = Arc::new(RecordingPresenter::default());
	let (handle, script) = start_with(config(), Arc::clone(&store), Collaborators::new(presenter.clone())).unwrap();
	script.push(ConnectOutcome::Events(vec![SessionEvent::Qr("qr-ref-1".to_string())]));

	handle.start().await.unwrap();
	let state = phase(&handle, ConnectionPhase::AwaitingChallenge).await;
	assert_eq!(state.last_error.map(|e| e.kind), Some(ErrorKind::CredentialsMissing));
	eventually(|| !presenter.challenges.lock().is_empty()).await;
	assert_eq!(presenter.challenges.lock()[0], Challenge::Qr {
		payload: "qr-ref-1".to_string()
	});

	assert!(script.emit(SessionEvent::CredentialsUpdated(credentials())));
	assert!(script.emit(SessionEvent::Open));
	phase(&handle, ConnectionPhase::Connected).await;

	assert_eq!(script.connect_credentials(), vec![None]);
	assert_eq!(store.load(&identity()).unwrap(), Some(credentials()));
	handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn logged_out_session_is_wiped_and_relinked() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp);
	store.save(&identity(), &credentials()).unwrap();
	let (handle, script) = start_with(config(), Arc::clone(&store), Collaborators::default()).unwrap();
	script.push(ConnectOutcome::open());
	handle.start().await.unwrap();
	phase(&handle, ConnectionPhase::Connected).await;

	let mut changes = handle.state_changes();
	assert!(script.emit(SessionEvent::Closed(DisconnectReason::remote(status_code::LOGGED_OUT))));
	let state = phase(&handle, ConnectionPhase::AwaitingChallenge).await;

	assert_eq!(state.last_error.map(|e| e.kind), Some(ErrorKind::ProtocolRejection));
	assert_eq!(store.load(&identity()).unwrap(), None);
	assert_eq!(store.restore_latest(&identity()).unwrap(), None, "pre-logout snapshot must not come back");
	eventually(|| script.connect_count() == 2).await;
	assert_eq!(script.connect_credentials()[1], None);

	let mut seen = Vec::new();
	while let Ok(state) = changes.try_recv() {
		seen.push(state.phase);
	}
	let closing = seen.iter().position(|p| *p == ConnectionPhase::Closing).unwrap();
	let awaiting = seen.iter().position(|p| *p == ConnectionPhase::AwaitingChallenge).unwrap();
	assert!(closing < awaiting, "transitions: {seen:?}");
	handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn dropped_connection_retries_fast_and_keeps_credentials() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp);
	store.save(&identity(), &credentials()).unwrap();
	let (handle, script) = start_with(config(), Arc::clone(&store), Collaborators::default()).unwrap();
	script.push(ConnectOutcome::open());
	script.push(ConnectOutcome::open());
	handle.start().await.unwrap();
	phase(&handle, ConnectionPhase::Connected).await;

	assert!(script.emit(SessionEvent::Closed(DisconnectReason::remote(status_code::CONNECTION_CLOSED))));
	let state = handle
		.wait_for(WAIT, |s| s.is_connected() && s.reconnect_count == 1)
		.await
		.unwrap();

	assert_eq!(state.attempt_count, 0);
	assert_eq!(script.connect_count(), 2);
	assert_eq!(store.load(&identity()).unwrap(), Some(credentials()));
	handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn remote_close_clears_connected_run_marker() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp);
	store.save(&identity(), &credentials()).unwrap();
	let config = SupervisorConfig {
		retry: RetryPolicy {
			base_delay: Duration::from_secs(30),
			max_delay: Duration::from_secs(60),
			..quick_retries()
		},
		..config()
	};
	let (handle, script) = start_with(config, Arc::clone(&store), Collaborators::default()).unwrap();
	script.push(ConnectOutcome::open());
	handle.start().await.unwrap();
	phase(&handle, ConnectionPhase::Connected).await;
	let marker_path = store.session_dir(&identity()).join(RUN_MARKER_FILE);
	eventually(|| matches!(RunMarker::read(&marker_path), Ok(Some(m)) if m.phase == ConnectionPhase::Connected)).await;

	assert!(script.emit(SessionEvent::Closed(DisconnectReason::remote(status_code::UNAVAILABLE_SERVICE))));
	let state = handle
		.wait_for(WAIT, |s| s.phase == ConnectionPhase::Idle && s.retry_at.is_some())
		.await
		.unwrap();
	assert_eq!(state.attempt_count, 1);

	let marker = RunMarker::read(&marker_path).unwrap().unwrap();
	assert_eq!(marker.phase, ConnectionPhase::Closing);

	// A process killed while backing off left no live session behind.
	RunMarker {
		pid: 4_000_000_000,
		..marker
	}
	.write(&marker_path)
	.unwrap();
	assert_eq!(inspect_previous_run(&marker_path).unwrap(), PreviousRun::Clean);
	handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn backoff_failures_fault_after_interactive_ceiling() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp);
	store.save(&identity(), &credentials()).unwrap();
	let (handle, script) = start_with(config(), Arc::clone(&store), Collaborators::default()).unwrap();
	for _ in 0..4 {
		script.push(ConnectOutcome::refuse(DisconnectReason::remote(status_code::UNAVAILABLE_SERVICE)));
	}

	handle.start().await.unwrap();
	let state = phase(&handle, ConnectionPhase::Faulted).await;

	assert_eq!(script.connect_count(), 4);
	assert_eq!(state.attempt_count, 3);
	assert_eq!(state.retry_at, None);
	assert_eq!(store.load(&identity()).unwrap(), Some(credentials()));

	tokio::time::sleep(Duration::from_millis(100)).await;
	assert_eq!(script.connect_count(), 4, "faulted supervisor must stay down");
	handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn fast_retry_streak_falls_back_to_backoff() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp);
	store.save(&identity(), &credentials()).unwrap();
	let config = SupervisorConfig {
		retry: RetryPolicy {
			fast_retry_limit: 2,
			..quick_retries()
		},
		..config()
	};
	let (handle, script) = start_with(config, Arc::clone(&store), Collaborators::default()).unwrap();
	for _ in 0..3 {
		script.push(ConnectOutcome::refuse(DisconnectReason::remote(status_code::RESTART_REQUIRED)));
	}
	script.push(ConnectOutcome::open());

	let mut changes = handle.state_changes();
	handle.start().await.unwrap();
	phase(&handle, ConnectionPhase::Connected).await;

	let mut max_attempt = 0;
	while let Ok(state) = changes.try_recv() {
		max_attempt = max_attempt.max(state.attempt_count);
	}
	assert_eq!(max_attempt, 1, "third fast failure should consume one backoff attempt");
	assert_eq!(script.connect_count(), 4);
	handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn reconnect_storm_never_overlaps_connect_attempts() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp);
	store.save(&identity(), &credentials()).unwrap();
	let (handle, script) = start_with(config(), Arc::clone(&store), Collaborators::default()).unwrap();
	script.set_connect_delay(Duration::from_millis(25));

	handle.start().await.unwrap();
	for _ in 0..10 {
		handle.trigger_reset().await.unwrap();
		tokio::time::sleep(Duration::from_millis(3)).await;
	}
	assert!(script.wait_for_connects(11, WAIT).await);

	assert_eq!(script.max_in_flight(), 1);
	handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn pairing_code_is_presented_then_expires() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp);
	let presenter = Arc::new(RecordingPresenter::default());
	let config = SupervisorConfig {
		retry: RetryPolicy {
			base_delay: Duration::from_secs(30),
			max_delay: Duration::from_secs(60),
			..quick_retries()
		},
		auth: AuthConfig {
			mode: AuthMode::PairingCode {
				phone_number: "+1 (987) 654-3210".to_string(),
			},
			default_country_code: "1".to_string(),
			challenge_ttl: Duration::from_millis(100),
		},
		..config()
	};
	let (handle, script) = start_with(config, Arc::clone(&store), Collaborators::new(presenter.clone())).unwrap();
	script.push(ConnectOutcome::Events(vec![SessionEvent::Qr("ignored".to_string())]));

	handle.start().await.unwrap();
	eventually(|| !presenter.challenges.lock().is_empty()).await;
	assert_eq!(presenter.challenges.lock()[0], Challenge::PairingCode {
		code: DEFAULT_PAIRING_CODE.to_string(),
		expires_in_secs: 0,
	});
	assert_eq!(script.pairing_requests(), vec!["19876543210".to_string()]);

	let state = handle
		.wait_for(WAIT, |s| s.last_error.as_ref().is_some_and(|e| e.kind == ErrorKind::AuthExpired))
		.await
		.unwrap();
	assert_eq!(state.phase, ConnectionPhase::Idle);
	assert!(state.retry_at.is_some());
	assert_eq!(presenter.problems.lock().as_slice(), &[ChallengeProblem::Expired]);
	assert_eq!(script.pairing_requests().len(), 1, "no silent re-request");
	assert_eq!(script.closed_sessions(), 1);
	handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn invalid_pairing_number_parks_without_retrying() {
	let tmp = TempDir::new().unwrap();
	let presenter = Arc::new(RecordingPresenter::default());
	let config = SupervisorConfig {
		auth: AuthConfig {
			mode: AuthMode::PairingCode {
				phone_number: "12".to_string(),
			},
			..AuthConfig::default()
		},
		..config()
	};
	let (handle, script) = start_with(config, store(&tmp), Collaborators::new(presenter.clone())).unwrap();

	handle.start().await.unwrap();
	let state = handle
		.wait_for(WAIT, |s| s.last_error.as_ref().is_some_and(|e| e.kind == ErrorKind::Config))
		.await
		.unwrap();

	assert_eq!(state.phase, ConnectionPhase::Idle);
	assert_eq!(state.retry_at, None);
	assert!(matches!(presenter.problems.lock().as_slice(), [ChallengeProblem::Misconfigured { .. }]));
	tokio::time::sleep(Duration::from_millis(100)).await;
	assert_eq!(script.connect_count(), 1);
	handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn reset_wipes_and_restarts_linking() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp);
	store.save(&identity(), &credentials()).unwrap();
	let (handle, script) = start_with(config(), Arc::clone(&store), Collaborators::default()).unwrap();
	script.push(ConnectOutcome::open());
	handle.start().await.unwrap();
	phase(&handle, ConnectionPhase::Connected).await;

	handle.trigger_reset().await.unwrap();
	let state = phase(&handle, ConnectionPhase::AwaitingChallenge).await;

	assert_eq!(state.last_error.map(|e| e.kind), Some(ErrorKind::CredentialsMissing));
	assert_eq!(store.load(&identity()).unwrap(), None);
	eventually(|| script.connect_count() == 2).await;
	assert_eq!(script.connect_credentials()[1], None);
	assert_eq!(script.closed_sessions(), 1);
	handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_snapshots_and_does_not_reconnect() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp);
	store.save(&identity(), &credentials()).unwrap();
	let (handle, script) = start_with(config(), Arc::clone(&store), Collaborators::default()).unwrap();
	script.push(ConnectOutcome::open());
	handle.start().await.unwrap();
	phase(&handle, ConnectionPhase::Connected).await;

	handle.shutdown().await.unwrap();

	assert_eq!(store.list_backups(&identity()).unwrap().len(), 2);
	assert_eq!(handle.state().phase, ConnectionPhase::Idle);
	assert_eq!(script.closed_sessions(), 1);
	tokio::time::sleep(Duration::from_millis(50)).await;
	assert_eq!(script.connect_count(), 1);
	assert!(matches!(handle.start().await, Err(Error::Shutdown)));
}

#[tokio::test]
async fn inbound_messages_reach_dispatch_and_owner_is_notified() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp);
	store.save(&identity(), &credentials()).unwrap();
	let config = SupervisorConfig {
		owner_target: Some("owner-chat".to_string()),
		..config()
	};
	let collaborators = Collaborators::default().with_dispatch(Arc::new(PingPong));
	let (handle, script) = start_with(config, Arc::clone(&store), collaborators).unwrap();
	script.push(ConnectOutcome::open());
	handle.start().await.unwrap();
	phase(&handle, ConnectionPhase::Connected).await;

	assert!(script.emit(SessionEvent::Message(InboundMessage {
		id: "m-1".to_string(),
		chat: "chat-1".to_string(),
		sender: "chat-1".to_string(),
		text: Some("!ping".to_string()),
		timestamp: 0,
	})));

	eventually(|| script.sent().contains(&("chat-1".to_string(), "pong".to_string()))).await;
	eventually(|| script.sent().iter().any(|(to, text)| to == "owner-chat" && text.contains("online"))).await;
	handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn outbox_refuses_when_not_connected() {
	let tmp = TempDir::new().unwrap();
	let (handle, _script) = start_with(config(), store(&tmp), Collaborators::default()).unwrap();
	let err = handle.send("chat-1", "hello").await.unwrap_err();
	assert!(matches!(err, Error::Transport(_)));
	handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn write_failures_surface_without_blocking_the_connection() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp);
	// A directory squatting on the primary blob path makes every save and snapshot fail.
	std::fs::create_dir_all(store.primary_path(&identity()).join("occupied")).unwrap();
	let (handle, script) = start_with(config(), Arc::clone(&store), Collaborators::default()).unwrap();
	script.push(ConnectOutcome::Events(vec![
		SessionEvent::CredentialsUpdated(credentials()),
		SessionEvent::Open,
	]));

	handle.start().await.unwrap();
	let state = phase(&handle, ConnectionPhase::Connected).await;

	let persistence = state.persistence_error.expect("write failure should be surfaced");
	assert_eq!(persistence.kind, ErrorKind::Persistence);
	handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn crash_left_by_dead_process_is_reported() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp);
	RunMarker {
		pid: 4_000_000_000,
		phase: ConnectionPhase::Connected,
		updated_at: 1,
	}
	.write(&store.session_dir(&identity()).join(RUN_MARKER_FILE))
	.unwrap();

	let (handle, _script) = start_with(config(), store, Collaborators::default()).unwrap();

	assert_eq!(handle.state().last_error.map(|e| e.kind), Some(ErrorKind::CrashRecovered));
	handle.shutdown().await.unwrap();
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn identity_owned_by_live_process_is_refused() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp);
	RunMarker {
		pid: 1,
		phase: ConnectionPhase::Connected,
		updated_at: 1,
	}
	.write(&store.session_dir(&identity()).join(RUN_MARKER_FILE))
	.unwrap();

	let err = start_with(config(), store, Collaborators::default()).err().unwrap();
	assert!(matches!(err, Error::Config(_)));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn reclaimed_marker_from_reused_pid_is_treated_as_crash() {
	let tmp = TempDir::new().unwrap();
	let store = store(&tmp);
	RunMarker {
		pid: 1,
		phase: ConnectionPhase::Connected,
		updated_at: 1,
	}
	.write(&store.session_dir(&identity()).join(RUN_MARKER_FILE))
	.unwrap();

	let config = SupervisorConfig {
		reclaim_live_marker: true,
		..config()
	};
	let (handle, _script) = start_with(config, store, Collaborators::default()).unwrap();
	assert_eq!(handle.state().last_error.map(|e| e.kind), Some(ErrorKind::CrashRecovered));
	handle.shutdown().await.unwrap();
}
