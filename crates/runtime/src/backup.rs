//! Periodic, on-connect, and emergency credential snapshots.

use std::sync::Arc;
use std::time::Duration;

use tether_protocol::SessionIdentity;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::credentials::{BackupRecord, CredentialStore};
use crate::error::{Error, Result};

pub const DEFAULT_BACKUP_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// Longest an emergency snapshot waits for the store lock.
pub const EMERGENCY_LOCK_WAIT: Duration = Duration::from_secs(2);

/// Runs a blocking store call off the async executor.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
	T: Send + 'static,
	F: FnOnce() -> Result<T> + Send + 'static,
{
	tokio::task::spawn_blocking(f)
		.await
		.map_err(|err| Error::Blocking(err.to_string()))?
}

/// Owns the periodic snapshot timer for one identity.
///
/// Snapshots go through [`CredentialStore`], so they serialize against saves
/// and never read a half-written primary blob.
#[derive(Debug)]
pub struct BackupScheduler {
	store: Arc<CredentialStore>,
	identity: SessionIdentity,
	interval: Duration,
	timer: Option<JoinHandle<()>>,
}

impl BackupScheduler {
	pub fn new(store: Arc<CredentialStore>, identity: SessionIdentity, interval: Duration) -> Self {
		Self {
			store,
			identity,
			interval,
			timer: None,
		}
	}

	pub fn interval(&self) -> Duration {
		self.interval
	}

	pub fn is_armed(&self) -> bool {
		self.timer.as_ref().is_some_and(|timer| !timer.is_finished())
	}

	pub async fn snapshot_now(&self) -> Result<Option<BackupRecord>> {
		let store = Arc::clone(&self.store);
		let identity = self.identity.clone();
		blocking(move || store.snapshot(&identity)).await
	}

	/// Immediate snapshot after a successful connect, pinned as known-good.
	pub async fn on_connected(&self) -> Result<Option<BackupRecord>> {
		let store = Arc::clone(&self.store);
		let identity = self.identity.clone();
		blocking(move || {
			let Some(record) = store.snapshot(&identity)? else {
				return Ok(None);
			};
			store.mark_known_good(&record)?;
			Ok(Some(record))
		})
		.await
	}

	/// Starts the periodic timer, replacing any previous one.
	///
	/// `on_snapshot` receives every result; the first tick fires one interval
	/// from now.
	pub fn arm<F>(&mut self, on_snapshot: F)
	where
		F: Fn(Result<Option<BackupRecord>>) + Send + Sync + 'static,
	{
		self.cancel();
		if self.interval.is_zero() {
			debug!(target = "tether.backup", "periodic snapshots disabled");
			return;
		}

		let store = Arc::clone(&self.store);
		let identity = self.identity.clone();
		let period = self.interval;
		self.timer = Some(tokio::spawn(async move {
			let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
			loop {
				ticker.tick().await;
				let store = Arc::clone(&store);
				let identity = identity.clone();
				let result = blocking(move || store.snapshot(&identity)).await;
				if let Err(err) = &result {
					warn!(target = "tether.backup", error = %err, "periodic snapshot failed");
				}
				on_snapshot(result);
			}
		}));
		debug!(target = "tether.backup", interval_secs = period.as_secs(), "periodic snapshots armed");
	}

	pub fn cancel(&mut self) {
		if let Some(timer) = self.timer.take() {
			timer.abort();
		}
	}

	/// Handle usable from synchronous crash paths such as a panic hook.
	pub fn emergency(&self) -> EmergencySnapshot {
		EmergencySnapshot::new(Arc::clone(&self.store), self.identity.clone())
	}
}

impl Drop for BackupScheduler {
	fn drop(&mut self) {
		self.cancel();
	}
}

/// Synchronous, bounded-wait snapshot for crash paths.
#[derive(Debug, Clone)]
pub struct EmergencySnapshot {
	store: Arc<CredentialStore>,
	identity: SessionIdentity,
}

impl EmergencySnapshot {
	pub fn new(store: Arc<CredentialStore>, identity: SessionIdentity) -> Self {
		Self { store, identity }
	}

	pub fn take(&self) -> Result<Option<BackupRecord>> {
		self.store.try_snapshot(&self.identity, EMERGENCY_LOCK_WAIT)
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use tempfile::TempDir;
	use tether_protocol::{CredentialMeta, Credentials};

	use super::*;

	fn setup(tmp: &TempDir) -> (Arc<CredentialStore>, SessionIdentity) {
		let store = Arc::new(CredentialStore::new(tmp.path().join("sessions"), tmp.path().join("backups")).with_retention(50));
		let identity = SessionIdentity::new("bot");
		let creds = Credentials::new(
			CredentialMeta {
				registered: true,
				device_label: String::new(),
				saved_at: 1,
			},
			b"material".to_vec(),
		);
		store.save(&identity, &creds).unwrap();
		(store, identity)
	}

	#[tokio::test]
	async fn on_connect_snapshot_is_pinned_known_good() {
		let tmp = TempDir::new().unwrap();
		let (store, identity) = setup(&tmp);
		let scheduler = BackupScheduler::new(Arc::clone(&store), identity.clone(), Duration::ZERO);

		let record = scheduler.on_connected().await.unwrap().unwrap();

		let marker = std::fs::read_to_string(store.backup_dir(&identity).join("known_good.json")).unwrap();
		assert!(marker.contains(&record.taken_at.to_string()));
	}

	#[tokio::test]
	async fn periodic_timer_snapshots_until_cancelled() {
		let tmp = TempDir::new().unwrap();
		let (store, identity) = setup(&tmp);
		let mut scheduler = BackupScheduler::new(Arc::clone(&store), identity.clone(), Duration::from_millis(20));
		let ticks = Arc::new(AtomicUsize::new(0));

		let counter = Arc::clone(&ticks);
		scheduler.arm(move |result| {
			assert!(result.unwrap().is_some());
			counter.fetch_add(1, Ordering::SeqCst);
		});
		assert!(scheduler.is_armed());

		tokio::time::sleep(Duration::from_millis(150)).await;
		scheduler.cancel();
		let seen = ticks.load(Ordering::SeqCst);
		assert!(seen >= 2, "only {seen} ticks");

		tokio::time::sleep(Duration::from_millis(80)).await;
		assert_eq!(ticks.load(Ordering::SeqCst), seen);
		assert!(!scheduler.is_armed());
	}

	#[tokio::test]
	async fn zero_interval_never_arms() {
		let tmp = TempDir::new().unwrap();
		let (store, identity) = setup(&tmp);
		let mut scheduler = BackupScheduler::new(store, identity, Duration::ZERO);
		scheduler.arm(|_| {});
		assert!(!scheduler.is_armed());
	}

	#[test]
	fn emergency_snapshot_runs_without_a_runtime() {
		let tmp = TempDir::new().unwrap();
		let (store, identity) = setup(&tmp);
		let emergency = EmergencySnapshot::new(Arc::clone(&store), identity.clone());

		assert!(emergency.take().unwrap().is_some());
		assert_eq!(store.list_backups(&identity).unwrap().len(), 1);
	}
}
