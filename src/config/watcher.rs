use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;

use super::{Settings, SettingsError, load_from};

/// A versioned, immutable view of the settings. Readers clone the snapshot
/// out of the channel and keep using it even if a reload happens meanwhile.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
	pub version: u64,
	pub loaded_at: DateTime<Utc>,
	pub settings: Arc<Settings>,
}

/// Re-reads the settings sources on demand or on a fixed period and
/// publishes a new snapshot whenever the effective settings change.
pub struct ConfigWatcher {
	path: Option<PathBuf>,
	tx: watch::Sender<ConfigSnapshot>,
}

impl ConfigWatcher {
	pub fn new(path: Option<PathBuf>, initial: Settings) -> Self {
		let (tx, _rx) = watch::channel(ConfigSnapshot {
			version: 1,
			loaded_at: Utc::now(),
			settings: Arc::new(initial),
		});
		Self { path, tx }
	}

	pub fn subscribe(&self) -> watch::Receiver<ConfigSnapshot> {
		self.tx.subscribe()
	}

	pub fn current(&self) -> ConfigSnapshot {
		self.tx.borrow().clone()
	}

	/// Reload once. Returns `true` when a new snapshot was published.
	pub fn reload(&self) -> Result<bool, SettingsError> {
		let fresh = load_from(self.path.as_deref())?;

		let published = self.tx.send_if_modified(|snap| {
			if *snap.settings == fresh {
				return false;
			}
			snap.version += 1;
			snap.loaded_at = Utc::now();
			snap.settings = Arc::new(fresh);
			true
		});

		if published {
			info!("configuration reloaded (version {})", self.tx.borrow().version);
		}
		Ok(published)
	}

	/// Spawn a background task that calls [`reload`](Self::reload) every
	/// `period`. A failed reload keeps the previous snapshot in force.
	pub fn spawn(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
		tokio::spawn(async move {
			let mut tick = interval(period);
			// first tick completes immediately
			tick.tick().await;
			loop {
				tick.tick().await;
				match self.reload() {
					Ok(false) => debug!("configuration unchanged"),
					Ok(true) => {}
					Err(e) => warn!("configuration reload failed, keeping previous: {}", e),
				}
			}
		})
	}
}
