use std::sync::Arc;

use log::{error, info, warn};

use crate::config::{Settings, SyncConfig};
use crate::metrics::SyncMetrics;
use crate::sync::{Connector, EventLoader, SyncError, ThreadLoader};

struct Running<K: Connector> {
	config: SyncConfig,
	loader: ThreadLoader<K>,
}

/// Keeps at most one background synchronizer in line with the current
/// settings.
///
/// A configuration whose loader could not be started stays pending and is
/// retried by [`retry_pending`](Self::retry_pending) until it comes up or the
/// settings change again.
pub struct Supervisor<K: Connector + Clone> {
	connector: K,
	metrics: Arc<SyncMetrics>,
	current: Option<Running<K>>,
	pending: Option<SyncConfig>,
}

impl<K: Connector + Clone> Supervisor<K> {
	pub fn new(connector: K, metrics: Arc<SyncMetrics>) -> Self {
		Self {
			connector,
			metrics,
			current: None,
			pending: None,
		}
	}

	pub fn is_running(&self) -> bool {
		self.current.is_some()
	}

	/// Configuration of the running synchronizer.
	pub fn active_config(&self) -> Option<&SyncConfig> {
		self.current.as_ref().map(|r| &r.config)
	}

	/// Configuration waiting for a successful start.
	pub fn pending(&self) -> Option<&SyncConfig> {
		self.pending.as_ref()
	}

	/// Start a synchronizer for `config`, replacing any running one. A
	/// failure is returned and nothing is kept pending.
	pub async fn start(&mut self, config: SyncConfig) -> Result<(), SyncError> {
		self.shutdown().await;

		let loader = EventLoader::new(config.clone(), self.connector.clone())
			.with_metrics(Arc::clone(&self.metrics));
		let loader = ThreadLoader::new(loader).with_metrics(Arc::clone(&self.metrics));
		loader.start().await?;

		info!(
			"database synchronization started (interval {}s, central site {}, regional site {})",
			config.interval.as_secs(),
			config.central_site_id,
			config.regional_site_id
		);
		self.current = Some(Running { config, loader });
		Ok(())
	}

	/// Bring the synchronizer in line with freshly loaded settings.
	pub async fn reconcile(&mut self, settings: &Settings) {
		let wanted = match settings.sync_config() {
			Ok(w) => w,
			Err(e) => {
				error!("ignoring reloaded configuration: {}", e);
				return;
			}
		};

		let target = self.active_config().or(self.pending.as_ref());
		if target == wanted.as_ref() {
			return;
		}

		if self.current.is_some() {
			info!("synchronization settings changed, restarting synchronizer");
		}
		self.shutdown().await;

		match wanted {
			Some(config) => self.start_or_defer(config).await,
			None => info!("database synchronization is disabled"),
		}
	}

	/// Try the pending configuration again. Returns `true` once it runs.
	pub async fn retry_pending(&mut self) -> bool {
		let Some(config) = self.pending.take() else {
			return self.is_running();
		};
		self.start_or_defer(config).await;
		self.is_running()
	}

	/// Stop the running synchronizer and forget any pending configuration.
	pub async fn shutdown(&mut self) {
		self.pending = None;
		if let Some(old) = self.current.take() {
			old.loader.stop().await;
		}
	}

	async fn start_or_defer(&mut self, config: SyncConfig) {
		if let Err(e) = self.start(config.clone()).await {
			warn!("synchronizer not started, will retry: {}", e);
			self.pending = Some(config);
		}
	}
}
