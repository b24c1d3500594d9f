pub mod config;
pub mod logging;
pub mod metrics;
pub mod supervisor;
pub mod sync;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{debug, error, info};
use tokio::time::{MissedTickBehavior, interval};

use crate::config::{ConfigWatcher, Settings};
use crate::metrics::SyncMetrics;
use crate::supervisor::Supervisor;
use crate::sync::PgConnector;

/// How often the settings sources are re-read for changes.
pub const CONFIG_RELOAD_PERIOD: Duration = Duration::from_secs(10);

async fn shutdown_signal() {
	let ctrl_c = async {
		if let Err(e) = tokio::signal::ctrl_c().await {
			error!("failed to listen for ctrl-c: {}", e);
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		use tokio::signal::unix::{SignalKind, signal};
		match signal(SignalKind::terminate()) {
			Ok(mut s) => {
				s.recv().await;
			}
			Err(e) => {
				error!("failed to listen for SIGTERM: {}", e);
				std::future::pending::<()>().await;
			}
		}
	};
	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {}
		_ = terminate => {}
	}
}

/// Run the synchronizer until interrupted, following configuration changes.
///
/// Failing to reach either database at startup is returned as an error; after
/// startup, failures are logged and retried by the background worker. A
/// restart after a settings change that cannot connect is retried every
/// [`CONFIG_RELOAD_PERIOD`].
pub async fn run(settings: Settings, config_path: Option<PathBuf>) -> anyhow::Result<()> {
	let metrics = Arc::new(SyncMetrics::new().context("failed to register metrics")?);

	let mut supervisor = Supervisor::new(PgConnector, Arc::clone(&metrics));

	match settings.sync_config()? {
		Some(config) => supervisor
			.start(config)
			.await
			.context("failed to start database synchronization")?,
		None => info!("database synchronization is disabled"),
	}

	let watcher = Arc::new(ConfigWatcher::new(config_path, settings));
	let mut updates = watcher.subscribe();
	let reload_task = Arc::clone(&watcher).spawn(CONFIG_RELOAD_PERIOD);

	let mut retry = interval(CONFIG_RELOAD_PERIOD);
	retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

	let shutdown = shutdown_signal();
	tokio::pin!(shutdown);

	loop {
		tokio::select! {
			_ = &mut shutdown => {
				info!("shutdown requested");
				break;
			}
			changed = updates.changed() => {
				if changed.is_err() {
					break;
				}
				let snapshot = updates.borrow_and_update().clone();
				debug!("applying configuration version {}", snapshot.version);
				supervisor.reconcile(&snapshot.settings).await;
			}
			_ = retry.tick(), if supervisor.pending().is_some() => {
				supervisor.retry_pending().await;
			}
		}
	}

	reload_task.abort();
	if supervisor.is_running() {
		info!("stopping database synchronization...");
	}
	supervisor.shutdown().await;
	debug!("final metrics:\n{}", metrics.encode());
	Ok(())
}
