use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::error::SyncError;
use super::loader::{EventLoader, LoaderProgress};
use super::site::Connector;
use crate::metrics::SyncMetrics;

/// Snapshot of the background synchronizer for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoaderStatus {
	pub running: bool,
	pub current_event: Option<String>,
	pub events_handled: u64,
	pub passes: u64,
}

/// Flags shared with the worker task.
#[derive(Debug, Default)]
struct Control {
	running: AtomicBool,
	stop_requested: AtomicBool,
	wake: Notify,
}

impl Control {
	fn stop_requested(&self) -> bool {
		self.stop_requested.load(Ordering::Acquire)
	}

	fn request_stop(&self) {
		self.stop_requested.store(true, Ordering::Release);
		// no permit is stored, so nothing leaks into the next start
		self.wake.notify_waiters();
	}

	/// Sleep for `d`, returning early once a stop is requested.
	async fn pause(&self, d: Duration) {
		let notified = self.wake.notified();
		tokio::pin!(notified);
		// registered before the flag check so a concurrent stop still wakes us
		notified.as_mut().enable();
		if self.stop_requested() {
			return;
		}
		tokio::select! {
			_ = sleep(d) => {}
			_ = notified => {}
		}
	}
}

struct Lifecycle<K: Connector> {
	/// Present while stopped; moved into the worker while running.
	loader: Option<EventLoader<K>>,
	worker: Option<JoinHandle<EventLoader<K>>>,
}

/// Runs an [`EventLoader`] on a background task at a fixed cadence.
///
/// States are Stopped and Running. `start` and `stop` are idempotent and
/// may be called from any task; `stop` lets the current pass finish.
pub struct ThreadLoader<K: Connector> {
	control: Arc<Control>,
	lifecycle: Mutex<Lifecycle<K>>,
	progress: Arc<LoaderProgress>,
	metrics: Option<Arc<SyncMetrics>>,
}

impl<K: Connector> ThreadLoader<K> {
	pub fn new(loader: EventLoader<K>) -> Self {
		let progress = loader.progress();
		Self {
			control: Arc::new(Control::default()),
			lifecycle: Mutex::new(Lifecycle {
				loader: Some(loader),
				worker: None,
			}),
			progress,
			metrics: None,
		}
	}

	pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
		self.metrics = Some(metrics);
		self
	}

	pub fn is_running(&self) -> bool {
		self.control.running.load(Ordering::Acquire)
	}

	pub fn status(&self) -> LoaderStatus {
		LoaderStatus {
			running: self.is_running(),
			current_event: self.progress.current_event(),
			events_handled: self.progress.events_handled(),
			passes: self.progress.passes(),
		}
	}

	/// Open the site sessions and spawn the worker. Connection failures are
	/// returned and leave the loader stopped.
	pub async fn start(&self) -> Result<(), SyncError> {
		let mut lc = self.lifecycle.lock().await;
		if self.is_running() {
			info!("synchronizer is already running");
			return Ok(());
		}

		let Some(mut loader) = lc.loader.take() else {
			return Err(SyncError::Panicked(
				"event loader was lost when its worker crashed".to_string(),
			));
		};

		if let Err(e) = loader.initialize().await {
			lc.loader = Some(loader);
			error!("failed to start synchronizer: {}", e);
			return Err(e);
		}

		self.control.stop_requested.store(false, Ordering::Release);
		self.control.running.store(true, Ordering::Release);
		if let Some(m) = &self.metrics {
			m.running.set(1);
		}

		let control = Arc::clone(&self.control);
		let metrics = self.metrics.clone();
		lc.worker = Some(tokio::spawn(run(loader, control, metrics)));

		info!("synchronizer started");
		Ok(())
	}

	/// Request a stop and wait for the worker to finish its current pass.
	pub async fn stop(&self) {
		let mut lc = self.lifecycle.lock().await;
		if !self.is_running() {
			return;
		}

		info!("stopping synchronizer...");
		self.control.request_stop();

		if let Some(worker) = lc.worker.take() {
			match worker.await {
				Ok(loader) => lc.loader = Some(loader),
				Err(e) => error!("synchronizer worker ended abnormally: {}", e),
			}
		}

		self.control.running.store(false, Ordering::Release);
		if let Some(m) = &self.metrics {
			m.running.set(0);
		}
		info!("synchronizer stopped");
	}
}

impl<K: Connector> Drop for ThreadLoader<K> {
	fn drop(&mut self) {
		// Dropping cannot await the join; the worker exits after its pass.
		if self.is_running() {
			self.control.request_stop();
		}
	}
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
	if let Some(s) = payload.downcast_ref::<&str>() {
		s.to_string()
	} else if let Some(s) = payload.downcast_ref::<String>() {
		s.clone()
	} else {
		"unknown panic".to_string()
	}
}

async fn run<K: Connector>(
	mut loader: EventLoader<K>,
	control: Arc<Control>,
	metrics: Option<Arc<SyncMetrics>>,
) -> EventLoader<K> {
	info!("synchronizer loop started");
	let interval = loader.config().interval;
	let backoff = loader.config().recovery_backoff;
	let mut reconnect = false;

	while !control.stop_requested() {
		if reconnect {
			match loader.initialize().await {
				Ok(()) => reconnect = false,
				Err(e) => {
					warn!("reconnect failed, retrying in {:?}: {}", backoff, e);
					control.pause(backoff).await;
					continue;
				}
			}
		}

		let pass = AssertUnwindSafe(loader.process_events()).catch_unwind().await;
		let failure = match pass {
			Ok(Ok(report)) => {
				if let Some(m) = &metrics {
					m.passes_total.inc();
				}
				if report.found() > 0 {
					info!(
						"pass complete: {} events, {} failed",
						report.found(),
						report.failed()
					);
				}
				None
			}
			Ok(Err(e)) => Some(e),
			Err(payload) => Some(SyncError::Panicked(panic_message(payload.as_ref()))),
		};

		match failure {
			None => control.pause(interval).await,
			Some(e) => {
				error!("synchronization pass failed: {}", e);
				if let Some(m) = &metrics {
					m.pass_failures_total.inc();
				}
				reconnect = e.is_connection_lost() || matches!(e, SyncError::Panicked(_));
				control.pause(backoff).await;
			}
		}
	}

	info!("synchronizer loop finished");
	loader
}
