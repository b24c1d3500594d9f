use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, error, info, warn};

use super::active::ActiveEventSet;
use super::error::SyncError;
use super::event::{Direction, EventOutcome, PassReport, PhaseReport, QueuedEvent, Site};
use super::handlers::HandlerRegistry;
use super::site::{Connector, SiteConnection};
use crate::config::SyncConfig;
use crate::metrics::SyncMetrics;

/// Progress counters shared between the worker and status readers.
#[derive(Debug, Default)]
pub struct LoaderProgress {
	current_event: Mutex<Option<String>>,
	events_handled: AtomicU64,
	passes: AtomicU64,
}

impl LoaderProgress {
	/// Entity name of the most recently dispatched row.
	pub fn current_event(&self) -> Option<String> {
		self.current_event
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.clone()
	}

	/// Rows dispatched since the loader was created.
	pub fn events_handled(&self) -> u64 {
		self.events_handled.load(Ordering::Relaxed)
	}

	/// Passes completed without a pass-level error.
	pub fn passes(&self) -> u64 {
		self.passes.load(Ordering::Relaxed)
	}

	fn begin_event(&self, event_name: &str) {
		*self
			.current_event
			.lock()
			.unwrap_or_else(PoisonError::into_inner) = Some(event_name.to_string());
		self.events_handled.fetch_add(1, Ordering::Relaxed);
	}

	fn finish_pass(&self) {
		self.passes.fetch_add(1, Ordering::Relaxed);
	}
}

type AttemptKey = (Direction, String, i64);

/// Routes queue rows to their handlers and retires them.
///
/// Dispatch takes `&self` so that concurrent calls are possible; the
/// [`ActiveEventSet`] keeps two dispatches of the same entity name from
/// running at once.
pub struct EventDispatcher {
	handlers: HandlerRegistry,
	active: ActiveEventSet,
	max_attempts: Option<u32>,
	attempts: Mutex<HashMap<AttemptKey, u32>>,
	metrics: Option<Arc<SyncMetrics>>,
}

impl EventDispatcher {
	pub fn new(handlers: HandlerRegistry) -> Self {
		Self {
			handlers,
			active: ActiveEventSet::new(),
			max_attempts: None,
			attempts: Mutex::new(HashMap::new()),
			metrics: None,
		}
	}

	/// Drop a row after `limit` consecutive handler failures instead of
	/// retrying it forever.
	pub fn with_max_attempts(mut self, limit: Option<u32>) -> Self {
		self.max_attempts = limit;
		self
	}

	pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
		self.metrics = Some(metrics);
		self
	}

	pub fn handlers(&self) -> &HandlerRegistry {
		&self.handlers
	}

	pub fn active(&self) -> &ActiveEventSet {
		&self.active
	}

	/// Apply one queue row on `target`, then delete it from `origin`.
	///
	/// `queue_filter` is the `target_site_id` the row was read with, so the
	/// delete never touches a sibling row queued for another site. Errors are
	/// logged and folded into the returned outcome.
	pub async fn handle_event(
		&self,
		event: &QueuedEvent,
		direction: Direction,
		target: &mut dyn SiteConnection,
		origin: &mut dyn SiteConnection,
		source_dsn: &str,
		queue_filter: Option<i32>,
	) -> EventOutcome {
		let Some(_guard) = self.active.try_acquire(&event.event_name) else {
			debug!(
				"[{}] {} already in progress, skipping v{}",
				direction, event.event_name, event.version
			);
			return EventOutcome::Skipped;
		};

		let Some(handler) = self.handlers.get(&event.event_name) else {
			// No handler can ever succeed for this row; drop it so it does
			// not sit in the queue forever.
			if let Err(e) = origin.delete_event(event, queue_filter).await {
				error!(
					"[{}] failed to drop unhandled event {} v{}: {}",
					direction, event.event_name, event.version, e
				);
			}
			error!(
				"[{}] {}",
				direction,
				SyncError::UnknownHandler(event.event_name.clone())
			);
			self.count(|m| m.events_unknown_total.inc());
			return EventOutcome::Unknown;
		};

		let applied = match handler.apply(target, source_dsn).await {
			Ok(rows) => origin
				.delete_event(event, queue_filter)
				.await
				.map(|_| rows)
				.map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
			Err(e) => Err(e.into()),
		};

		match applied {
			Ok(rows) => {
				self.clear_attempts(direction, event);
				info!(
					"[{}] applied {} v{} ({} rows)",
					direction, event.event_name, event.version, rows
				);
				self.count(|m| {
					m.events_applied_total.inc();
					m.rows_synced_total.inc_by(rows.max(0) as u64);
				});
				EventOutcome::Applied { rows }
			}
			Err(source) => {
				let err = SyncError::Handler {
					event: event.event_name.clone(),
					version: event.version,
					source,
				};
				error!("[{}] {}", direction, err);
				self.count(|m| m.events_failed_total.inc());
				self.after_failure(event, direction, origin, queue_filter).await
			}
		}
	}

	async fn after_failure(
		&self,
		event: &QueuedEvent,
		direction: Direction,
		origin: &mut dyn SiteConnection,
		queue_filter: Option<i32>,
	) -> EventOutcome {
		let Some(limit) = self.max_attempts else {
			return EventOutcome::Failed;
		};

		let key = (direction, event.event_name.clone(), event.version);
		let attempts = {
			let mut map = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
			let n = map.entry(key.clone()).or_insert(0);
			*n += 1;
			*n
		};
		if attempts < limit {
			return EventOutcome::Failed;
		}

		match origin.delete_event(event, queue_filter).await {
			Ok(_) => {
				self.attempts
					.lock()
					.unwrap_or_else(PoisonError::into_inner)
					.remove(&key);
				error!(
					"[{}] dead-lettered {} v{} after {} failed attempts",
					direction, event.event_name, event.version, attempts
				);
				self.count(|m| m.events_dead_lettered_total.inc());
				EventOutcome::DeadLettered
			}
			Err(e) => {
				warn!(
					"[{}] could not dead-letter {} v{}: {}",
					direction, event.event_name, event.version, e
				);
				EventOutcome::Failed
			}
		}
	}

	fn clear_attempts(&self, direction: Direction, event: &QueuedEvent) {
		if self.max_attempts.is_none() {
			return;
		}
		self.attempts
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(&(direction, event.event_name.clone(), event.version));
	}

	/// Consecutive failures recorded for a row, when a retry limit is set.
	pub fn attempts(&self, direction: Direction, event: &QueuedEvent) -> u32 {
		self.attempts
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.get(&(direction, event.event_name.clone(), event.version))
			.copied()
			.unwrap_or(0)
	}

	fn count(&self, f: impl FnOnce(&SyncMetrics)) {
		if let Some(m) = &self.metrics {
			f(m);
		}
	}
}

/// Synchronization engine: owns one session per site and drains both
/// queues in version order.
pub struct EventLoader<K: Connector> {
	config: SyncConfig,
	connector: K,
	central: Option<K::Conn>,
	regional: Option<K::Conn>,
	dispatcher: EventDispatcher,
	progress: Arc<LoaderProgress>,
}

impl<K: Connector> EventLoader<K> {
	/// Loader with the default [`HandlerRegistry`].
	pub fn new(config: SyncConfig, connector: K) -> Self {
		Self::with_handlers(config, connector, HandlerRegistry::with_defaults())
	}

	pub fn with_handlers(config: SyncConfig, connector: K, handlers: HandlerRegistry) -> Self {
		let dispatcher = EventDispatcher::new(handlers).with_max_attempts(config.max_event_attempts);
		Self {
			config,
			connector,
			central: None,
			regional: None,
			dispatcher,
			progress: Arc::new(LoaderProgress::default()),
		}
	}

	pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
		self.dispatcher = self.dispatcher.with_metrics(metrics);
		self
	}

	pub fn config(&self) -> &SyncConfig {
		&self.config
	}

	pub fn dispatcher(&self) -> &EventDispatcher {
		&self.dispatcher
	}

	pub fn progress(&self) -> Arc<LoaderProgress> {
		Arc::clone(&self.progress)
	}

	pub fn is_initialized(&self) -> bool {
		self.central.is_some() && self.regional.is_some()
	}

	pub fn current_event(&self) -> Option<String> {
		self.progress.current_event()
	}

	pub fn events_handled(&self) -> u64 {
		self.progress.events_handled()
	}

	/// Open both site sessions. Fails if either database is unreachable, in
	/// which case no session is kept. Calling it again replaces the
	/// sessions, which is how the worker recovers a lost connection.
	pub async fn initialize(&mut self) -> Result<(), SyncError> {
		self.central = None;
		self.regional = None;

		let central = self
			.connector
			.connect(Site::Central, &self.config.central_dsn)
			.await
			.inspect_err(|e| error!("failed to initialize event loader: {}", e))?;
		info!("connected to central database");

		let regional = self
			.connector
			.connect(Site::Regional, &self.config.regional_dsn)
			.await
			.inspect_err(|e| error!("failed to initialize event loader: {}", e))?;
		info!("connected to regional database");

		self.central = Some(central);
		self.regional = Some(regional);
		info!(
			"event loader initialized ({} handlers)",
			self.dispatcher.handlers().len()
		);
		Ok(())
	}

	/// One synchronization pass: central to regional, then regional to
	/// central. An error here means the pass as a whole failed; individual
	/// event failures are reported in the returned [`PassReport`].
	pub async fn process_events(&mut self) -> Result<PassReport, SyncError> {
		let (Some(central), Some(regional)) = (self.central.as_mut(), self.regional.as_mut()) else {
			return Err(SyncError::NotInitialized);
		};

		let central_to_regional = run_phase(
			&self.dispatcher,
			&self.progress,
			Direction::CentralToRegional,
			central,
			regional,
			&self.config.central_dsn,
			Some(self.config.regional_site_id),
		)
		.await?;

		// the regional queue has a single peer, so it is read unfiltered
		let regional_to_central = run_phase(
			&self.dispatcher,
			&self.progress,
			Direction::RegionalToCentral,
			regional,
			central,
			&self.config.regional_dsn,
			None,
		)
		.await?;

		self.progress.finish_pass();
		Ok(PassReport {
			central_to_regional,
			regional_to_central,
		})
	}
}

async fn run_phase<C: SiteConnection>(
	dispatcher: &EventDispatcher,
	progress: &LoaderProgress,
	direction: Direction,
	origin: &mut C,
	target: &mut C,
	source_dsn: &str,
	queue_filter: Option<i32>,
) -> Result<PhaseReport, SyncError> {
	let events = origin.pending_events(queue_filter).await?;

	let mut report = PhaseReport {
		found: events.len(),
		..PhaseReport::default()
	};
	if events.is_empty() {
		return Ok(report);
	}
	info!("[{}] found {} events", direction, events.len());

	for event in &events {
		progress.begin_event(&event.event_name);
		let outcome = dispatcher
			.handle_event(event, direction, target, origin, source_dsn, queue_filter)
			.await;
		report.record(outcome);
	}

	if report.failed > 0 {
		warn!(
			"[{}] {} of {} events failed and stay queued",
			direction, report.failed, report.found
		);
	}
	Ok(report)
}
