use prometheus::{IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// Prometheus counters for the synchronizer.
pub struct SyncMetrics {
	registry: Registry,

	pub passes_total: IntCounter,
	pub pass_failures_total: IntCounter,
	pub events_applied_total: IntCounter,
	pub events_failed_total: IntCounter,
	pub events_unknown_total: IntCounter,
	pub events_dead_lettered_total: IntCounter,
	pub rows_synced_total: IntCounter,
	pub running: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
	let c = IntCounter::with_opts(Opts::new(name, help))?;
	registry.register(Box::new(c.clone()))?;
	Ok(c)
}

impl SyncMetrics {
	pub fn new() -> prometheus::Result<Self> {
		let registry = Registry::new();

		let passes_total = counter(
			&registry,
			"billing_sync_passes_total",
			"Completed synchronization passes",
		)?;
		let pass_failures_total = counter(
			&registry,
			"billing_sync_pass_failures_total",
			"Synchronization passes aborted by an error",
		)?;
		let events_applied_total = counter(
			&registry,
			"billing_sync_events_applied_total",
			"Queue events applied on the peer site and retired",
		)?;
		let events_failed_total = counter(
			&registry,
			"billing_sync_events_failed_total",
			"Queue events whose handler failed and were left for retry",
		)?;
		let events_unknown_total = counter(
			&registry,
			"billing_sync_events_unknown_total",
			"Queue events dropped because no handler is registered",
		)?;
		let events_dead_lettered_total = counter(
			&registry,
			"billing_sync_events_dead_lettered_total",
			"Queue events dropped after exhausting their retry limit",
		)?;
		let rows_synced_total = counter(
			&registry,
			"billing_sync_rows_synced_total",
			"Rows reported as merged by the remote procedures",
		)?;

		let running = IntGauge::with_opts(Opts::new(
			"billing_sync_running",
			"1 while the background synchronizer is running",
		))?;
		registry.register(Box::new(running.clone()))?;

		Ok(Self {
			registry,
			passes_total,
			pass_failures_total,
			events_applied_total,
			events_failed_total,
			events_unknown_total,
			events_dead_lettered_total,
			rows_synced_total,
			running,
		})
	}

	/// Encode metrics in Prometheus text format
	pub fn encode(&self) -> String {
		let encoder = TextEncoder::new();
		let metric_families = self.registry.gather();
		match encoder.encode_to_string(&metric_families) {
			Ok(s) => s,
			Err(e) => {
				log::error!("failed to encode metrics: {}", e);
				String::new()
			}
		}
	}
}
