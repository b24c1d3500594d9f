//! Common test utilities: an in-memory stand-in for the two site databases
//! and a scriptable handler, plus helpers for the Postgres-backed tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use billing_sync::config::SyncConfig;
use billing_sync::sync::{
	Connector, DEFAULT_ENTITIES, EventHandler, QueuedEvent, Site, SiteConnection, SyncError,
};
use tokio::time::sleep;

pub const CENTRAL_ID: i32 = 777;
pub const REGIONAL_ID: i32 = 159;
pub const CENTRAL_DSN: &str = "mem://central";
pub const REGIONAL_DSN: &str = "mem://regional";

pub fn sync_config(interval: Duration) -> SyncConfig {
	SyncConfig {
		central_dsn: CENTRAL_DSN.to_string(),
		regional_dsn: REGIONAL_DSN.to_string(),
		central_site_id: CENTRAL_ID,
		regional_site_id: REGIONAL_ID,
		interval,
		recovery_backoff: Duration::from_millis(50),
		max_event_attempts: None,
	}
}

fn injected(what: &str) -> SyncError {
	SyncError::Database(sqlx::Error::Protocol(format!("injected {what} failure")))
}

#[derive(Debug, Clone)]
struct Row {
	event_name: String,
	version: i64,
	target_site_id: Option<i32>,
}

#[derive(Default)]
struct SiteState {
	queue: Vec<Row>,
	procedure_results: HashMap<String, Result<i64, String>>,
	procedure_calls: Vec<(String, String)>,
	fail_fetches: u32,
	fail_deletes: u32,
	fail_connect: bool,
	fetch_delay: Option<Duration>,
	notify_all_calls: Vec<i32>,
	next_version: i64,
}

/// Shared view of one in-memory site. Clones observe the same state.
#[derive(Clone, Default)]
pub struct MemorySiteHandle {
	state: Arc<Mutex<SiteState>>,
}

impl MemorySiteHandle {
	fn with<R>(&self, f: impl FnOnce(&mut SiteState) -> R) -> R {
		f(&mut self.state.lock().unwrap())
	}

	pub fn push_event(&self, event_name: &str, version: i64, target_site_id: Option<i32>) {
		self.with(|s| {
			s.next_version = s.next_version.max(version + 1);
			s.queue.push(Row {
				event_name: event_name.to_string(),
				version,
				target_site_id,
			})
		});
	}

	/// Remaining rows as `(event_name, version, target_site_id)`.
	pub fn rows(&self) -> Vec<(String, i64, Option<i32>)> {
		self.with(|s| {
			s.queue
				.iter()
				.map(|r| (r.event_name.clone(), r.version, r.target_site_id))
				.collect()
		})
	}

	pub fn is_empty(&self) -> bool {
		self.with(|s| s.queue.is_empty())
	}

	/// Lowest queued version of `event_name`, i.e. the row being applied
	/// while its handler runs.
	pub fn head_version(&self, event_name: &str) -> Option<i64> {
		self.with(|s| {
			s.queue
				.iter()
				.filter(|r| r.event_name == event_name)
				.map(|r| r.version)
				.min()
		})
	}

	pub fn set_procedure_result(&self, procedure: &str, result: Result<i64, String>) {
		self.with(|s| s.procedure_results.insert(procedure.to_string(), result));
	}

	pub fn procedure_calls(&self) -> Vec<(String, String)> {
		self.with(|s| s.procedure_calls.clone())
	}

	pub fn notify_all_calls(&self) -> Vec<i32> {
		self.with(|s| s.notify_all_calls.clone())
	}

	pub fn fail_next_fetches(&self, n: u32) {
		self.with(|s| s.fail_fetches = n);
	}

	pub fn fail_next_deletes(&self, n: u32) {
		self.with(|s| s.fail_deletes = n);
	}

	pub fn set_fail_connect(&self, fail: bool) {
		self.with(|s| s.fail_connect = fail);
	}

	pub fn set_fetch_delay(&self, delay: Option<Duration>) {
		self.with(|s| s.fetch_delay = delay);
	}
}

/// One open session against a [`MemorySiteHandle`].
pub struct MemorySite {
	handle: MemorySiteHandle,
}

#[async_trait]
impl SiteConnection for MemorySite {
	async fn pending_events(&mut self, target_site: Option<i32>) -> Result<Vec<QueuedEvent>, SyncError> {
		let delay = self.handle.with(|s| s.fetch_delay);
		if let Some(d) = delay {
			sleep(d).await;
		}
		self.handle.with(|s| {
			if s.fail_fetches > 0 {
				s.fail_fetches -= 1;
				return Err(injected("fetch"));
			}
			let mut rows: Vec<QueuedEvent> = s
				.queue
				.iter()
				.filter(|r| target_site.is_none() || r.target_site_id == target_site)
				.map(|r| QueuedEvent::new(r.event_name.clone(), r.version))
				.collect();
			rows.sort_by_key(|e| e.version);
			Ok(rows)
		})
	}

	async fn delete_event(
		&mut self,
		event: &QueuedEvent,
		target_site: Option<i32>,
	) -> Result<u64, SyncError> {
		self.handle.with(|s| {
			if s.fail_deletes > 0 {
				s.fail_deletes -= 1;
				return Err(injected("delete"));
			}
			let before = s.queue.len();
			s.queue.retain(|r| {
				!(r.event_name == event.event_name
					&& r.version == event.version
					&& (target_site.is_none() || r.target_site_id == target_site))
			});
			Ok((before - s.queue.len()) as u64)
		})
	}

	async fn call_sync_procedure(&mut self, procedure: &str, source_dsn: &str) -> Result<i64, SyncError> {
		self.handle.with(|s| {
			s.procedure_calls
				.push((procedure.to_string(), source_dsn.to_string()));
			match s.procedure_results.get(procedure) {
				Some(Ok(n)) => Ok(*n),
				Some(Err(msg)) => Err(SyncError::Database(sqlx::Error::Protocol(msg.clone()))),
				None => Ok(1),
			}
		})
	}

	async fn request_full_sync(&mut self, site_id: i32) -> Result<bool, SyncError> {
		self.handle.with(|s| {
			s.notify_all_calls.push(site_id);
			for entity in DEFAULT_ENTITIES {
				let version = s.next_version.max(1);
				s.next_version = version + 1;
				s.queue.push(Row {
					event_name: entity.to_string(),
					version,
					target_site_id: Some(site_id),
				});
			}
			Ok(true)
		})
	}
}

/// Hands out sessions on two shared in-memory sites.
#[derive(Clone, Default)]
pub struct MemoryConnector {
	central: MemorySiteHandle,
	regional: MemorySiteHandle,
	connects: Arc<AtomicUsize>,
}

impl MemoryConnector {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn central(&self) -> &MemorySiteHandle {
		&self.central
	}

	pub fn regional(&self) -> &MemorySiteHandle {
		&self.regional
	}

	pub fn connects(&self) -> usize {
		self.connects.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl Connector for MemoryConnector {
	type Conn = MemorySite;

	async fn connect(&self, site: Site, _dsn: &str) -> Result<MemorySite, SyncError> {
		let handle = match site {
			Site::Central => self.central.clone(),
			Site::Regional => self.regional.clone(),
		};
		if handle.with(|s| s.fail_connect) {
			return Err(SyncError::Connect {
				site,
				source: sqlx::Error::Io(std::io::Error::new(
					std::io::ErrorKind::ConnectionRefused,
					"connection refused",
				)),
			});
		}
		self.connects.fetch_add(1, Ordering::SeqCst);
		Ok(MemorySite { handle })
	}
}

/// Test double for an entity handler. It records the queued version it was
/// invoked for (read from the origin queue), merges idempotently into an
/// applied set, and can be told to fail or stall.
#[derive(Clone)]
pub struct ScriptedHandler {
	entity: String,
	origin: MemorySiteHandle,
	inner: Arc<Mutex<ScriptState>>,
	entered: Arc<AtomicUsize>,
}

#[derive(Default)]
struct ScriptState {
	invocations: Vec<Option<i64>>,
	applied: HashSet<i64>,
	fail_before_apply: u32,
	delay: Option<Duration>,
}

impl ScriptedHandler {
	pub fn new(entity: &str, origin: &MemorySiteHandle) -> Self {
		Self {
			entity: entity.to_string(),
			origin: origin.clone(),
			inner: Arc::new(Mutex::new(ScriptState::default())),
			entered: Arc::new(AtomicUsize::new(0)),
		}
	}

	pub fn fail_next(&self, n: u32) -> &Self {
		self.inner.lock().unwrap().fail_before_apply = n;
		self
	}

	pub fn with_delay(self, delay: Duration) -> Self {
		self.inner.lock().unwrap().delay = Some(delay);
		self
	}

	/// Versions observed per invocation, in call order.
	pub fn invocations(&self) -> Vec<Option<i64>> {
		self.inner.lock().unwrap().invocations.clone()
	}

	pub fn calls(&self) -> usize {
		self.entered.load(Ordering::SeqCst)
	}

	/// Distinct versions merged; retries of the same version merge once.
	pub fn applied(&self) -> Vec<i64> {
		let mut v: Vec<i64> = self.inner.lock().unwrap().applied.iter().copied().collect();
		v.sort_unstable();
		v
	}
}

#[async_trait]
impl EventHandler for ScriptedHandler {
	async fn apply(&self, _target: &mut dyn SiteConnection, _source_dsn: &str) -> anyhow::Result<i64> {
		self.entered.fetch_add(1, Ordering::SeqCst);
		let delay = self.inner.lock().unwrap().delay;
		if let Some(d) = delay {
			sleep(d).await;
		}

		let version = self.origin.head_version(&self.entity);
		let mut st = self.inner.lock().unwrap();
		st.invocations.push(version);
		if st.fail_before_apply > 0 {
			st.fail_before_apply -= 1;
			anyhow::bail!("injected transient failure for {}", self.entity);
		}
		if let Some(v) = version {
			st.applied.insert(v);
		}
		Ok(1)
	}
}

/// Check if Docker integration tests are enabled via environment variable.
pub fn is_docker_test_enabled() -> bool {
	env::var("RUN_DOCKER_INTEGRATION_TESTS").is_ok()
}

/// Skip the test with a message if Docker integration tests are not enabled.
pub fn check_docker_enabled() -> bool {
	if !is_docker_test_enabled() {
		eprintln!("Skipping Docker integration test; set RUN_DOCKER_INTEGRATION_TESTS=1 to enable");
		return false;
	}
	true
}

/// Wait for Postgres to accept connections with a maximum retry count.
pub async fn wait_for_postgres(connection_string: &str, max_retries: u32) -> Result<sqlx::PgPool, String> {
	let mut attempts = 0;
	loop {
		match sqlx::PgPool::connect(connection_string).await {
			Ok(pool) => return Ok(pool),
			Err(e) => {
				attempts += 1;
				if attempts >= max_retries {
					return Err(format!(
						"Postgres did not become ready after {} attempts: {}",
						max_retries, e
					));
				}
				sleep(Duration::from_secs(1)).await;
			}
		}
	}
}
