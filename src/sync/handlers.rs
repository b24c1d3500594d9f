use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::info;

use super::site::SiteConnection;

/// Entity types replicated between the sites out of the box. Each one has a
/// `sync_<entity>_from_remote(source_dsn)` function on both databases.
pub const DEFAULT_ENTITIES: [&str; 7] = [
	"hub",
	"server",
	"nas_ip",
	"trunk",
	"pricelist",
	"tarif",
	"call_statistics",
];

/// Merges one entity type from a source site into `target`.
///
/// Implementations are retried unchanged after a failure, so the work they
/// trigger must be idempotent.
#[async_trait]
pub trait EventHandler: Send + Sync {
	/// Returns the number of rows synchronized.
	async fn apply(&self, target: &mut dyn SiteConnection, source_dsn: &str) -> Result<i64>;
}

/// Calls a stored procedure on the target that pulls from the source over
/// its connection string.
#[derive(Debug, Clone)]
pub struct RemoteProcedure {
	entity: String,
	procedure: String,
}

impl RemoteProcedure {
	pub fn new(entity: impl Into<String>, procedure: impl Into<String>) -> Self {
		Self {
			entity: entity.into(),
			procedure: procedure.into(),
		}
	}

	/// `sync_<entity>_from_remote`
	pub fn for_entity(entity: &str) -> Self {
		Self::new(entity, format!("sync_{entity}_from_remote"))
	}

	pub fn procedure(&self) -> &str {
		&self.procedure
	}
}

#[async_trait]
impl EventHandler for RemoteProcedure {
	async fn apply(&self, target: &mut dyn SiteConnection, source_dsn: &str) -> Result<i64> {
		let count = target.call_sync_procedure(&self.procedure, source_dsn).await?;
		info!("synced {} ({} records)", self.entity, count);
		Ok(count)
	}
}

/// Entity name to handler. Filled before the loader starts and read-only
/// afterwards.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
	handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
	pub fn empty() -> Self {
		Self::default()
	}

	/// Registry with a [`RemoteProcedure`] for every [`DEFAULT_ENTITIES`] entry.
	pub fn with_defaults() -> Self {
		DEFAULT_ENTITIES.iter().fold(Self::empty(), |reg, entity| {
			reg.register(*entity, RemoteProcedure::for_entity(entity))
		})
	}

	/// Add or replace the handler for `entity`.
	pub fn register(mut self, entity: impl Into<String>, handler: impl EventHandler + 'static) -> Self {
		self.handlers.insert(entity.into(), Arc::new(handler));
		self
	}

	pub fn get(&self, entity: &str) -> Option<Arc<dyn EventHandler>> {
		self.handlers.get(entity).cloned()
	}

	pub fn contains(&self, entity: &str) -> bool {
		self.handlers.contains_key(entity)
	}

	/// Registered entity names, sorted.
	pub fn entities(&self) -> Vec<&str> {
		let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
		names.sort_unstable();
		names
	}

	pub fn len(&self) -> usize {
		self.handlers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.handlers.is_empty()
	}
}

impl std::fmt::Debug for HandlerRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("HandlerRegistry")
			.field("entities", &self.entities())
			.finish()
	}
}

#[cfg(feature = "unit-tests")]
#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_cover_all_entities() {
		let reg = HandlerRegistry::with_defaults();
		assert_eq!(reg.len(), DEFAULT_ENTITIES.len());
		assert_eq!(
			reg.entities(),
			vec!["call_statistics", "hub", "nas_ip", "pricelist", "server", "tarif", "trunk"]
		);
		assert!(!reg.contains("unknown_entity"));
	}

	#[test]
	fn procedure_naming() {
		assert_eq!(
			RemoteProcedure::for_entity("call_statistics").procedure(),
			"sync_call_statistics_from_remote"
		);
	}
}
