use async_trait::async_trait;
use log::debug;
use sqlx::{Connection, PgConnection};

use super::error::SyncError;
use super::event::{QueuedEvent, Site};

/// A live session with one site's database.
///
/// `target_site` selects rows of a multi-peer queue (the central one) that
/// are addressed to a given site; `None` reads or deletes without a site
/// filter.
#[async_trait]
pub trait SiteConnection: Send {
	/// Pending queue rows, ascending by `version`.
	async fn pending_events(&mut self, target_site: Option<i32>) -> Result<Vec<QueuedEvent>, SyncError>;

	/// Remove exactly the given row inside its own committed transaction.
	/// Returns the number of rows deleted.
	async fn delete_event(
		&mut self,
		event: &QueuedEvent,
		target_site: Option<i32>,
	) -> Result<u64, SyncError>;

	/// Run `procedure(source_dsn)` on this site inside a transaction and
	/// return the number of rows it reports as synchronized.
	async fn call_sync_procedure(&mut self, procedure: &str, source_dsn: &str) -> Result<i64, SyncError>;

	/// Ask this site to enqueue a full resync for `site_id`.
	async fn request_full_sync(&mut self, site_id: i32) -> Result<bool, SyncError>;
}

/// Opens [`SiteConnection`]s. Kept separate so the loader can reconnect and
/// tests can hand out in-memory sites.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
	type Conn: SiteConnection + 'static;

	async fn connect(&self, site: Site, dsn: &str) -> Result<Self::Conn, SyncError>;
}

/// Only plain SQL identifiers (optionally schema-qualified) may be spliced
/// into a statement.
pub fn is_valid_procedure_name(name: &str) -> bool {
	!name.is_empty()
		&& name.split('.').all(|part| {
			!part.is_empty()
				&& !part.starts_with(|c: char| c.is_ascii_digit())
				&& part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
		})
}

/// Postgres-backed site session over a single dedicated connection.
pub struct PgSite {
	conn: PgConnection,
}

impl PgSite {
	pub fn new(conn: PgConnection) -> Self {
		Self { conn }
	}
}

#[async_trait]
impl SiteConnection for PgSite {
	async fn pending_events(&mut self, target_site: Option<i32>) -> Result<Vec<QueuedEvent>, SyncError> {
		let rows = match target_site {
			Some(site_id) => {
				sqlx::query_as::<_, QueuedEvent>(
					"SELECT event_name, version FROM event.queue WHERE target_site_id = $1 ORDER BY version",
				)
				.bind(site_id)
				.fetch_all(&mut self.conn)
				.await?
			}
			None => {
				sqlx::query_as::<_, QueuedEvent>(
					"SELECT event_name, version FROM event.queue ORDER BY version",
				)
				.fetch_all(&mut self.conn)
				.await?
			}
		};
		Ok(rows)
	}

	async fn delete_event(
		&mut self,
		event: &QueuedEvent,
		target_site: Option<i32>,
	) -> Result<u64, SyncError> {
		let mut tx = self.conn.begin().await?;
		let res = match target_site {
			Some(site_id) => {
				sqlx::query(
					"DELETE FROM event.queue WHERE target_site_id = $1 AND event_name = $2 AND version = $3",
				)
				.bind(site_id)
				.bind(&event.event_name)
				.bind(event.version)
				.execute(&mut *tx)
				.await?
			}
			None => {
				sqlx::query("DELETE FROM event.queue WHERE event_name = $1 AND version = $2")
					.bind(&event.event_name)
					.bind(event.version)
					.execute(&mut *tx)
					.await?
			}
		};
		tx.commit().await?;
		Ok(res.rows_affected())
	}

	async fn call_sync_procedure(&mut self, procedure: &str, source_dsn: &str) -> Result<i64, SyncError> {
		if !is_valid_procedure_name(procedure) {
			return Err(SyncError::InvalidProcedure(procedure.to_string()));
		}
		// The function name cannot be bound; it is validated above. The
		// result is widened so both integer and bigint procedures decode.
		let sql = format!("SELECT {procedure}($1)::bigint");

		let mut tx = self.conn.begin().await?;
		let count: Option<i64> = sqlx::query_scalar(&sql)
			.bind(source_dsn)
			.fetch_one(&mut *tx)
			.await?;
		tx.commit().await?;

		debug!("{} returned {:?}", procedure, count);
		Ok(count.unwrap_or(0))
	}

	async fn request_full_sync(&mut self, site_id: i32) -> Result<bool, SyncError> {
		let ok: Option<bool> = sqlx::query_scalar("SELECT event.notify_all($1)")
			.bind(site_id)
			.fetch_one(&mut self.conn)
			.await?;
		Ok(ok.unwrap_or(false))
	}
}

/// Opens one `PgConnection` per site.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnector;

#[async_trait]
impl Connector for PgConnector {
	type Conn = PgSite;

	async fn connect(&self, site: Site, dsn: &str) -> Result<PgSite, SyncError> {
		let conn = PgConnection::connect(dsn)
			.await
			.map_err(|source| SyncError::Connect { site, source })?;
		Ok(PgSite::new(conn))
	}
}
