use thiserror::Error;

use super::event::Site;

/// Errors raised by the synchronizer.
///
/// Event-level failures (`UnknownHandler`, `Handler`) are logged by the
/// dispatcher and never escape a pass. Everything else aborts the pass or,
/// at startup, prevents the loader from starting.
#[derive(Debug, Error)]
pub enum SyncError {
	#[error("failed to connect to {site} database: {source}")]
	Connect {
		site: Site,
		#[source]
		source: sqlx::Error,
	},

	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("event loader used before initialize")]
	NotInitialized,

	#[error("event {0} has no registered handler")]
	UnknownHandler(String),

	#[error("handler for {event} v{version} failed: {source}")]
	Handler {
		event: String,
		version: i64,
		#[source]
		source: Box<dyn std::error::Error + Send + Sync>,
	},

	#[error("invalid procedure name '{0}'")]
	InvalidProcedure(String),

	#[error("synchronization pass panicked: {0}")]
	Panicked(String),
}

impl SyncError {
	/// Whether repeating the same operation later can succeed.
	pub fn is_retryable(&self) -> bool {
		matches!(
			self,
			SyncError::Connect { .. }
				| SyncError::Database(_)
				| SyncError::Handler { .. }
				| SyncError::Panicked(_)
		)
	}

	/// Whether the underlying session is likely gone and must be reopened.
	pub fn is_connection_lost(&self) -> bool {
		match self {
			SyncError::Connect { .. } => true,
			SyncError::Database(e) => matches!(
				e,
				sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed
			),
			_ => false,
		}
	}
}

#[cfg(feature = "unit-tests")]
#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classification() {
		let io = SyncError::Database(sqlx::Error::Io(std::io::Error::new(
			std::io::ErrorKind::ConnectionReset,
			"reset",
		)));
		assert!(io.is_retryable());
		assert!(io.is_connection_lost());

		let proto = SyncError::Database(sqlx::Error::Protocol("bad".into()));
		assert!(proto.is_retryable());
		assert!(!proto.is_connection_lost());

		let unknown = SyncError::UnknownHandler("mystery".into());
		assert!(!unknown.is_retryable());
		assert_eq!(unknown.to_string(), "event mystery has no registered handler");

		assert!(!SyncError::NotInitialized.is_retryable());
	}

	#[test]
	fn connect_error_names_site() {
		let e = SyncError::Connect {
			site: Site::Regional,
			source: sqlx::Error::PoolTimedOut,
		};
		assert!(e.to_string().starts_with("failed to connect to regional database"));
	}
}
