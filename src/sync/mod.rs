pub mod active;
pub mod error;
pub mod event;
pub mod handlers;
pub mod loader;
pub mod site;
pub mod thread_loader;
pub mod trigger;

pub use active::{ActiveEventGuard, ActiveEventSet};
pub use error::SyncError;
pub use event::{Direction, EventOutcome, PassReport, PhaseReport, QueuedEvent, Site};
pub use handlers::{DEFAULT_ENTITIES, EventHandler, HandlerRegistry, RemoteProcedure};
pub use loader::{EventDispatcher, EventLoader, LoaderProgress};
pub use site::{Connector, PgConnector, PgSite, SiteConnection};
pub use thread_loader::{LoaderStatus, ThreadLoader};
pub use trigger::trigger_full_sync;

pub use crate::config::SyncConfig;
