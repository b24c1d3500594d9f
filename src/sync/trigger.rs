use anyhow::{Context, Result, bail};
use log::{info, warn};

use super::event::Site;
use super::site::{Connector, SiteConnection};

/// Ask the central database to enqueue every entity for `site_id`, forcing a
/// full resync of that site on the following passes. Returns what
/// `event.notify_all` reported.
pub async fn trigger_full_sync<K: Connector>(connector: &K, central_dsn: &str, site_id: i32) -> Result<bool> {
	if site_id <= 0 {
		bail!("site_id must be positive, got {}", site_id);
	}

	let mut central = connector
		.connect(Site::Central, central_dsn)
		.await
		.context("failed to connect to central database")?;

	let ok = central
		.request_full_sync(site_id)
		.await
		.with_context(|| format!("event.notify_all({site_id}) failed"))?;

	if ok {
		info!("full synchronization requested for site {}", site_id);
	} else {
		warn!("event.notify_all({}) returned false", site_id);
	}
	Ok(ok)
}
