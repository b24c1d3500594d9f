pub mod watcher;

pub use watcher::{ConfigSnapshot, ConfigWatcher};

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::Level;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// System-wide settings file, read first when present.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/billing-sync/billing-sync.json";

/// Connection and identity of one participating database site.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct SiteSettings {
	pub host: String,
	pub port: u16,
	pub database: String,
	pub user: String,
	pub password: String,
	pub site_id: i32,
}

impl SiteSettings {
	fn central() -> Self {
		Self {
			host: "127.0.0.1".to_string(),
			port: 5432,
			database: "central".to_string(),
			user: "postgres".to_string(),
			password: String::new(),
			site_id: 777,
		}
	}

	fn regional() -> Self {
		Self {
			database: "regional".to_string(),
			site_id: 159,
			..Self::central()
		}
	}

	/// Assemble a `postgresql://` URL for this site. User and password are
	/// percent-encoded by `Url`.
	pub fn connection_string(&self) -> Result<String, SettingsError> {
		let invalid = |what: &str| SettingsError::Invalid(format!("{what} for {}", self.host));

		let mut url = Url::parse("postgresql://localhost")
			.map_err(|e| SettingsError::Invalid(e.to_string()))?;
		url.set_host(Some(&self.host))
			.map_err(|e| SettingsError::Invalid(format!("bad host '{}': {e}", self.host)))?;
		url.set_port(Some(self.port))
			.map_err(|_| invalid("bad port"))?;
		url.set_username(&self.user)
			.map_err(|_| invalid("bad user"))?;
		if !self.password.is_empty() {
			url.set_password(Some(&self.password))
				.map_err(|_| invalid("bad password"))?;
		}
		url.set_path(&self.database);

		Ok(url.into())
	}
}

/// Runtime configuration for the synchronizer.
///
/// Values are layered (later wins): built-in defaults, the system file
/// `/etc/billing-sync/billing-sync.json`, the user config folder, an explicit
/// file passed on the command line, and finally environment variables
/// prefixed with `BSY_` (nested keys use `__`, e.g. `BSY_CENTRAL__HOST`).
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct Settings {
	pub sync_enabled: bool,
	pub sync_interval_seconds: i64,
	pub central: SiteSettings,
	pub regional: SiteSettings,
	/// Pause after a whole pass fails before the loop tries again.
	pub recovery_backoff_seconds: u64,
	/// Dead-letter an event after this many consecutive handler failures.
	/// `None` retries forever.
	pub max_event_attempts: Option<u32>,
	pub log_level: Level,
	pub log_dir: Option<String>,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			sync_enabled: true,
			sync_interval_seconds: 60,
			central: SiteSettings::central(),
			regional: SiteSettings::regional(),
			recovery_backoff_seconds: 5,
			max_event_attempts: None,
			log_level: Level::Info,
			log_dir: None,
		}
	}
}

impl Settings {
	pub fn validate(&self) -> Result<(), SettingsError> {
		for (name, site) in [("central", &self.central), ("regional", &self.regional)] {
			if site.host.trim().is_empty() {
				return Err(SettingsError::Invalid(format!("{name}.host is empty")));
			}
			if site.database.trim().is_empty() {
				return Err(SettingsError::Invalid(format!("{name}.database is empty")));
			}
			if site.site_id <= 0 {
				return Err(SettingsError::Invalid(format!(
					"{name}.site_id must be positive, got {}",
					site.site_id
				)));
			}
		}
		if self.central.site_id == self.regional.site_id {
			return Err(SettingsError::Invalid(format!(
				"central and regional share site_id {}",
				self.central.site_id
			)));
		}
		if self.max_event_attempts == Some(0) {
			return Err(SettingsError::Invalid(
				"max_event_attempts must be at least 1".to_string(),
			));
		}
		Ok(())
	}

	/// Derive the immutable synchronizer configuration. Returns `None` when
	/// synchronization is disabled or the interval is not positive.
	pub fn sync_config(&self) -> Result<Option<SyncConfig>, SettingsError> {
		if !self.sync_enabled || self.sync_interval_seconds <= 0 {
			return Ok(None);
		}
		self.validate()?;

		Ok(Some(SyncConfig {
			central_dsn: self.central.connection_string()?,
			regional_dsn: self.regional.connection_string()?,
			central_site_id: self.central.site_id,
			regional_site_id: self.regional.site_id,
			interval: Duration::from_secs(self.sync_interval_seconds as u64),
			recovery_backoff: Duration::from_secs(self.recovery_backoff_seconds),
			max_event_attempts: self.max_event_attempts,
		}))
	}

	/// Copy with both passwords masked, for display.
	pub fn redacted(&self) -> Self {
		let mut s = self.clone();
		for site in [&mut s.central, &mut s.regional] {
			if !site.password.is_empty() {
				site.password = "****".to_string();
			}
		}
		s
	}
}

/// Point-in-time synchronizer configuration. Built once from `Settings` and
/// never mutated; a reload produces a new value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
	pub central_dsn: String,
	pub regional_dsn: String,
	pub central_site_id: i32,
	pub regional_site_id: i32,
	pub interval: Duration,
	pub recovery_backoff: Duration,
	pub max_event_attempts: Option<u32>,
}

#[derive(Debug, Error)]
pub enum SettingsError {
	#[error("configuration error: {0}")]
	Config(#[from] ::config::ConfigError),
	#[error("invalid configuration: {0}")]
	Invalid(String),
}

pub fn load() -> Result<Settings, SettingsError> {
	load_from(None)
}

/// Load settings, additionally reading `path` when given. An explicitly
/// requested file must exist; the well-known locations are optional.
pub fn load_from(path: Option<&Path>) -> Result<Settings, SettingsError> {
	let mut builder = ::config::Config::builder()
		.add_source(::config::Config::try_from(&Settings::default())?)
		.add_source(::config::File::with_name(SYSTEM_CONFIG_PATH).required(false));

	if let Some(folder) = dirs::config_dir() {
		let user_config_path = folder.join("billing-sync").join("billing-sync.json");
		builder = builder.add_source(::config::File::from(user_config_path).required(false));
	}

	if let Some(p) = path {
		builder = builder.add_source(::config::File::from(PathBuf::from(p)).required(true));
	}

	builder = builder.add_source(
		::config::Environment::with_prefix("BSY")
			.prefix_separator("_")
			.separator("__")
			.try_parsing(true),
	);

	let cfg = builder.build()?;
	let mut s: Settings = cfg.try_deserialize()?;

	// Direct overrides for the flat keys; some launchers export these in
	// forms the layered source does not pick up.
	if let Ok(v) = std::env::var("BSY_SYNC_ENABLED") {
		match v.to_ascii_lowercase().as_str() {
			"true" | "1" | "yes" => s.sync_enabled = true,
			"false" | "0" | "no" => s.sync_enabled = false,
			_ => {}
		}
	}
	if let Ok(v) = std::env::var("BSY_SYNC_INTERVAL_SECONDS") {
		if let Ok(parsed) = v.parse::<i64>() {
			s.sync_interval_seconds = parsed;
		}
	}
	if let Ok(l) = std::env::var("BSY_LOG_LEVEL") {
		if !l.is_empty() {
			if let Ok(parsed) = l.parse::<Level>() {
				s.log_level = parsed;
			}
		}
	}

	Ok(s)
}
