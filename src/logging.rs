use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use fern::colors::{Color, ColoredLevelConfig};
use log::Level;
use once_cell::sync::Lazy;

/// Number of formatted lines kept in memory for [`recent_logs`].
pub const RECENT_LOG_CAPACITY: usize = 1000;

static RECENT: Lazy<Mutex<VecDeque<String>>> =
	Lazy::new(|| Mutex::new(VecDeque::with_capacity(RECENT_LOG_CAPACITY)));

fn timestamp() -> impl std::fmt::Display {
	chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f")
}

fn remember(line: String) {
	let mut buf = match RECENT.lock() {
		Ok(b) => b,
		Err(poisoned) => poisoned.into_inner(),
	};
	if buf.len() == RECENT_LOG_CAPACITY {
		buf.pop_front();
	}
	buf.push_back(line);
}

/// Install the global logger: colored lines on stdout, plain lines into the
/// in-memory buffer and, when `log_dir` is given, into a daily file
/// `<log_dir>/events.log.YYYY-MM-DD`.
pub fn init_logging(level: Level, log_dir: Option<&Path>) -> anyhow::Result<()> {
	let colors = ColoredLevelConfig::new()
		.error(Color::Red)
		.warn(Color::Yellow)
		.info(Color::Green)
		.debug(Color::Blue)
		.trace(Color::BrightBlack);

	let stdout = fern::Dispatch::new()
		.format(move |out, message, record| {
			out.finish(format_args!(
				"{} [{}] {}: {}",
				timestamp(),
				colors.color(record.level()),
				record.target(),
				message
			))
		})
		.chain(std::io::stdout());

	let mut plain = fern::Dispatch::new()
		.format(|out, message, record| {
			out.finish(format_args!(
				"{} [{}] {}: {}",
				timestamp(),
				record.level(),
				record.target(),
				message
			))
		})
		.chain(fern::Output::call(|record| remember(record.args().to_string())));

	if let Some(dir) = log_dir {
		std::fs::create_dir_all(dir)
			.with_context(|| format!("failed to create log directory {}", dir.display()))?;
		let prefix = dir.join("events.log.");
		plain = plain.chain(fern::DateBased::new(prefix, "%Y-%m-%d"));
	}

	fern::Dispatch::new()
		.level(level.to_level_filter())
		// sqlx logs every statement at info
		.level_for("sqlx", log::LevelFilter::Warn)
		.chain(stdout)
		.chain(plain)
		.apply()
		.map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

	Ok(())
}

/// The last `count` formatted log lines, oldest first.
pub fn recent_logs(count: usize) -> Vec<String> {
	let buf = match RECENT.lock() {
		Ok(b) => b,
		Err(poisoned) => poisoned.into_inner(),
	};
	let skip = buf.len().saturating_sub(count);
	buf.iter().skip(skip).cloned().collect()
}

pub fn total_logs() -> usize {
	match RECENT.lock() {
		Ok(b) => b.len(),
		Err(poisoned) => poisoned.into_inner().len(),
	}
}
