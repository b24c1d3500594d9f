use std::fmt;

use serde::Serialize;

/// One of the two databases taking part in synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Site {
	Central,
	Regional,
}

impl fmt::Display for Site {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Site::Central => f.write_str("central"),
			Site::Regional => f.write_str("regional"),
		}
	}
}

/// A pending row of a site's `event.queue` table.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow, Serialize)]
pub struct QueuedEvent {
	pub event_name: String,
	pub version: i64,
}

impl QueuedEvent {
	pub fn new(event_name: impl Into<String>, version: i64) -> Self {
		Self {
			event_name: event_name.into(),
			version,
		}
	}
}

/// Which way an event flows: read from the source site's queue, applied on
/// the target site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
	CentralToRegional,
	RegionalToCentral,
}

impl Direction {
	pub fn source(self) -> Site {
		match self {
			Direction::CentralToRegional => Site::Central,
			Direction::RegionalToCentral => Site::Regional,
		}
	}

	pub fn target(self) -> Site {
		match self {
			Direction::CentralToRegional => Site::Regional,
			Direction::RegionalToCentral => Site::Central,
		}
	}
}

impl fmt::Display for Direction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}->{}", self.source(), self.target())
	}
}

/// What happened to a single dispatched queue row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EventOutcome {
	/// Handler succeeded and the row was removed.
	Applied { rows: i64 },
	/// Another dispatch for the same entity was in flight; nothing done.
	Skipped,
	/// No handler is registered; the row was dropped.
	Unknown,
	/// Handler or delete failed; the row stays queued for the next pass.
	Failed,
	/// Retry limit exhausted; the row was dropped.
	DeadLettered,
}

/// Per-phase tally of dispatch outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhaseReport {
	pub found: usize,
	pub applied: usize,
	pub skipped: usize,
	pub unknown: usize,
	pub failed: usize,
	pub dead_lettered: usize,
	pub rows: i64,
}

impl PhaseReport {
	pub fn record(&mut self, outcome: EventOutcome) {
		match outcome {
			EventOutcome::Applied { rows } => {
				self.applied += 1;
				self.rows += rows;
			}
			EventOutcome::Skipped => self.skipped += 1,
			EventOutcome::Unknown => self.unknown += 1,
			EventOutcome::Failed => self.failed += 1,
			EventOutcome::DeadLettered => self.dead_lettered += 1,
		}
	}
}

/// Result of one complete pass over both queues.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
	pub central_to_regional: PhaseReport,
	pub regional_to_central: PhaseReport,
}

impl PassReport {
	pub fn found(&self) -> usize {
		self.central_to_regional.found + self.regional_to_central.found
	}

	pub fn failed(&self) -> usize {
		self.central_to_regional.failed + self.regional_to_central.failed
	}
}
