use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Names of the entities whose handler is currently executing.
///
/// A name is a member strictly between [`try_acquire`](Self::try_acquire)
/// and the drop of the returned guard, on every exit path.
#[derive(Debug, Clone, Default)]
pub struct ActiveEventSet {
	inner: Arc<Mutex<HashSet<String>>>,
}

impl ActiveEventSet {
	pub fn new() -> Self {
		Self::default()
	}

	fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
		self.inner.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Mark `event_name` active. Returns `None` if it already is.
	pub fn try_acquire(&self, event_name: &str) -> Option<ActiveEventGuard> {
		if !self.lock().insert(event_name.to_string()) {
			return None;
		}
		Some(ActiveEventGuard {
			set: self.clone(),
			event_name: event_name.to_string(),
		})
	}

	pub fn contains(&self, event_name: &str) -> bool {
		self.lock().contains(event_name)
	}

	pub fn len(&self) -> usize {
		self.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.lock().is_empty()
	}
}

/// Removes its entity name from the set when dropped.
#[derive(Debug)]
pub struct ActiveEventGuard {
	set: ActiveEventSet,
	event_name: String,
}

impl ActiveEventGuard {
	pub fn event_name(&self) -> &str {
		&self.event_name
	}
}

impl Drop for ActiveEventGuard {
	fn drop(&mut self) {
		self.set.lock().remove(&self.event_name);
	}
}
