use std::{
	collections::VecDeque,
	sync::Arc,
	time::{Duration, SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::stream::Stream;

struct Entry {
	identifier: String,
	stream:     Arc<Stream>,
	parked:     CancellationToken,
}

/// Ordered table of identifier -> pending stream. Identifiers are one-shot:
/// the first `pop` consumes the entry. A bounded registry evicts (and
/// closes) its oldest entry on overflow.
pub struct Registry {
	max_size: usize,
	entries:  Mutex<VecDeque<Entry>>,
}

impl Registry {
	pub fn new() -> Self {
		Self::bounded(0)
	}

	/// `max_size` of zero means unbounded.
	pub fn bounded(max_size: usize) -> Self {
		Self {
			max_size,
			entries: Mutex::new(VecDeque::new()),
		}
	}

	/// Mints a fresh identifier and appends the stream under it. Minting and
	/// insertion happen under one lock, so an identifier is never observable
	/// before its entry exists.
	pub fn register(&self, stream: Arc<Stream>) -> String {
		let identifier = new_identifier();
		let mut entries = self.entries.lock();
		entries.push_back(Entry {
			identifier: identifier.clone(),
			stream,
			parked: CancellationToken::new(),
		});
		while self.max_size > 0 && entries.len() > self.max_size {
			if let Some(evicted) = entries.pop_front() {
				evicted.parked.cancel();
				evicted.stream.close();
			}
		}
		identifier
	}

	/// Removes and returns the entry in one step; cancels its parking timer.
	pub fn pop(&self, identifier: &str) -> Option<Arc<Stream>> {
		let mut entries = self.entries.lock();
		let index = entries.iter().position(|entry| entry.identifier == identifier)?;
		let entry = entries.remove(index)?;
		entry.parked.cancel();
		Some(entry.stream)
	}

	/// Waits out the parking window for `identifier`. If the entry is still
	/// registered when the window expires it is popped and its stream
	/// closed; a `pop` in the meantime ends the wait early.
	pub async fn park(&self, identifier: &str, timeout: Duration) {
		let parked = {
			let entries = self.entries.lock();
			match entries.iter().find(|entry| entry.identifier == identifier) {
				Some(entry) => entry.parked.clone(),
				None => return,
			}
		};
		tokio::select! {
			_ = parked.cancelled() => {}
			_ = tokio::time::sleep(timeout) => {
				if let Some(stream) = self.pop(identifier) {
					stream.close();
				}
			}
		}
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.lock().is_empty()
	}
}

impl Default for Registry {
	fn default() -> Self {
		Self::new()
	}
}

fn new_identifier() -> String {
	let nanos = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|elapsed| elapsed.as_nanos())
		.unwrap_or_default();
	format!("{}.{}", Uuid::new_v4().simple(), nanos)
}
