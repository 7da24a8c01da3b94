//! Retrieval bookkeeping helper for [`super::Archiver`] implementations
//! whose backend issues several range requests per archive and completes
//! them out of order. The AWS backend's rate-limited retrieval path
//! (`archive::aws::AwsArchiver::download_archives_throttled`) is one such
//! case: a single archive's bytes may be split across several Glacier
//! jobs, one per billing timeslot, and this tracks which archives are
//! fully and successfully retrieved.

use std::collections::{HashSet, VecDeque};

pub struct DownloadState {
	pub name: Option<String>,
	pub offset: u64,
	pub remaining: u64,
	pub size: u64,
	pub requests_done: bool,
	pub done: bool,

	pending: VecDeque<(String, u64)>,
	outstanding: std::collections::HashMap<String, u64>,
	failed: HashSet<String>,
}

impl DownloadState {
	pub fn new(items: impl IntoIterator<Item = (String, u64)>) -> Self {
		let mut state = Self {
			name: None,
			offset: 0,
			remaining: 0,
			size: 0,
			requests_done: false,
			done: false,
			pending: items.into_iter().collect(),
			outstanding: std::collections::HashMap::new(),
			failed: HashSet::new(),
		};
		state.next_item();
		state
	}

	fn next_item(&mut self) {
		match self.pending.pop_front() {
			Some((name, size)) => {
				self.offset = 0;
				self.remaining = size;
				self.size = size;
				self.outstanding.insert(name.clone(), 0);
				self.name = Some(name);
			}
			None => {
				self.name = None;
				self.offset = 0;
				self.remaining = 0;
				self.size = 0;
				self.requests_done = true;
			}
		}
	}

	/// Record that a retrieval request of `count` bytes was just made
	/// against the current item.
	pub fn requested(&mut self, count: u64) {
		assert!(count <= self.remaining);
		self.offset += count;
		self.remaining -= count;
		if let Some(name) = &self.name {
			*self.outstanding.get_mut(name).expect("current item is tracked") += 1;
		}
		if self.remaining == 0 {
			self.next_item();
		}
	}

	/// Record one failed response for `name`. Returns whether this is its
	/// first failure.
	pub fn response_failed(&mut self, name: &str) -> bool {
		let first = self.failed.insert(name.to_string());
		if self.name.as_deref() == Some(name) {
			self.next_item();
		}
		self.response_processed(name);
		first
	}

	/// Record one successful response for `name`. Returns whether `name`
	/// is now fully retrieved and successful.
	pub fn response_processed(&mut self, name: &str) -> bool {
		let count = self.outstanding.get_mut(name).expect("response for untracked item");
		assert!(*count > 0);
		*count -= 1;
		if self.name.as_deref() != Some(name) && *count == 0 {
			self.outstanding.remove(name);
			if self.name.is_none() && self.outstanding.is_empty() {
				self.done = true;
			}
			self.failed.remove(name).then_some(false).unwrap_or(true)
		} else {
			false
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn single_item_completes_without_failure() {
		let mut state = DownloadState::new([("a".to_string(), 100)]);
		assert_eq!(state.name.as_deref(), Some("a"));
		assert_eq!(state.remaining, 100);

		state.requested(100);
		assert!(state.requests_done);
		assert!(!state.done);

		let finished = state.response_processed("a");
		assert!(finished);
		assert!(state.done);
	}

	#[test]
	fn request_advances_to_next_item_when_current_exhausted() {
		let mut state = DownloadState::new([("a".to_string(), 10), ("b".to_string(), 20)]);
		state.requested(10);
		assert_eq!(state.name.as_deref(), Some("b"));
		assert_eq!(state.remaining, 20);
	}

	#[test]
	fn split_requests_within_one_item_do_not_advance_early() {
		let mut state = DownloadState::new([("a".to_string(), 10)]);
		state.requested(4);
		assert_eq!(state.name.as_deref(), Some("a"));
		assert_eq!(state.offset, 4);
		assert_eq!(state.remaining, 6);
		state.requested(6);
		assert!(state.requests_done);
	}

	#[test]
	fn response_failed_marks_item_failed_and_moves_on() {
		let mut state = DownloadState::new([("a".to_string(), 10), ("b".to_string(), 10)]);
		state.requested(10);
		let first = state.response_failed("a");
		assert!(first);
		// a second failure report for the same item is not "first" again
		let second = state.response_failed("a");
		assert!(!second);
	}

	#[test]
	fn empty_item_list_is_immediately_done_after_requests() {
		let state = DownloadState::new(std::iter::empty());
		assert!(state.name.is_none());
		assert!(state.requests_done);
	}
}
