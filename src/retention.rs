//! Pure date-tiered retention planner (component C6).
//!
//! `select_snapshots_to_remove` takes a snapshot set and three policy
//! windows and returns which snapshots should be deleted. It has no side
//! effects and does not read the clock itself — the caller supplies
//! `today` — which is what makes the "applying it twice is a no-op"
//! invariant in spec.md §8 straightforward to test.

use chrono::{Days, NaiveDate};

use crate::storage::Snapshot;

pub struct RetentionPolicy {
	pub duplicate_days: i64,
	pub daily_weeks: i64,
	pub weekly_months: i64,
}

impl Default for RetentionPolicy {
	fn default() -> Self {
		Self {
			duplicate_days: 14,
			daily_weeks: 8,
			weekly_months: 12,
		}
	}
}

/// Returns the subset of `snapshots` that should be removed under
/// `policy`, as of `today`. The oldest and newest snapshots are never in
/// the returned set.
pub fn select_snapshots_to_remove(
	snapshots: &[Snapshot],
	today: NaiveDate,
	policy: &RetentionPolicy,
) -> Vec<Snapshot> {
	if snapshots.is_empty() {
		return Vec::new();
	}

	let duplicate_thresh = today - Days::new(policy.duplicate_days.max(0) as u64);
	let daily_thresh = today - Days::new((policy.daily_weeks.max(0) * 7) as u64);
	let weekly_thresh = today - Days::new((policy.weekly_months.max(0) * 28) as u64);

	let mut sorted: Vec<Snapshot> = snapshots.to_vec();
	sorted.sort();

	// Phase 1: duplicate collapse, walking reverse-chronologically.
	let mut filtered: Vec<Snapshot> = Vec::new();
	let mut prev: Option<&Snapshot> = None;
	for cur in sorted.iter().rev() {
		let keep = match prev {
			None => true,
			Some(p) => p.date != cur.date || cur.date > duplicate_thresh,
		};
		if keep {
			filtered.push(cur.clone());
		}
		prev = Some(cur);
	}
	filtered.reverse();

	// Phase 2: tiered keep, walking chronologically over the phase-1
	// result.
	let keep_tier = |prev: Option<&Snapshot>, cur: &Snapshot| -> bool {
		let Some(prev) = prev else {
			return true; // anchor: oldest kept snapshot
		};
		if prev.date == cur.date {
			return true;
		}
		if cur.date > daily_thresh && prev.date != cur.date {
			return true;
		}
		if cur.date > weekly_thresh && (prev.iso_year != cur.iso_year || prev.iso_week != cur.iso_week) {
			return true;
		}
		if prev.month != cur.month {
			return true;
		}
		false
	};

	let mut to_remove: std::collections::HashSet<String> =
		snapshots.iter().map(|s| s.name.clone()).collect();
	let mut prev: Option<Snapshot> = None;
	for cur in &filtered {
		if keep_tier(prev.as_ref(), cur) {
			to_remove.remove(&cur.name);
		}
		prev = Some(cur.clone());
	}

	sorted
		.into_iter()
		.filter(|s| to_remove.contains(&s.name))
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn make_series(days: i64, today: NaiveDate) -> Vec<Snapshot> {
		(0..days)
			.map(|i| {
				let date = today - Days::new(i as u64);
				Snapshot::parse(&format!("{}-1", date.format("%Y%m%d"))).unwrap()
			})
			.collect()
	}

	#[test]
	fn oldest_and_newest_always_survive() {
		let today = NaiveDate::from_ymd_opt(2022, 6, 1).unwrap();
		let snaps = make_series(400, today);
		let policy = RetentionPolicy::default();
		let remove = select_snapshots_to_remove(&snaps, today, &policy);
		let removed_names: std::collections::HashSet<_> =
			remove.iter().map(|s| s.name.as_str()).collect();

		let newest = snaps.iter().max().unwrap();
		let oldest = snaps.iter().min().unwrap();
		assert!(!removed_names.contains(newest.name.as_str()));
		assert!(!removed_names.contains(oldest.name.as_str()));
	}

	#[test]
	fn idempotent_on_second_application() {
		let today = NaiveDate::from_ymd_opt(2022, 6, 1).unwrap();
		let snaps = make_series(400, today);
		let policy = RetentionPolicy::default();
		let removed = select_snapshots_to_remove(&snaps, today, &policy);
		let removed_names: std::collections::HashSet<_> =
			removed.iter().map(|s| s.name.clone()).collect();
		let remaining: Vec<Snapshot> = snaps
			.into_iter()
			.filter(|s| !removed_names.contains(&s.name))
			.collect();

		let second = select_snapshots_to_remove(&remaining, today, &policy);
		assert!(second.is_empty());
	}

	#[test]
	fn retains_duplicate_window_then_daily_then_weekly_then_monthly() {
		// One snapshot per day for 400 days, default policy (14/8/12).
		let today = NaiveDate::from_ymd_opt(2022, 6, 1).unwrap();
		let snaps = make_series(400, today);
		let policy = RetentionPolicy::default();
		let removed = select_snapshots_to_remove(&snaps, today, &policy);
		let kept: std::collections::HashSet<_> = snaps
			.iter()
			.map(|s| s.name.clone())
			.filter(|n| !removed.iter().any(|r| &r.name == n))
			.collect();

		// Within the duplicate window (last 14 days) everything (here, one
		// per day) survives.
		for i in 0..14 {
			let d = today - Days::new(i);
			let name = format!("{}-1", d.format("%Y%m%d"));
			assert!(kept.contains(&name), "day -{i} should survive");
		}
	}
}
