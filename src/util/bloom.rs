//! Salted approximate presence set used when garbage-collecting mirror
//! trees (component C3).
//!
//! A Bloom filter's false positives would cause GC to skip collecting a
//! stale path. Salting every key with a value chosen fresh each run means
//! a path that survives one run's false positive is not guaranteed to
//! survive the next — so anything that's actually garbage eventually gets
//! collected. The salt must be random *per run*, never fixed at compile
//! time or reused across invocations.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use rand::RngCore;

const DEFAULT_BITS: usize = 1 << 20;
const HASH_COUNT: u32 = 7;

/// An approximate set with a small, bounded false-positive rate, salted
/// with 2 random bytes generated once at construction.
pub struct BloomSet {
	bits: Vec<u64>,
	nbits: usize,
	salt: [u8; 2],
}

impl BloomSet {
	pub fn new() -> Self {
		Self::with_capacity(DEFAULT_BITS)
	}

	pub fn with_capacity(bits: usize) -> Self {
		let mut salt = [0u8; 2];
		rand::thread_rng().fill_bytes(&mut salt);
		let nbits = bits.max(64);
		Self {
			bits: vec![0u64; nbits.div_ceil(64)],
			nbits,
			salt,
		}
	}

	pub fn add(&mut self, name: impl AsRef<[u8]>) {
		for idx in self.indices(name.as_ref()) {
			self.bits[idx / 64] |= 1 << (idx % 64);
		}
	}

	pub fn contains(&self, name: impl AsRef<[u8]>) -> bool {
		self.indices(name.as_ref())
			.all(|idx| self.bits[idx / 64] & (1 << (idx % 64)) != 0)
	}

	fn indices(&self, name: &[u8]) -> impl Iterator<Item = usize> + '_ {
		let len = self.nbits;
		(0..HASH_COUNT).map(move |i| {
			let mut hasher = DefaultHasher::new();
			self.salt.hash(&mut hasher);
			name.hash(&mut hasher);
			i.hash(&mut hasher);
			(hasher.finish() as usize) % len
		})
	}
}

impl Default for BloomSet {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn contains_added_members() {
		let mut set = BloomSet::new();
		set.add("rsync/host1/etc/passwd");
		set.add(b"rbd/pool/images/vm1".as_slice());
		assert!(set.contains("rsync/host1/etc/passwd"));
		assert!(set.contains(b"rbd/pool/images/vm1".as_slice()));
		assert!(!set.contains("never-added"));
	}

	#[test]
	fn salt_differs_between_instances() {
		// Not a strict guarantee, but with 2^16 possible salts, two fresh
		// sets colliding is vanishingly unlikely and would indicate the
		// RNG isn't being re-seeded per instance.
		let a = BloomSet::new();
		let b = BloomSet::new();
		assert_ne!(a.salt, b.salt, "salts should be independently random per run");
	}
}
