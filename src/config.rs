//! Consolidated configuration.
//!
//! A single `Config` struct carries every tunable named in the external
//! interfaces: chunk size, compression threshold, batch size, concurrency
//! cap, retry policy, keepalive interval, and the default max file size.
//! Per-pair knobs (direction, conflict strategy, include/exclude patterns)
//! live on `SyncPair` (see `types.rs`) rather than here, since they vary per
//! relationship rather than per install.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_chunk_size() -> u64 {
	64 * 1024
}

fn default_compression_threshold() -> u64 {
	4 * 1024
}

fn default_compression_ratio_cutoff() -> f64 {
	0.90
}

fn default_max_batch_entries() -> usize {
	500
}

fn default_max_concurrent_transfers() -> usize {
	4
}

fn default_max_retries() -> u32 {
	5
}

fn default_retry_base_delay_ms() -> u64 {
	1000
}

fn default_ping_interval_ms() -> u64 {
	30_000
}

fn default_max_file_size_bytes() -> u64 {
	500 * 1024 * 1024
}

fn default_bdp_dir() -> PathBuf {
	PathBuf::from(".bdp")
}

/// Process-wide configuration for a BDP install.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
	/// On-disk root for the KV store and CAS blob tree.
	pub bdp_dir: PathBuf,

	/// Fixed chunk size in bytes (§4.4). Default 64 KiB.
	pub chunk_size: u64,

	/// Minimum chunk size eligible for compression attempts (§4.2).
	pub compression_threshold: u64,

	/// A compressed chunk is kept only if its size is strictly below this
	/// fraction of the original.
	pub compression_ratio_cutoff: f64,

	/// Maximum entries carried in one `INDEX_RESPONSE` batch.
	pub max_batch_entries: usize,

	/// Maximum simultaneous uploads+downloads per session.
	pub max_concurrent_transfers: usize,

	/// Maximum transient-failure retries before a session goes fatal.
	pub max_retries: u32,

	/// Base delay for exponential retry backoff.
	pub retry_base_delay_ms: u64,

	/// Keepalive PING interval.
	pub ping_interval_ms: u64,

	/// Default `maxFileSizeBytes` for a `SyncPair` that does not override it.
	pub default_max_file_size_bytes: u64,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			bdp_dir: default_bdp_dir(),
			chunk_size: default_chunk_size(),
			compression_threshold: default_compression_threshold(),
			compression_ratio_cutoff: default_compression_ratio_cutoff(),
			max_batch_entries: default_max_batch_entries(),
			max_concurrent_transfers: default_max_concurrent_transfers(),
			max_retries: default_max_retries(),
			retry_base_delay_ms: default_retry_base_delay_ms(),
			ping_interval_ms: default_ping_interval_ms(),
			default_max_file_size_bytes: default_max_file_size_bytes(),
		}
	}
}

impl Config {
	/// Retry delay for the n-th retry attempt (1-indexed), per
	/// `RETRY_BASE_DELAY_MS * 2^(n-1)`.
	pub fn retry_delay_ms(&self, attempt: u32) -> u64 {
		self.retry_base_delay_ms.saturating_mul(1u64 << attempt.saturating_sub(1))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_external_interfaces() {
		let cfg = Config::default();
		assert_eq!(cfg.chunk_size, 65536);
		assert_eq!(cfg.compression_threshold, 4096);
		assert_eq!(cfg.max_batch_entries, 500);
		assert_eq!(cfg.max_concurrent_transfers, 4);
		assert_eq!(cfg.max_retries, 5);
		assert_eq!(cfg.retry_base_delay_ms, 1000);
		assert_eq!(cfg.ping_interval_ms, 30_000);
		assert_eq!(cfg.default_max_file_size_bytes, 500 * 1024 * 1024);
	}

	#[test]
	fn retry_delay_doubles_each_attempt() {
		let cfg = Config::default();
		assert_eq!(cfg.retry_delay_ms(1), 1000);
		assert_eq!(cfg.retry_delay_ms(2), 2000);
		assert_eq!(cfg.retry_delay_ms(3), 4000);
	}

	#[test]
	fn round_trips_through_json() {
		let cfg = Config::default();
		let json = serde_json::to_string(&cfg).unwrap();
		let back: Config = serde_json::from_str(&json).unwrap();
		assert_eq!(cfg.chunk_size, back.chunk_size);
	}
}

// vim: ts=4
