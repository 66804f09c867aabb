//! Core data model: the persistent record types of §3.
//!
//! Everything here is plain data; behaviour lives in the components that
//! own each type (`store`, `cas`, `index`, `merkle`, `planner`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Stable 21-char opaque identifier for a device. Generated once per
/// install and persisted; see [`DeviceId::generate`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
	/// Generate a fresh 21-character opaque id.
	pub fn generate() -> Self {
		DeviceId(random_opaque_id(21))
	}
}

impl fmt::Display for DeviceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// 32-char opaque identifier for a sync relationship, generated by the
/// initiator and shared by both peers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PairId(pub String);

impl PairId {
	pub fn generate() -> Self {
		PairId(random_opaque_id(32))
	}
}

impl fmt::Display for PairId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

use std::fmt;

fn random_opaque_id(len: usize) -> String {
	use rand::Rng;
	const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
	let mut rng = rand::thread_rng();
	(0..len)
		.map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
		.collect()
}

/// DeviceId → monotonically increasing counter. Compared by the standard
/// CRDT dominance rule.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VectorClock(pub BTreeMap<DeviceId, u64>);

/// Result of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrder {
	/// Every key equal.
	Identical,
	/// `self` dominates `other`: `self[k] >= other[k]` for all k, strictly
	/// greater for at least one.
	Dominates,
	/// `other` dominates `self`.
	Dominated,
	/// Neither dominates; a genuine conflict.
	Concurrent,
}

impl VectorClock {
	pub fn new() -> Self {
		VectorClock(BTreeMap::new())
	}

	pub fn get(&self, device: &DeviceId) -> u64 {
		self.0.get(device).copied().unwrap_or(0)
	}

	/// Increment this clock's counter for `device` by one, returning the
	/// new value.
	pub fn increment(&mut self, device: &DeviceId) -> u64 {
		let counter = self.0.entry(device.clone()).or_insert(0);
		*counter += 1;
		*counter
	}

	/// Merge `other` into `self` by taking the pointwise maximum of every
	/// key (the standard vector-clock join).
	pub fn merge(&mut self, other: &VectorClock) {
		for (device, &count) in &other.0 {
			let entry = self.0.entry(device.clone()).or_insert(0);
			if count > *entry {
				*entry = count;
			}
		}
	}

	/// Compare `self` against `other` per the CRDT dominance rule of §3.
	pub fn compare(&self, other: &VectorClock) -> ClockOrder {
		let mut self_greater = false;
		let mut other_greater = false;

		let mut keys: std::collections::BTreeSet<&DeviceId> = self.0.keys().collect();
		keys.extend(other.0.keys());

		for device in keys {
			let a = self.get(device);
			let b = other.get(device);
			if a > b {
				self_greater = true;
			} else if b > a {
				other_greater = true;
			}
		}

		match (self_greater, other_greater) {
			(false, false) => ClockOrder::Identical,
			(true, false) => ClockOrder::Dominates,
			(false, true) => ClockOrder::Dominated,
			(true, true) => ClockOrder::Concurrent,
		}
	}
}

/// Per-pair record keyed by `(PairId, path)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
	/// Forward-slash relative path, no leading slash, no `.`/`..` segments.
	pub path: String,
	pub size: u64,
	/// Wall-clock last-modified at source, in milliseconds.
	pub mtime: i64,
	/// SHA-256 of the full file content, lowercase hex.
	pub hash: String,
	/// Ordered SHA-256 digests, one per fixed-size chunk.
	pub chunk_hashes: Vec<String>,
	pub tombstone: bool,
	pub vector_clock: VectorClock,
	pub device_id: DeviceId,
	/// Pair-local monotonically increasing sequence number.
	pub seq: u64,
}

impl FileEntry {
	/// Build a tombstone entry for `path`, inheriting the clock of the
	/// previous live revision (the caller is expected to have incremented
	/// it for this device already).
	pub fn tombstone(path: String, vector_clock: VectorClock, device_id: DeviceId, seq: u64) -> Self {
		FileEntry {
			hash: tombstone_sentinel_hash(&path),
			path,
			size: 0,
			mtime: 0,
			chunk_hashes: Vec::new(),
			tombstone: true,
			vector_clock,
			device_id,
			seq,
		}
	}
}

/// Deterministic sentinel hash for a tombstoned path: `SHA-256("__bdp_tombstone__:" + path)`.
pub fn tombstone_sentinel_hash(path: &str) -> String {
	use sha2::{Digest, Sha256};
	let mut hasher = Sha256::new();
	hasher.update(b"__bdp_tombstone__:");
	hasher.update(path.as_bytes());
	hex::encode(hasher.finalize())
}

/// Record keyed by `(PairId, nodePath)`, where `nodePath` is the directory
/// portion of a file path (empty string = tree root).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleNode {
	pub hash: String,
	/// Immediate child segment name → that child's hash.
	pub child_hashes: BTreeMap<String, String>,
}

impl MerkleNode {
	pub fn child_count(&self) -> usize {
		self.child_hashes.len()
	}
}

/// Per-pair Merkle/index summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRoot {
	pub root_hash: String,
	pub entry_count: u64,
	pub max_seq: u64,
	/// Stable identifier for this index lineage; changes only on full rebuild.
	pub index_id: String,
	/// Unix millis at which this root was computed.
	pub computed_at: i64,
	pub device_id: Option<DeviceId>,
}

impl IndexRoot {
	pub fn empty(device_id: DeviceId, now_ms: i64) -> Self {
		IndexRoot {
			root_hash: empty_node_hash(),
			entry_count: 0,
			max_seq: 0,
			index_id: random_opaque_id(21),
			computed_at: now_ms,
			device_id: Some(device_id),
		}
	}
}

/// The SHA-256 of the empty concatenation: the hash of a `MerkleNode` with
/// no children (an empty root).
pub fn empty_node_hash() -> String {
	use sha2::{Digest, Sha256};
	hex::encode(Sha256::new().finalize())
}

/// Record keyed by `hash`: metadata only, bytes live in CAS blob storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CasChunk {
	pub hash: String,
	pub original_size: u64,
	pub stored_size: u64,
	pub stored_compressed: bool,
	pub ref_count: u64,
	pub created_at: i64,
	pub last_accessed_at: i64,
}

/// Direction a `SyncPair` is permitted to move data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
	Bidirectional,
	UploadOnly,
	DownloadOnly,
}

impl Direction {
	pub fn allows_upload(&self) -> bool {
		matches!(self, Direction::Bidirectional | Direction::UploadOnly)
	}

	pub fn allows_download(&self) -> bool {
		matches!(self, Direction::Bidirectional | Direction::DownloadOnly)
	}
}

impl FromStr for Direction {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"bidirectional" => Ok(Direction::Bidirectional),
			"upload-only" => Ok(Direction::UploadOnly),
			"download-only" => Ok(Direction::DownloadOnly),
			other => Err(format!("unknown direction: {}", other)),
		}
	}
}

impl fmt::Display for Direction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Direction::Bidirectional => write!(f, "bidirectional"),
			Direction::UploadOnly => write!(f, "upload-only"),
			Direction::DownloadOnly => write!(f, "download-only"),
		}
	}
}

/// Resolution policy applied to an automatically-detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
	LastWriteWins,
	LocalWins,
	RemoteWins,
	Manual,
}

impl FromStr for ConflictStrategy {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"last-write-wins" => Ok(ConflictStrategy::LastWriteWins),
			"local-wins" => Ok(ConflictStrategy::LocalWins),
			"remote-wins" => Ok(ConflictStrategy::RemoteWins),
			"manual" => Ok(ConflictStrategy::Manual),
			other => Err(format!("unknown conflict strategy: {}", other)),
		}
	}
}

impl fmt::Display for ConflictStrategy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ConflictStrategy::LastWriteWins => write!(f, "last-write-wins"),
			ConflictStrategy::LocalWins => write!(f, "local-wins"),
			ConflictStrategy::RemoteWins => write!(f, "remote-wins"),
			ConflictStrategy::Manual => write!(f, "manual"),
		}
	}
}

/// The auto-resolution choice computed (or absent) for a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
	KeepLocal,
	KeepRemote,
	None,
}

/// Per-pair configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPair {
	pub pair_id: PairId,
	pub devices: Vec<DeviceId>,
	pub direction: Direction,
	pub conflict_strategy: ConflictStrategy,
	pub include_patterns: Vec<String>,
	pub exclude_patterns: Vec<String>,
	pub max_file_size_bytes: u64,
	pub last_synced_at: Option<i64>,
}

/// Record keyed by `(PairId, path)` tracking a detected conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
	pub path: String,
	pub local: FileEntry,
	pub remote: FileEntry,
	pub auto_resolution: Resolution,
	pub detected_at: i64,
	pub resolved_at: Option<i64>,
	pub applied_resolution: Option<Resolution>,
}

impl Conflict {
	pub fn is_resolved(&self) -> bool {
		self.resolved_at.is_some()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn clock_identical() {
		let mut a = VectorClock::new();
		a.0.insert(DeviceId("d1".into()), 3);
		let b = a.clone();
		assert_eq!(a.compare(&b), ClockOrder::Identical);
	}

	#[test]
	fn clock_dominates() {
		let mut a = VectorClock::new();
		a.0.insert(DeviceId("d1".into()), 3);
		let mut b = VectorClock::new();
		b.0.insert(DeviceId("d1".into()), 2);
		assert_eq!(a.compare(&b), ClockOrder::Dominates);
		assert_eq!(b.compare(&a), ClockOrder::Dominated);
	}

	#[test]
	fn clock_concurrent() {
		let mut a = VectorClock::new();
		a.0.insert(DeviceId("d1".into()), 2);
		let mut b = VectorClock::new();
		b.0.insert(DeviceId("d2".into()), 1);
		assert_eq!(a.compare(&b), ClockOrder::Concurrent);
	}

	#[test]
	fn clock_merge_is_pointwise_max() {
		let mut a = VectorClock::new();
		a.0.insert(DeviceId("d1".into()), 1);
		a.0.insert(DeviceId("d2".into()), 5);
		let mut b = VectorClock::new();
		b.0.insert(DeviceId("d1".into()), 3);
		b.0.insert(DeviceId("d2".into()), 2);
		a.merge(&b);
		assert_eq!(a.get(&DeviceId("d1".into())), 3);
		assert_eq!(a.get(&DeviceId("d2".into())), 5);
	}

	#[test]
	fn direction_allows() {
		assert!(Direction::Bidirectional.allows_upload());
		assert!(Direction::Bidirectional.allows_download());
		assert!(Direction::UploadOnly.allows_upload());
		assert!(!Direction::UploadOnly.allows_download());
		assert!(!Direction::DownloadOnly.allows_upload());
	}

	#[test]
	fn tombstone_entry_has_sentinel_hash() {
		let entry = FileEntry::tombstone(
			"a/b.txt".into(),
			VectorClock::new(),
			DeviceId("d1".into()),
			1,
		);
		assert!(entry.tombstone);
		assert_eq!(entry.size, 0);
		assert!(entry.chunk_hashes.is_empty());
		assert_eq!(entry.hash, tombstone_sentinel_hash("a/b.txt"));
	}

	#[test]
	fn device_and_pair_ids_have_expected_length() {
		assert_eq!(DeviceId::generate().0.len(), 21);
		assert_eq!(PairId::generate().0.len(), 32);
	}
}

// vim: ts=4
