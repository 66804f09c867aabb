//! File index operations and change detection against a `FolderSource`
//! (C4 / §4.3).

use crate::chunking::hash_content;
use crate::error::StoreError;
use crate::store::Store;
use crate::types::{DeviceId, FileEntry, VectorClock};

/// A scanned file as reported by a `FolderSource`, prior to hashing.
#[derive(Debug, Clone)]
pub struct ScannedFile {
	pub path: String,
	pub size: u64,
	pub mtime: i64,
}

/// Outcome of comparing a scan against the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
	pub added: Vec<String>,
	pub modified: Vec<String>,
	pub deleted: Vec<String>,
}

/// Apply the decision table of §4.3: for each currently-present file,
/// decide whether its content needs (re-)hashing. `hash_needed` collects
/// the subset of `scan` that the caller must hash (via `hashChunks`) before
/// calling [`apply_change`].
pub fn detect_changes(store: &Store, pair_id: &str, scan: &[ScannedFile]) -> Result<ChangeSet, StoreError> {
	let mut added = Vec::new();
	let mut modified = Vec::new();

	let scanned_paths: std::collections::HashSet<&str> = scan.iter().map(|f| f.path.as_str()).collect();

	for file in scan {
		match store.get_entry(pair_id, &file.path)? {
			None => added.push(file.path.clone()),
			Some(existing) if existing.tombstone => added.push(file.path.clone()),
			Some(existing) => {
				if existing.size == file.size && existing.mtime == file.mtime {
					// skip: assumed unchanged, no hash
					continue;
				}
				// size or mtime differs: caller must hash and compare;
				// flagged here as a candidate, final added/modified/skip
				// decision depends on the hash, see `finish_modified_check`.
				modified.push(file.path.clone());
			}
		}
	}

	let mut deleted = Vec::new();
	for entry in store.live_entries(pair_id)? {
		if !scanned_paths.contains(entry.path.as_str()) {
			deleted.push(entry.path);
		}
	}

	Ok(ChangeSet { added, modified, deleted })
}

/// For a path flagged as a modification candidate by [`detect_changes`],
/// decide whether the freshly computed `new_hash` actually differs from
/// the stored one. Returns `true` if the entry should be updated.
pub fn is_actually_modified(store: &Store, pair_id: &str, path: &str, new_hash: &str) -> Result<bool, StoreError> {
	match store.get_entry(pair_id, path)? {
		Some(existing) => Ok(existing.hash != new_hash),
		None => Ok(true),
	}
}

/// Build (but do not persist) the `FileEntry` for a freshly hashed file,
/// stamping the next `seq` for the pair and bumping this device's vector
/// clock counter.
pub fn build_entry(
	store: &Store,
	pair_id: &str,
	device_id: &DeviceId,
	path: String,
	size: u64,
	mtime: i64,
	content: &[u8],
	chunk_size: u64,
	previous_clock: Option<VectorClock>,
) -> Result<FileEntry, StoreError> {
	let hashed = hash_content(content, chunk_size);
	let mut clock = previous_clock.unwrap_or_default();
	clock.increment(device_id);
	let seq = store.max_seq(pair_id)? + 1;

	Ok(FileEntry {
		path,
		size,
		mtime,
		hash: hashed.whole_hash,
		chunk_hashes: hashed.chunk_hashes,
		tombstone: false,
		vector_clock: clock,
		device_id: device_id.clone(),
		seq,
	})
}

/// Build a tombstone entry for a path that disappeared from the scan.
pub fn build_tombstone(store: &Store, pair_id: &str, device_id: &DeviceId, path: String) -> Result<FileEntry, StoreError> {
	let existing = store.get_entry(pair_id, &path)?;
	let mut clock = existing.map(|e| e.vector_clock).unwrap_or_default();
	clock.increment(device_id);
	let seq = store.max_seq(pair_id)? + 1;
	Ok(FileEntry::tombstone(path, clock, device_id.clone(), seq))
}


// vim: ts=4
