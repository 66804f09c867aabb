//! Sync planner (C6): diff local vs remote index using vector clocks,
//! produce a work plan, then apply size/glob filters and auto-resolve
//! conflicts per the pair's strategy.

use globset::{GlobBuilder, GlobSetBuilder};
use std::collections::HashMap;

use crate::types::{ClockOrder, Conflict, ConflictStrategy, Direction, FileEntry, Resolution, SyncPair};

/// Output of a single planning pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
	pub upload: Vec<String>,
	pub download: Vec<String>,
	pub conflicts: Vec<Conflict>,
	pub unchanged_count: u64,
}

/// Run the planner over the local and remote entry sets for `pair`.
/// `now_ms` stamps any conflicts that are detected.
pub fn plan(pair: &SyncPair, local: &[FileEntry], remote: &[FileEntry], now_ms: i64) -> Plan {
	let remote_by_path: HashMap<&str, &FileEntry> = remote.iter().map(|e| (e.path.as_str(), e)).collect();
	let local_by_path: HashMap<&str, &FileEntry> = local.iter().map(|e| (e.path.as_str(), e)).collect();

	let mut plan = Plan::default();

	for entry in local {
		match remote_by_path.get(entry.path.as_str()) {
			None => {
				if entry.tombstone {
					// remote never heard of it; nothing to do
				} else if pair.direction.allows_upload() {
					plan.upload.push(entry.path.clone());
				}
			}
			Some(remote_entry) => {
				if entry.hash == remote_entry.hash && entry.tombstone == remote_entry.tombstone {
					plan.unchanged_count += 1;
					continue;
				}

				match entry.vector_clock.compare(&remote_entry.vector_clock) {
					ClockOrder::Dominates => {
						if pair.direction.allows_upload() {
							plan.upload.push(entry.path.clone());
						}
					}
					ClockOrder::Dominated => {
						if pair.direction.allows_download() {
							plan.download.push(entry.path.clone());
						}
					}
					ClockOrder::Concurrent | ClockOrder::Identical => {
						plan.conflicts.push(build_conflict(pair, entry, remote_entry, now_ms));
					}
				}
			}
		}
	}

	for entry in remote {
		if local_by_path.contains_key(entry.path.as_str()) {
			continue;
		}
		if entry.tombstone {
			continue;
		}
		if pair.direction.allows_download() {
			plan.download.push(entry.path.clone());
		}
	}

	apply_filters(pair, &mut plan, local, remote);
	plan
}

fn build_conflict(pair: &SyncPair, local: &FileEntry, remote: &FileEntry, now_ms: i64) -> Conflict {
	let auto_resolution = auto_resolve(pair.conflict_strategy, local, remote);
	Conflict {
		path: local.path.clone(),
		local: local.clone(),
		remote: remote.clone(),
		auto_resolution,
		detected_at: now_ms,
		resolved_at: None,
		applied_resolution: None,
	}
}

/// Compute the auto-resolution for a conflict per the pair's strategy
/// (§4.6). `manual` always yields `Resolution::None` for user surfacing.
pub fn auto_resolve(strategy: ConflictStrategy, local: &FileEntry, remote: &FileEntry) -> Resolution {
	match strategy {
		ConflictStrategy::LastWriteWins => {
			if remote.mtime > local.mtime {
				Resolution::KeepRemote
			} else {
				Resolution::KeepLocal
			}
		}
		ConflictStrategy::LocalWins => Resolution::KeepLocal,
		ConflictStrategy::RemoteWins => Resolution::KeepRemote,
		ConflictStrategy::Manual => Resolution::None,
	}
}

fn build_globset(patterns: &[String]) -> Option<globset::GlobSet> {
	if patterns.is_empty() {
		return None;
	}
	let mut builder = GlobSetBuilder::new();
	for pattern in patterns {
		// `literal_separator(true)` matches §4.6's glob syntax exactly: `*`
		// stops at `/`, only `**` crosses it.
		if let Ok(glob) = GlobBuilder::new(pattern).literal_separator(true).build() {
			builder.add(glob);
		}
	}
	builder.build().ok()
}

fn apply_filters(pair: &SyncPair, plan: &mut Plan, local: &[FileEntry], remote: &[FileEntry]) {
	let include = build_globset(&pair.include_patterns);
	let exclude = build_globset(&pair.exclude_patterns);

	let local_by_path: HashMap<&str, &FileEntry> = local.iter().map(|e| (e.path.as_str(), e)).collect();
	let remote_by_path: HashMap<&str, &FileEntry> = remote.iter().map(|e| (e.path.as_str(), e)).collect();

	let passes_glob = |path: &str, tombstone: bool| -> bool {
		// Tombstones always pass so deletes propagate.
		if tombstone {
			return true;
		}
		if let Some(ex) = &exclude {
			if ex.is_match(path) {
				return false;
			}
		}
		if let Some(inc) = &include {
			return inc.is_match(path);
		}
		true
	};

	let passes_size = |path: &str, source: &HashMap<&str, &FileEntry>| -> bool {
		source.get(path).map(|e| e.size <= pair.max_file_size_bytes).unwrap_or(true)
	};

	plan.upload.retain(|path| {
		let tombstone = local_by_path.get(path.as_str()).map(|e| e.tombstone).unwrap_or(false);
		passes_glob(path, tombstone)
	});

	plan.download.retain(|path| {
		let tombstone = remote_by_path.get(path.as_str()).map(|e| e.tombstone).unwrap_or(false);
		passes_size(path, &remote_by_path) && passes_glob(path, tombstone)
	});
}


// vim: ts=4
