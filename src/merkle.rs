//! Incremental Merkle tree over the file index (C5).
//!
//! Tree shape mirrors the directory structure of paths. The node hash
//! depends on *sorted* child iteration order — `MerkleNode.child_hashes`
//! is a `BTreeMap`, so this falls out of the type rather than needing an
//! explicit sort at hash time, but the hashing step below still sorts
//! explicitly to make the dependency visible at the call site.

use sha2::{Digest, Sha256};

use crate::error::StoreError;
use crate::store::Store;
use crate::types::{tombstone_sentinel_hash, FileEntry, IndexRoot, MerkleNode};

/// Leaf hash for a file entry: its content hash if live, or the tombstone
/// sentinel if deleted.
pub fn leaf_hash(entry: &FileEntry) -> String {
	if entry.tombstone {
		tombstone_sentinel_hash(&entry.path)
	} else {
		entry.hash.clone()
	}
}

/// Hash a node's children: sort by segment name, concatenate the hex
/// hashes in that order, SHA-256 the result.
pub fn hash_children(child_hashes: &std::collections::BTreeMap<String, String>) -> String {
	let mut hasher = Sha256::new();
	// BTreeMap already iterates in sorted key order.
	for (_, hash) in child_hashes.iter() {
		hasher.update(hash.as_bytes());
	}
	hex::encode(hasher.finalize())
}

fn split_parent(path: &str) -> (String, String) {
	match path.rfind('/') {
		Some(idx) => (path[..idx].to_string(), path[idx + 1..].to_string()),
		None => (String::new(), path.to_string()),
	}
}

/// Incrementally apply a live/tombstoned update for `entry`, walking the
/// node chain from its parent up to the root, and persisting the new
/// `IndexRoot`.
pub fn update_entry(store: &Store, pair_id: &str, entry: &FileEntry, device_id_if_new_root: &crate::types::DeviceId, now_ms: i64) -> Result<(), StoreError> {
	store.put_entry(entry, pair_id)?;

	let leaf = leaf_hash(entry);
	let (mut node_path, mut segment) = split_parent(&entry.path);

	let mut child_hash = leaf;
	loop {
		let mut node = store.get_node(pair_id, &node_path)?.unwrap_or_default();
		node.child_hashes.insert(segment.clone(), child_hash.clone());
		node.hash = hash_children(&node.child_hashes);
		store.put_node(pair_id, &node_path, &node)?;
		child_hash = node.hash.clone();

		if node_path.is_empty() {
			break;
		}
		let (next_parent, next_segment) = split_parent(&node_path);
		node_path = next_parent;
		segment = next_segment;
	}

	persist_root(store, pair_id, &child_hash, device_id_if_new_root, now_ms)
}

/// Remove `path`'s leaf from its parent, cascading empty-node deletion up
/// toward the root, which always remains (possibly empty).
pub fn remove_entry(store: &Store, pair_id: &str, path: &str, device_id_if_new_root: &crate::types::DeviceId, now_ms: i64) -> Result<(), StoreError> {
	store.delete_entry(pair_id, path)?;

	let (mut node_path, mut segment) = split_parent(path);
	let mut root_hash = crate::types::empty_node_hash();
	let mut first = true;

	loop {
		let node = store.get_node(pair_id, &node_path)?;
		let mut node = match node {
			Some(n) => n,
			None => break,
		};
		node.child_hashes.remove(&segment);

		if node.child_hashes.is_empty() && !node_path.is_empty() {
			store.delete_node(pair_id, &node_path)?;
			let (next_parent, next_segment) = split_parent(&node_path);
			node_path = next_parent;
			segment = next_segment;
			first = false;
			continue;
		}

		node.hash = hash_children(&node.child_hashes);
		store.put_node(pair_id, &node_path, &node)?;
		root_hash = node.hash.clone();
		first = false;

		if node_path.is_empty() {
			break;
		}
		let (next_parent, next_segment) = split_parent(&node_path);
		node_path = next_parent;
		segment = next_segment;
	}

	if first {
		// The root itself had no entry under this path; leave root as-is.
		if let Some(root_node) = store.get_node(pair_id, "")? {
			root_hash = root_node.hash;
		}
	}

	persist_root(store, pair_id, &root_hash, device_id_if_new_root, now_ms)
}

fn persist_root(store: &Store, pair_id: &str, root_hash: &str, device_id_if_new_root: &crate::types::DeviceId, now_ms: i64) -> Result<(), StoreError> {
	let max_seq = store.max_seq(pair_id)?;
	let entry_count = store.live_entries(pair_id)?.len() as u64;

	let mut root = store.get_index_root(pair_id)?.unwrap_or_else(|| IndexRoot::empty(device_id_if_new_root.clone(), now_ms));
	root.root_hash = root_hash.to_string();
	root.max_seq = max_seq;
	root.entry_count = entry_count;
	root.computed_at = now_ms;
	store.put_index_root(pair_id, &root)
}

/// Rebuild the entire tree from scratch: bucket entries by parent path,
/// walk depth-descending, compute each node's hash bottom-up. Generates a
/// fresh `indexId`. Expensive; reserved for first sync / corruption
/// recovery / bulk import.
pub fn compute_root(store: &Store, pair_id: &str, device_id: &crate::types::DeviceId, now_ms: i64) -> Result<IndexRoot, StoreError> {
	use std::collections::BTreeMap;

	let entries = store.all_entries(pair_id)?;

	// parent node_path -> (segment -> leaf hash)
	let mut by_parent: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
	for entry in &entries {
		let (node_path, segment) = split_parent(&entry.path);
		by_parent.entry(node_path).or_default().insert(segment, leaf_hash(entry));
	}

	// Collect every node path that must exist: every key of by_parent, plus
	// every ancestor directory of those keys (so an intermediate directory
	// with only subdirectories, no direct file children, still gets a node).
	let mut all_node_paths: std::collections::BTreeSet<String> = by_parent.keys().cloned().collect();
	for path in by_parent.keys() {
		let mut cur = path.clone();
		while !cur.is_empty() {
			let (parent, _) = split_parent(&cur);
			all_node_paths.insert(parent.clone());
			cur = parent;
		}
	}
	all_node_paths.insert(String::new());

	// Depth-descending order: deepest (most '/' segments) first, so a
	// parent always sees its children's freshly computed hashes.
	let mut ordered: Vec<String> = all_node_paths.into_iter().collect();
	ordered.sort_by_key(|p| std::cmp::Reverse(p.matches('/').count() + if p.is_empty() { 0 } else { 1 }));

	let mut node_hashes: BTreeMap<String, String> = BTreeMap::new();

	for node_path in &ordered {
		let mut children: BTreeMap<String, String> = by_parent.get(node_path).cloned().unwrap_or_default();

		// Fold in any subdirectory children whose hash was just computed.
		let prefix = if node_path.is_empty() { String::new() } else { format!("{}/", node_path) };
		for (child_path, child_hash) in &node_hashes {
			if let Some(rest) = child_path.strip_prefix(&prefix as &str) {
				if !rest.is_empty() && !rest.contains('/') {
					children.insert(rest.to_string(), child_hash.clone());
				}
			}
		}

		let hash = hash_children(&children);
		node_hashes.insert(node_path.clone(), hash.clone());

		if children.is_empty() && !node_path.is_empty() {
			store.delete_node(pair_id, node_path)?;
		} else {
			store.put_node(pair_id, node_path, &MerkleNode { hash, child_hashes: children })?;
		}
	}

	let root_hash = node_hashes.get("").cloned().unwrap_or_else(crate::types::empty_node_hash);
	let max_seq = entries.iter().map(|e| e.seq).max().unwrap_or(0);
	let entry_count = entries.iter().filter(|e| !e.tombstone).count() as u64;

	let root = IndexRoot {
		root_hash,
		entry_count,
		max_seq,
		index_id: crate::types::PairId::generate().0[..21].to_string(),
		computed_at: now_ms,
		device_id: Some(device_id.clone()),
	};
	store.put_index_root(pair_id, &root)?;
	Ok(root)
}

/// A single item of divergence surfaced by [`walk_diff`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffItem {
	/// A leaf (file path) that differs or is local-only.
	Leaf(String),
	/// A leaf present only on the remote side.
	RemoteOnly(String),
	/// A subdirectory whose hash differs; caller should recurse by
	/// requesting the remote's `childHashes` at this node path.
	Dir(String),
}

/// Fast equality/diff walk: given the remote's `childHashes` at `node_path`,
/// return the diverged items. Identical subtrees never recurse.
pub fn walk_diff(
	store: &Store,
	pair_id: &str,
	node_path: &str,
	remote_child_hashes: &std::collections::BTreeMap<String, String>,
) -> Result<Vec<DiffItem>, StoreError> {
	let local = store.get_node(pair_id, node_path)?.unwrap_or_default();
	let mut out = Vec::new();

	let mut segments: std::collections::BTreeSet<&String> = local.child_hashes.keys().collect();
	segments.extend(remote_child_hashes.keys());

	for segment in segments {
		let local_hash = local.child_hashes.get(segment);
		let remote_hash = remote_child_hashes.get(segment);
		let child_path = if node_path.is_empty() { segment.clone() } else { format!("{}/{}", node_path, segment) };
		let is_leaf = store.get_entry(pair_id, &child_path)?.is_some();

		match (local_hash, remote_hash) {
			(Some(l), Some(r)) if l == r => continue,
			(Some(_), None) => {
				if is_leaf {
					out.push(DiffItem::Leaf(child_path));
				} else {
					emit_subtree_leaves(store, pair_id, &child_path, &mut out)?;
				}
			}
			(None, Some(_)) => out.push(DiffItem::RemoteOnly(child_path)),
			(Some(_), Some(_)) => {
				if is_leaf {
					out.push(DiffItem::Leaf(child_path));
				} else {
					out.push(DiffItem::Dir(child_path));
				}
			}
			(None, None) => {}
		}
	}

	Ok(out)
}

fn emit_subtree_leaves(store: &Store, pair_id: &str, node_path: &str, out: &mut Vec<DiffItem>) -> Result<(), StoreError> {
	if let Some(node) = store.get_node(pair_id, node_path)? {
		for segment in node.child_hashes.keys() {
			let child_path = format!("{}/{}", node_path, segment);
			if store.get_entry(pair_id, &child_path)?.is_some() {
				out.push(DiffItem::Leaf(child_path));
			} else {
				emit_subtree_leaves(store, pair_id, &child_path, out)?;
			}
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{DeviceId, VectorClock};

	fn temp_store() -> (tempfile::TempDir, Store) {
		let dir = tempfile::tempdir().unwrap();
		let store = Store::open(&dir.path().join("bdp.redb")).unwrap();
		(dir, store)
	}

	fn entry(path: &str, hash: &str, seq: u64) -> FileEntry {
		FileEntry {
			path: path.to_string(),
			size: 1,
			mtime: 1,
			hash: hash.to_string(),
			chunk_hashes: vec![hash.to_string()],
			tombstone: false,
			vector_clock: VectorClock::new(),
			device_id: DeviceId("d1".into()),
			seq,
		}
	}

	#[test]
	fn root_hash_independent_of_insertion_order() {
		let device = DeviceId("d1".into());

		let (_d1, store1) = temp_store();
		update_entry(&store1, "p", &entry("a.txt", "h1", 1), &device, 0).unwrap();
		update_entry(&store1, "p", &entry("b/c.txt", "h2", 2), &device, 0).unwrap();
		update_entry(&store1, "p", &entry("d.txt", "h3", 3), &device, 0).unwrap();
		let root1 = store1.get_index_root("p").unwrap().unwrap();

		let (_d2, store2) = temp_store();
		update_entry(&store2, "p", &entry("d.txt", "h3", 1), &device, 0).unwrap();
		update_entry(&store2, "p", &entry("b/c.txt", "h2", 2), &device, 0).unwrap();
		update_entry(&store2, "p", &entry("a.txt", "h1", 3), &device, 0).unwrap();
		let root2 = store2.get_index_root("p").unwrap().unwrap();

		assert_eq!(root1.root_hash, root2.root_hash);
	}

	#[test]
	fn incremental_equals_full_rebuild() {
		let device = DeviceId("d1".into());
		let (_dir, store) = temp_store();

		update_entry(&store, "p", &entry("a.txt", "h1", 1), &device, 0).unwrap();
		update_entry(&store, "p", &entry("b/c.txt", "h2", 2), &device, 0).unwrap();
		update_entry(&store, "p", &entry("b/d.txt", "h3", 3), &device, 0).unwrap();
		remove_entry(&store, "p", "b/c.txt", &device, 0).unwrap();

		let incremental_root = store.get_index_root("p").unwrap().unwrap().root_hash;
		let rebuilt = compute_root(&store, "p", &device, 0).unwrap();

		assert_eq!(incremental_root, rebuilt.root_hash);
	}

	#[test]
	fn removing_last_child_cascades_up() {
		let device = DeviceId("d1".into());
		let (_dir, store) = temp_store();

		update_entry(&store, "p", &entry("a/b/c.txt", "h1", 1), &device, 0).unwrap();
		assert!(store.get_node("p", "a/b").unwrap().is_some());
		assert!(store.get_node("p", "a").unwrap().is_some());

		remove_entry(&store, "p", "a/b/c.txt", &device, 0).unwrap();

		assert!(store.get_node("p", "a/b").unwrap().is_none());
		assert!(store.get_node("p", "a").unwrap().is_none());
		// Root remains, now empty.
		let root = store.get_node("p", "").unwrap().unwrap();
		assert_eq!(root.child_count(), 0);
	}

	#[test]
	fn walk_diff_skips_identical_subtrees() {
		let device = DeviceId("d1".into());
		let (_dir, store) = temp_store();
		update_entry(&store, "p", &entry("a.txt", "h1", 1), &device, 0).unwrap();
		update_entry(&store, "p", &entry("b.txt", "h2", 2), &device, 0).unwrap();

		let root = store.get_node("p", "").unwrap().unwrap();
		let diffs = walk_diff(&store, "p", "", &root.child_hashes).unwrap();
		assert!(diffs.is_empty());
	}

	#[test]
	fn walk_diff_reports_changed_leaf() {
		let device = DeviceId("d1".into());
		let (_dir, store) = temp_store();
		update_entry(&store, "p", &entry("a.txt", "h1", 1), &device, 0).unwrap();

		let mut remote_children = std::collections::BTreeMap::new();
		remote_children.insert("a.txt".to_string(), "different-hash".to_string());

		let diffs = walk_diff(&store, "p", "", &remote_children).unwrap();
		assert_eq!(diffs, vec![DiffItem::Leaf("a.txt".to_string())]);
	}

	#[test]
	fn walk_diff_reports_remote_only() {
		let (_dir, store) = temp_store();
		let mut remote_children = std::collections::BTreeMap::new();
		remote_children.insert("only_remote.txt".to_string(), "h".to_string());

		let diffs = walk_diff(&store, "p", "", &remote_children).unwrap();
		assert_eq!(diffs, vec![DiffItem::RemoteOnly("only_remote.txt".to_string())]);
	}

	#[test]
	fn tombstone_changes_leaf_hash_to_sentinel() {
		let device = DeviceId("d1".into());
		let (_dir, store) = temp_store();
		update_entry(&store, "p", &entry("a.txt", "h1", 1), &device, 0).unwrap();
		let root_before = store.get_index_root("p").unwrap().unwrap().root_hash;

		let tomb = FileEntry::tombstone("a.txt".into(), VectorClock::new(), device.clone(), 2);
		update_entry(&store, "p", &tomb, &device, 0).unwrap();
		let root_after = store.get_index_root("p").unwrap().unwrap().root_hash;

		assert_ne!(root_before, root_after);
	}
}

// vim: ts=4
