//! Persistent KV store (C1).
//!
//! Wraps a single `redb::Database` with one table per store named in §4.1.
//! Values are JSON-encoded so the on-disk content stays inspectable.
//! `Store::open` fails fast if another process already holds the database,
//! surfacing it as a fatal init error per §4.1's "refuse the later opener"
//! requirement.

use redb::{Database, ReadableTable, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::error::StoreError;
use crate::types::{CasChunk, Conflict, FileEntry, IndexRoot, MerkleNode, SyncPair};

const DEVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("devices");
const PAIRS: TableDefinition<&str, &[u8]> = TableDefinition::new("pairs");
const FILE_INDEX: TableDefinition<&str, &[u8]> = TableDefinition::new("file_index");
const MERKLE_NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("merkle_nodes");
const INDEX_ROOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("index_roots");
const CAS_INDEX: TableDefinition<&str, &[u8]> = TableDefinition::new("cas_index");
const SYNC_HISTORY: TableDefinition<&str, &[u8]> = TableDefinition::new("sync_history");
const CONFLICTS: TableDefinition<&str, &[u8]> = TableDefinition::new("conflicts");

/// A row recorded on successful session finalize.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SyncHistoryEntry {
	pub pair_id: String,
	pub ts: i64,
	pub peer_device_id: String,
	pub sync_type: String,
	pub new_merkle_root: String,
	pub files_uploaded: u64,
	pub files_downloaded: u64,
}

/// Typed, persistent key/value store backing all of BDP's metadata.
pub struct Store {
	db: Arc<Database>,
}

impl Store {
	/// Open (creating if absent) the database at `path`. Fails with
	/// [`StoreError::AlreadyOpen`] if another process holds it.
	pub fn open(path: &Path) -> Result<Self, StoreError> {
		let db = Database::create(path)?;
		let store = Store { db: Arc::new(db) };
		store.ensure_tables()?;
		Ok(store)
	}

	fn ensure_tables(&self) -> Result<(), StoreError> {
		let txn = self.db.begin_write()?;
		{
			txn.open_table(DEVICES)?;
			txn.open_table(PAIRS)?;
			txn.open_table(FILE_INDEX)?;
			txn.open_table(MERKLE_NODES)?;
			txn.open_table(INDEX_ROOTS)?;
			txn.open_table(CAS_INDEX)?;
			txn.open_table(SYNC_HISTORY)?;
			txn.open_table(CONFLICTS)?;
		}
		txn.commit()?;
		Ok(())
	}

	fn put_json<V: Serialize>(&self, table: TableDefinition<&str, &[u8]>, key: &str, value: &V) -> Result<(), StoreError> {
		let bytes = serde_json::to_vec(value)?;
		let txn = self.db.begin_write()?;
		{
			let mut t = txn.open_table(table)?;
			t.insert(key, bytes.as_slice())?;
		}
		txn.commit()?;
		Ok(())
	}

	fn get_json<V: DeserializeOwned>(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> Result<Option<V>, StoreError> {
		let txn = self.db.begin_read()?;
		let t = txn.open_table(table)?;
		match t.get(key)? {
			Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
			None => Ok(None),
		}
	}

	fn delete_key(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> Result<(), StoreError> {
		let txn = self.db.begin_write()?;
		{
			let mut t = txn.open_table(table)?;
			t.remove(key)?;
		}
		txn.commit()?;
		Ok(())
	}

	fn scan_prefix_json<V: DeserializeOwned>(
		&self,
		table: TableDefinition<&str, &[u8]>,
		prefix: &str,
	) -> Result<Vec<(String, V)>, StoreError> {
		let txn = self.db.begin_read()?;
		let t = txn.open_table(table)?;
		let mut out = Vec::new();
		for row in t.iter()? {
			let (k, v) = row?;
			if k.value().starts_with(prefix) {
				out.push((k.value().to_string(), serde_json::from_slice(v.value())?));
			}
		}
		Ok(out)
	}

	// -- pairs --

	pub fn put_pair(&self, pair: &SyncPair) -> Result<(), StoreError> {
		self.put_json(PAIRS, &pair.pair_id.0, pair)
	}

	pub fn get_pair(&self, pair_id: &str) -> Result<Option<SyncPair>, StoreError> {
		self.get_json(PAIRS, pair_id)
	}

	// -- file index: key "pairId\0path" so scanPrefix(pairId) enumerates a pair --

	fn entry_key(pair_id: &str, path: &str) -> String {
		format!("{}\0{}", pair_id, path)
	}

	pub fn put_entry(&self, entry: &FileEntry, pair_id: &str) -> Result<(), StoreError> {
		self.put_json(FILE_INDEX, &Self::entry_key(pair_id, &entry.path), entry)
	}

	pub fn get_entry(&self, pair_id: &str, path: &str) -> Result<Option<FileEntry>, StoreError> {
		self.get_json(FILE_INDEX, &Self::entry_key(pair_id, path))
	}

	pub fn delete_entry(&self, pair_id: &str, path: &str) -> Result<(), StoreError> {
		self.delete_key(FILE_INDEX, &Self::entry_key(pair_id, path))
	}

	/// All entries for a pair, in whatever order the table iterates (callers
	/// needing `seq` or path order sort after the fact).
	pub fn all_entries(&self, pair_id: &str) -> Result<Vec<FileEntry>, StoreError> {
		Ok(self
			.scan_prefix_json::<FileEntry>(FILE_INDEX, &format!("{}\0", pair_id))?
			.into_iter()
			.map(|(_, v)| v)
			.collect())
	}

	pub fn live_entries(&self, pair_id: &str) -> Result<Vec<FileEntry>, StoreError> {
		Ok(self.all_entries(pair_id)?.into_iter().filter(|e| !e.tombstone).collect())
	}

	pub fn entries_since(&self, pair_id: &str, seq: u64) -> Result<Vec<FileEntry>, StoreError> {
		let mut entries: Vec<FileEntry> = self.all_entries(pair_id)?.into_iter().filter(|e| e.seq > seq).collect();
		entries.sort_by_key(|e| e.seq);
		Ok(entries)
	}

	pub fn max_seq(&self, pair_id: &str) -> Result<u64, StoreError> {
		Ok(self.all_entries(pair_id)?.into_iter().map(|e| e.seq).max().unwrap_or(0))
	}

	// -- merkle nodes --

	fn node_key(pair_id: &str, node_path: &str) -> String {
		format!("{}\0{}", pair_id, node_path)
	}

	pub fn put_node(&self, pair_id: &str, node_path: &str, node: &MerkleNode) -> Result<(), StoreError> {
		self.put_json(MERKLE_NODES, &Self::node_key(pair_id, node_path), node)
	}

	pub fn get_node(&self, pair_id: &str, node_path: &str) -> Result<Option<MerkleNode>, StoreError> {
		self.get_json(MERKLE_NODES, &Self::node_key(pair_id, node_path))
	}

	pub fn delete_node(&self, pair_id: &str, node_path: &str) -> Result<(), StoreError> {
		self.delete_key(MERKLE_NODES, &Self::node_key(pair_id, node_path))
	}

	// -- index roots --

	pub fn put_index_root(&self, pair_id: &str, root: &IndexRoot) -> Result<(), StoreError> {
		self.put_json(INDEX_ROOTS, pair_id, root)
	}

	pub fn get_index_root(&self, pair_id: &str) -> Result<Option<IndexRoot>, StoreError> {
		self.get_json(INDEX_ROOTS, pair_id)
	}

	// -- CAS index --

	pub fn put_cas_chunk(&self, chunk: &CasChunk) -> Result<(), StoreError> {
		self.put_json(CAS_INDEX, &chunk.hash, chunk)
	}

	pub fn get_cas_chunk(&self, hash: &str) -> Result<Option<CasChunk>, StoreError> {
		self.get_json(CAS_INDEX, hash)
	}

	pub fn delete_cas_chunk(&self, hash: &str) -> Result<(), StoreError> {
		self.delete_key(CAS_INDEX, hash)
	}

	/// All chunks with `refCount == 0`, i.e. reclaimable.
	pub fn zero_ref_chunks(&self) -> Result<Vec<CasChunk>, StoreError> {
		let txn = self.db.begin_read()?;
		let t = txn.open_table(CAS_INDEX)?;
		let mut out = Vec::new();
		for row in t.iter()? {
			let (_, v) = row?;
			let chunk: CasChunk = serde_json::from_slice(v.value())?;
			if chunk.ref_count == 0 {
				out.push(chunk);
			}
		}
		Ok(out)
	}

	// -- conflicts --

	fn conflict_key(pair_id: &str, path: &str) -> String {
		format!("{}\0{}", pair_id, path)
	}

	pub fn put_conflict(&self, pair_id: &str, conflict: &Conflict) -> Result<(), StoreError> {
		self.put_json(CONFLICTS, &Self::conflict_key(pair_id, &conflict.path), conflict)
	}

	pub fn get_conflict(&self, pair_id: &str, path: &str) -> Result<Option<Conflict>, StoreError> {
		self.get_json(CONFLICTS, &Self::conflict_key(pair_id, path))
	}

	pub fn unresolved_conflicts(&self, pair_id: &str) -> Result<Vec<Conflict>, StoreError> {
		Ok(self
			.scan_prefix_json::<Conflict>(CONFLICTS, &format!("{}\0", pair_id))?
			.into_iter()
			.map(|(_, v)| v)
			.filter(|c| !c.is_resolved())
			.collect())
	}

	// -- sync history --

	pub fn append_sync_history(&self, entry: &SyncHistoryEntry) -> Result<(), StoreError> {
		let key = format!("{}\0{}", entry.pair_id, entry.ts);
		self.put_json(SYNC_HISTORY, &key, entry)
	}
}


// vim: ts=4
