//! Session state machine (C8): one per active peer link, driving
//! greeting → diffing → index-exchange → transfer → finalize, with
//! concurrency, retry, and conflict surfacing (§4.8).
//!
//! The cross-component event emission from the source is modelled here as
//! two explicit observer callbacks, `on_state_change` and `on_stopped`
//! (§9) — no ad-hoc emitter.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, Duration};

use crate::cas::Cas;
use crate::collaborators::{FolderSink, FolderSource, Transport, WireMessage};
use crate::config::Config;
use crate::error::BdpError;
use crate::index::{build_entry, build_tombstone, detect_changes};
use crate::merkle::{compute_root, update_entry};
use crate::planner::{self, Plan};
use crate::store::{Store, SyncHistoryEntry};
use crate::types::{Conflict, ConflictStrategy, DeviceId, FileEntry, Resolution, SyncPair};
use crate::wire::{
	AckPayload, AckStatus, ChunkHeader, ChunkRequestPayload, ConflictPayload, ConflictResolutionPayload, DonePayload,
	DoneStats, Envelope, ErrorPayload, FramePayload, HelloPayload, IndexRequestPayload, IndexResponsePayload,
	PairAnnouncement, PingPongPayload,
};

/// The session's current state, per the transition diagram in §4.8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
	Idle,
	Greeting,
	DeltaSync,
	FullSync,
	Transferring,
	ResolvingConflict,
	Finalizing,
	Retrying { attempt: u32 },
	Error { recoverable: bool },
}

/// What kind of sync this session ended up running, for `DONE.stats`/
/// `SyncHistory` bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncType {
	NoChange,
	Delta,
	Full,
}

/// Observer hooks the host may implement to receive state transitions.
pub trait SessionCallbacks: Send + Sync {
	fn on_state_change(&self, _state: &SessionState) {}
	fn on_stopped(&self) {}
}

/// A no-op set of callbacks, for callers that don't need observability.
pub struct NoopCallbacks;
impl SessionCallbacks for NoopCallbacks {}

/// Decide the sync path to take after exchanging `HELLO` (§4.8 GREETING).
pub fn greeting_decision(local_root_hash: Option<&str>, local_index_id: &str, peer: &PairAnnouncement) -> SyncType {
	if let (Some(local), Some(remote)) = (local_root_hash, peer.merkle_root.as_deref()) {
		if local == remote {
			return SyncType::NoChange;
		}
	}
	if !local_index_id.is_empty() && local_index_id == peer.index_id {
		SyncType::Delta
	} else {
		SyncType::Full
	}
}

/// Flip a resolution's orientation: what one peer calls "keep local" the
/// other must apply as "keep remote", and vice versa. `none` is symmetric.
fn invert_resolution(resolution: Resolution) -> Resolution {
	match resolution {
		Resolution::KeepLocal => Resolution::KeepRemote,
		Resolution::KeepRemote => Resolution::KeepLocal,
		Resolution::None => Resolution::None,
	}
}

/// Compute which of an entry's chunk hashes are already present locally
/// (`haveChunks`) versus missing (`needChunks`), per the download-side
/// transfer setup of §4.8.
pub fn compute_chunk_needs(cas: &Cas, chunk_hashes: &[String]) -> (Vec<String>, Vec<String>) {
	let mut have = Vec::new();
	let mut need = Vec::new();
	for hash in chunk_hashes {
		if cas.has(hash) {
			have.push(hash.clone());
		} else {
			need.push(hash.clone());
		}
	}
	(have, need)
}

/// One entry's transfer bookkeeping while chunks stream in. Holds its
/// concurrency-slot permit for its whole lifetime, from the moment its
/// `CHUNK_REQUEST` goes out until `finalize_download` consumes it — not
/// just for the instant the request was sent (§4.8 Concurrency).
struct InFlightDownload {
	path: String,
	entry: FileEntry,
	received: BTreeMap<u64, Vec<u8>>,
	total_chunks: u64,
	_permit: OwnedSemaphorePermit,
}

/// A session driving one sync pass for `(peer, pair)`. Holds everything
/// needed to run the state machine end to end: storage, CAS, the
/// injected collaborators, and the transport.
pub struct Session<T: Transport, S: FolderSource, K: FolderSink> {
	pub config: Config,
	pub store: Arc<Store>,
	pub cas: Arc<Cas>,
	pub pair: SyncPair,
	pub device_id: DeviceId,
	pub transport: Arc<T>,
	pub source: Arc<S>,
	pub sink: Arc<K>,
	pub callbacks: Arc<dyn SessionCallbacks>,
	state: Mutex<SessionState>,
	retry_count: Mutex<u32>,
	downloads: Mutex<HashMap<String, InFlightDownload>>,
	/// Shared by uploads and downloads alike, per §4.8's "uploads+downloads"
	/// combined cap. A permit is held for a transfer's real lifetime (see
	/// `InFlightDownload`/`serve_chunk_request`), not merely while it is
	/// being dispatched.
	transfer_semaphore: Arc<Semaphore>,
	/// Planned downloads waiting for a free concurrency slot.
	pending_downloads: Mutex<VecDeque<(String, FileEntry)>>,
	/// Peer `CHUNK_REQUEST`s waiting for a free concurrency slot.
	pending_upload_requests: Mutex<VecDeque<ChunkRequestPayload>>,
	/// Running total of dedup bytes saved, accumulated as downloads
	/// actually dispatch (which may be deferred past plan time — see
	/// `dispatch_pending`) and read back into `DoneStats` at finalize.
	bytes_saved_dedup: Mutex<u64>,
}

impl<T: Transport, S: FolderSource, K: FolderSink> Session<T, S, K> {
	pub fn new(
		config: Config,
		store: Arc<Store>,
		cas: Arc<Cas>,
		pair: SyncPair,
		device_id: DeviceId,
		transport: Arc<T>,
		source: Arc<S>,
		sink: Arc<K>,
		callbacks: Arc<dyn SessionCallbacks>,
	) -> Self {
		let transfer_semaphore = Arc::new(Semaphore::new(config.max_concurrent_transfers));
		Session {
			config,
			store,
			cas,
			pair,
			device_id,
			transport,
			source,
			sink,
			callbacks,
			state: Mutex::new(SessionState::Idle),
			retry_count: Mutex::new(0),
			downloads: Mutex::new(HashMap::new()),
			transfer_semaphore,
			pending_downloads: Mutex::new(VecDeque::new()),
			pending_upload_requests: Mutex::new(VecDeque::new()),
			bytes_saved_dedup: Mutex::new(0),
		}
	}

	async fn transition(&self, state: SessionState) {
		self.callbacks.on_state_change(&state);
		*self.state.lock().await = state;
	}

	pub async fn current_state(&self) -> SessionState {
		self.state.lock().await.clone()
	}

	/// Scan the local `FolderSource`, apply the §4.3 decision table, and
	/// persist the resulting adds/modifications/deletes into the index
	/// and Merkle tree.
	pub async fn refresh_local_index(&self, now_ms: i64) -> Result<(), BdpError> {
		let scanned_entries = self.source.scan().await?;
		let scan: Vec<_> = scanned_entries.iter().map(|e| e.as_scanned()).collect();
		let changes = detect_changes(&self.store, &self.pair.pair_id.0, &scan)?;

		for path in changes.added.iter().chain(changes.modified.iter()) {
			let source_entry = scanned_entries.iter().find(|e| &e.path == path).expect("scanned path vanished mid-scan");
			let is_new = changes.added.contains(path);
			let previous_clock = if is_new {
				None
			} else {
				self.store.get_entry(&self.pair.pair_id.0, path)?.map(|e| e.vector_clock)
			};
			let entry = build_entry(
				&self.store,
				&self.pair.pair_id.0,
				&self.device_id,
				path.clone(),
				source_entry.content.len() as u64,
				source_entry.mtime,
				&source_entry.content,
				self.config.chunk_size,
				previous_clock,
			)?;
			if is_new || crate::index::is_actually_modified(&self.store, &self.pair.pair_id.0, path, &entry.hash)? {
				update_entry(&self.store, &self.pair.pair_id.0, &entry, &self.device_id, now_ms)?;
				self.store_chunks(&source_entry.content, &entry.chunk_hashes, now_ms).await?;
			}
		}

		for path in &changes.deleted {
			let tomb = build_tombstone(&self.store, &self.pair.pair_id.0, &self.device_id, path.clone())?;
			update_entry(&self.store, &self.pair.pair_id.0, &tomb, &self.device_id, now_ms)?;
		}

		Ok(())
	}

	/// Put every one of `content`'s fixed-size chunks into CAS under its
	/// hash and bump its refcount, so the upload path (`serve_chunk_request`)
	/// can later find the bytes it's asked for by hash.
	async fn store_chunks(&self, content: &[u8], chunk_hashes: &[String], now_ms: i64) -> Result<(), BdpError> {
		let chunks = crate::chunking::split_chunks(content, self.config.chunk_size);
		for (hash, bytes) in chunk_hashes.iter().zip(chunks.iter()) {
			let outcome = self.cas.put(hash, bytes, false).await.map_err(|e| BdpError::WriteError(e.to_string()))?;
			self.cas
				.inc_ref(&self.store, hash, outcome.original_size, outcome.stored_size, outcome.stored_compressed, now_ms)
				.map_err(|e| BdpError::WriteError(e.to_string()))?;
		}
		Ok(())
	}

	/// GREETING: build and return our `HELLO` frame.
	pub async fn build_hello(&self, msg_id: String, now_ms: i64) -> Result<Envelope, BdpError> {
		let root = self.store.get_index_root(&self.pair.pair_id.0)?;
		let announcement = match &root {
			Some(r) => PairAnnouncement {
				pair_id: self.pair.pair_id.0.clone(),
				merkle_root: Some(r.root_hash.clone()),
				max_seq: r.max_seq,
				index_id: r.index_id.clone(),
			},
			None => PairAnnouncement {
				pair_id: self.pair.pair_id.0.clone(),
				merkle_root: None,
				max_seq: 0,
				index_id: String::new(),
			},
		};
		Ok(Envelope::new(
			self.pair.pair_id.0.clone(),
			msg_id,
			self.device_id.0.clone(),
			now_ms,
			FramePayload::Hello(HelloPayload {
				device_name: self.device_id.0.clone(),
				capabilities: vec!["chunked".into()],
				public_key_b64: None,
				pairs: vec![announcement],
			}),
		))
	}

	/// Handle a peer `HELLO`: locate our pair announcement, fail fatally
	/// with `PairNotFound` if absent, and decide the sync path. Returns the
	/// chosen [`SyncType`] plus the peer's `maxSeq` (for the delta-sync
	/// `INDEX_REQUEST.sinceSeq`).
	pub async fn handle_hello(&self, hello: &HelloPayload) -> Result<(SyncType, u64), BdpError> {
		let peer_pair = hello
			.pairs
			.iter()
			.find(|p| p.pair_id == self.pair.pair_id.0)
			.ok_or_else(|| BdpError::PairNotFound(self.pair.pair_id.0.clone()))?;

		let root = self.store.get_index_root(&self.pair.pair_id.0)?;
		let (local_hash, local_index_id) = match &root {
			Some(r) => (Some(r.root_hash.as_str()), r.index_id.as_str()),
			None => (None, ""),
		};

		Ok((greeting_decision(local_hash, local_index_id, peer_pair), peer_pair.max_seq))
	}

	/// INDEX EXCHANGE, requester side: plan against the raw local/remote
	/// entries and persist any conflicts. CRDT convergence itself isn't done
	/// eagerly here — it happens lazily as each planned transfer actually
	/// completes (`finalize_download` is what calls `update_entry` with the
	/// merged vector clock), so the local index never claims a hash whose
	/// bytes haven't actually landed. Callers hang onto `remote_entries` to
	/// hand to [`Session::enqueue_downloads`], since `plan.download` carries only
	/// paths and the entries it refers to may not exist locally yet.
	pub async fn exchange_and_plan(
		&self,
		since_seq: u64,
		remote_entries: &[FileEntry],
		sender_max_seq: u64,
		now_ms: i64,
	) -> Result<Plan, BdpError> {
		let _ = since_seq;

		let local = self.store.all_entries(&self.pair.pair_id.0)?;
		let plan = planner::plan(&self.pair, &local, remote_entries, now_ms);

		for conflict in &plan.conflicts {
			self.store.put_conflict(&self.pair.pair_id.0, conflict)?;
		}

		let _ = sender_max_seq;
		Ok(plan)
	}

	/// Stream `INDEX_RESPONSE` batches for a peer's `INDEX_REQUEST`, in
	/// `seq` order, bounded by `max_batch_entries` per batch.
	pub fn build_index_responses(&self, req: &IndexRequestPayload) -> Result<Vec<IndexResponsePayload>, BdpError> {
		let mut entries = self.store.entries_since(&self.pair.pair_id.0, req.since_seq)?;
		entries.sort_by_key(|e| e.seq);
		let sender_max_seq = self.store.max_seq(&self.pair.pair_id.0)?;
		let total = entries.len() as u64;

		if entries.is_empty() {
			return Ok(vec![IndexResponsePayload {
				entries: Vec::new(),
				is_complete: true,
				total_entries: 0,
				sender_max_seq,
			}]);
		}

		let batch_size = self.config.max_batch_entries;
		let mut out = Vec::new();
		let mut iter = entries.drain(..).peekable();
		while iter.peek().is_some() {
			let batch: Vec<FileEntry> = iter.by_ref().take(batch_size).collect();
			let is_complete = iter.peek().is_none();
			out.push(IndexResponsePayload {
				entries: batch,
				is_complete,
				total_entries: total,
				sender_max_seq,
			});
		}
		Ok(out)
	}

	/// Sum the precise original size of every already-local chunk in `have`
	/// (§9 Q3: the recommended, precise `bytesSavedDedup` accounting).
	fn dedup_savings(&self, have: &[String]) -> u64 {
		have.iter().filter_map(|h| self.store.get_cas_chunk(h).ok().flatten()).map(|c| c.original_size).sum()
	}

	/// Run one download for `path`, driving CHUNK_REQUEST/CHUNK exchange
	/// via the transport and writing received chunks straight to CAS.
	/// `permit` is held for the download's entire real lifetime — it
	/// travels with the `InFlightDownload` and is only released once
	/// `finalize_download` consumes it (§4.8 Concurrency). Returns the
	/// bytes saved by deduplication (chunks already present locally).
	async fn run_download(&self, path: &str, remote_entry: &FileEntry, permit: OwnedSemaphorePermit) -> Result<u64, BdpError> {
		let (have, need) = compute_chunk_needs(&self.cas, &remote_entry.chunk_hashes);
		let saved = self.dedup_savings(&have);
		let transfer_id = uuid::Uuid::new_v4().to_string();

		if need.is_empty() {
			let in_flight = InFlightDownload {
				path: path.to_string(),
				entry: remote_entry.clone(),
				received: BTreeMap::new(),
				total_chunks: remote_entry.chunk_hashes.len() as u64,
				_permit: permit,
			};
			self.finalize_download(&transfer_id, in_flight).await?;
			return Ok(saved);
		}

		self.downloads.lock().await.insert(
			transfer_id.clone(),
			InFlightDownload {
				path: path.to_string(),
				entry: remote_entry.clone(),
				received: BTreeMap::new(),
				total_chunks: remote_entry.chunk_hashes.len() as u64,
				_permit: permit,
			},
		);

		let request = ChunkRequestPayload {
			transfer_id,
			path: path.to_string(),
			have_chunks: have,
			need_chunks: need,
			total_chunks: remote_entry.chunk_hashes.len() as u64,
		};
		let envelope = Envelope::new(
			self.pair.pair_id.0.clone(),
			uuid::Uuid::new_v4().to_string(),
			self.device_id.0.clone(),
			0,
			FramePayload::ChunkRequest(request),
		);
		self.transport.send_text(envelope.encode()?).await?;
		Ok(saved)
	}

	/// Dispatch `path`'s download now if a concurrency slot is free,
	/// otherwise queue it for `dispatch_pending` to pick up once one frees.
	/// Never blocks on the semaphore: `drive()`'s single recv loop is the
	/// only thing that can ever free a slot (by finalizing an existing
	/// transfer), so blocking here would deadlock the loop against itself.
	async fn request_download(&self, path: &str, remote_entry: &FileEntry) -> Result<(), BdpError> {
		match self.transfer_semaphore.clone().try_acquire_owned() {
			Ok(permit) => {
				let saved = self.run_download(path, remote_entry, permit).await?;
				*self.bytes_saved_dedup.lock().await += saved;
			}
			Err(_) => {
				self.pending_downloads.lock().await.push_back((path.to_string(), remote_entry.clone()));
			}
		}
		Ok(())
	}

	/// Apply a resolution to a conflict this session is tracking, in our own
	/// local/remote orientation: `keep-remote` actually pulls (or, for a
	/// tombstoned remote, deletes) so the materialized file matches, not just
	/// the index row; `keep-local` is a no-op; `none` leaves it pending.
	async fn apply_resolution(&self, conflict: &mut Conflict, resolution: Resolution, now_ms: i64) -> Result<(), BdpError> {
		match resolution {
			Resolution::KeepRemote => {
				self.request_download(&conflict.path, &conflict.remote).await?;
			}
			Resolution::KeepLocal => {}
			Resolution::None => return Ok(()),
		}
		conflict.resolved_at = Some(now_ms);
		conflict.applied_resolution = Some(resolution);
		self.store.put_conflict(&self.pair.pair_id.0, conflict)?;
		Ok(())
	}

	/// Handle one binary CHUNK frame off the transport: decode it, write the
	/// chunk to CAS, and finalize the transfer once every chunk for its
	/// `transfer_id` has arrived. Unknown `transfer_id`s are dropped (the
	/// peer may be retransmitting after we already gave up, see §7).
	pub async fn handle_chunk_frame(&self, frame: &[u8]) -> Result<(), BdpError> {
		let (header, bytes) = crate::wire::decode_chunk_frame(frame)?;
		self.receive_chunk(&header, bytes).await?;

		let done = {
			let downloads = self.downloads.lock().await;
			downloads.get(&header.transfer_id).map(|d| d.received.len() as u64 >= d.total_chunks).unwrap_or(false)
		};
		if header.is_last || done {
			if let Some(in_flight) = self.downloads.lock().await.remove(&header.transfer_id) {
				self.finalize_download(&header.transfer_id, in_flight).await?;
			}
		}
		Ok(())
	}

	/// Decompress and persist one received chunk into CAS, tracking it
	/// against its in-flight download.
	async fn receive_chunk(&self, header: &ChunkHeader, bytes: &[u8]) -> Result<(), BdpError> {
		let raw = if header.compressed {
			use std::io::Read;
			let mut decoder = flate2::read::DeflateDecoder::new(bytes);
			let mut out = Vec::with_capacity(header.original_size as usize);
			decoder.read_to_end(&mut out)?;
			out
		} else {
			bytes.to_vec()
		};

		self.cas.put(&header.chunk_hash, &raw, false).await.map_err(|e| BdpError::WriteError(e.to_string()))?;
		self.cas
			.inc_ref(&self.store, &header.chunk_hash, raw.len() as u64, raw.len() as u64, false, 0)
			.map_err(|e| BdpError::WriteError(e.to_string()))?;

		if let Some(in_flight) = self.downloads.lock().await.get_mut(&header.transfer_id) {
			in_flight.received.insert(header.chunk_index, raw);
		}
		Ok(())
	}

	/// Materialize a fully-received file, verify its hash, update the
	/// local index, and send the `ACK`. A tombstoned remote entry has no
	/// chunks to assemble; it just deletes the local file.
	async fn finalize_download(&self, transfer_id: &str, in_flight: InFlightDownload) -> Result<(), BdpError> {
		// Bind `_permit` by name rather than dropping it via `..` — it must
		// stay held for this whole function, not just the destructuring
		// statement, or a second transfer could start before this one's
		// write/verify/ACK work is actually done.
		let InFlightDownload { path, entry: remote_entry, mut received, _permit, .. } = in_flight;

		if remote_entry.tombstone {
			if self.sink.delete(&path).await.is_err() {
				return self.send_ack(transfer_id, &path, AckStatus::WriteError, None).await;
			}
			let mut entry = remote_entry.clone();
			entry.vector_clock.increment(&self.device_id);
			update_entry(&self.store, &self.pair.pair_id.0, &entry, &self.device_id, 0).map_err(BdpError::from)?;
			return self.send_ack(transfer_id, &path, AckStatus::Ok, None).await;
		}

		// Pull any already-local chunks in so the ordered assembly is complete.
		for (idx, hash) in remote_entry.chunk_hashes.iter().enumerate() {
			if !received.contains_key(&(idx as u64)) {
				if let Ok(bytes) = self.cas.get(hash) {
					received.insert(idx as u64, bytes);
				}
			}
		}

		let mut content = Vec::new();
		for idx in 0..remote_entry.chunk_hashes.len() as u64 {
			match received.get(&idx) {
				Some(bytes) => content.extend_from_slice(bytes),
				None => {
					return self.send_ack(transfer_id, &path, AckStatus::HashMismatch, Some("missing chunk".into())).await;
				}
			}
		}

		let actual_hash = Cas::hash_of(&content);
		if actual_hash != remote_entry.hash {
			return self
				.send_ack(transfer_id, &path, AckStatus::HashMismatch, Some(format!("expected {}, got {}", remote_entry.hash, actual_hash)))
				.await;
		}

		match self.sink.write(&path, &content).await {
			Ok(()) => {}
			Err(_) => return self.send_ack(transfer_id, &path, AckStatus::WriteError, None).await,
		}

		let mut entry = remote_entry.clone();
		entry.vector_clock.increment(&self.device_id);
		update_entry(&self.store, &self.pair.pair_id.0, &entry, &self.device_id, 0).map_err(BdpError::from)?;

		self.send_ack(transfer_id, &path, AckStatus::Ok, None).await
	}

	async fn send_ack(&self, transfer_id: &str, path: &str, status: AckStatus, error_message: Option<String>) -> Result<(), BdpError> {
		let envelope = Envelope::new(
			self.pair.pair_id.0.clone(),
			uuid::Uuid::new_v4().to_string(),
			self.device_id.0.clone(),
			0,
			FramePayload::Ack(AckPayload { transfer_id: transfer_id.to_string(), path: path.to_string(), status, error_message }),
		);
		self.transport.send_text(envelope.encode()?).await
	}

	/// Upload side: on `CHUNK_REQUEST`, read each needed chunk from CAS in
	/// order and send it, flagging the final frame `is_last`. `permit` is
	/// held for the whole send loop, since this function (unlike the
	/// download side) already represents the transfer's entire real
	/// duration — there's no later frame that completes it.
	pub async fn serve_chunk_request(&self, req: &ChunkRequestPayload, permit: OwnedSemaphorePermit) -> Result<(), BdpError> {
		let _permit = permit;
		let entry = match self.store.get_entry(&self.pair.pair_id.0, &req.path)? {
			Some(e) => e,
			None => return self.send_ack(&req.transfer_id, &req.path, AckStatus::WriteError, Some("no such entry".into())).await,
		};

		let total = req.need_chunks.len();
		for (i, hash) in req.need_chunks.iter().enumerate() {
			let bytes = self.cas.get(hash).map_err(|e| BdpError::NotFound(e.to_string()))?;
			let index = entry.chunk_hashes.iter().position(|h| h == hash).unwrap_or(i) as u64;
			let header = ChunkHeader {
				transfer_id: req.transfer_id.clone(),
				chunk_hash: hash.clone(),
				chunk_index: index,
				is_last: i + 1 == total,
				compressed: false,
				original_size: bytes.len() as u64,
			};
			let frame = crate::wire::encode_chunk_frame(&header, &bytes)?;
			self.transport.send_binary(frame).await?;
		}
		Ok(())
	}

	/// Kick off every planned download (§4.8 Concurrency): each either starts
	/// immediately, if a concurrency slot is free, or is queued for
	/// `dispatch_pending` to pick up as slots free up later. `remote_entries`
	/// is the same batch `plan` was computed from — downloads look their
	/// entry up there rather than in the local store, since a brand-new or
	/// remote-dominant path may have no local row at all yet. Planned
	/// uploads need no equivalent call: the peer drives the actual transfer
	/// by sending us a `CHUNK_REQUEST` once it sees our entry, and that
	/// arrives as its own frame in `drive()`.
	pub async fn enqueue_downloads(&self, plan: &Plan, remote_entries: &[FileEntry]) -> Result<(), BdpError> {
		let remote_by_path: HashMap<&str, &FileEntry> = remote_entries.iter().map(|e| (e.path.as_str(), e)).collect();
		for path in &plan.download {
			if let Some(&remote_entry) = remote_by_path.get(path.as_str()) {
				self.request_download(path, remote_entry).await?;
			}
		}
		Ok(())
	}

	/// Opportunistically drain the queued uploads and downloads until a
	/// pass over both makes no progress, i.e. every free slot has either
	/// been claimed or found nothing waiting for it. Called whenever a
	/// transfer's permit might just have been released, so queued work
	/// from earlier (when the cap was saturated) gets its turn.
	async fn dispatch_pending(&self) -> Result<(), BdpError> {
		loop {
			let mut progressed = false;

			if let Ok(permit) = self.transfer_semaphore.clone().try_acquire_owned() {
				match self.pending_upload_requests.lock().await.pop_front() {
					Some(req) => {
						self.serve_chunk_request(&req, permit).await?;
						progressed = true;
					}
					None => drop(permit),
				}
			}

			if let Ok(permit) = self.transfer_semaphore.clone().try_acquire_owned() {
				match self.pending_downloads.lock().await.pop_front() {
					Some((path, remote_entry)) => {
						let saved = self.run_download(&path, &remote_entry, permit).await?;
						*self.bytes_saved_dedup.lock().await += saved;
						progressed = true;
					}
					None => drop(permit),
				}
			}

			if !progressed {
				return Ok(());
			}
		}
	}

	/// Send the opening `HELLO` and drive the full state machine to
	/// completion: greeting, index exchange, transfer, conflict handling,
	/// and finalize. Returns once a `DONE` has been sent or received.
	pub async fn run(&self) -> Result<(), BdpError> {
		let now_ms = 0;
		let hello = self.build_hello(uuid::Uuid::new_v4().to_string(), now_ms).await?;
		self.transport.send_text(hello.encode()?).await?;
		self.drive(now_ms).await
	}

	/// Alias for [`Session::run`]: the GREETING exchange (§4.8) is symmetric
	/// — both the side that opened the transport and the side that accepted
	/// it send their own `HELLO` and react to whatever arrives first.
	pub async fn run_as_responder(&self) -> Result<(), BdpError> {
		self.run().await
	}

	/// Core dispatch loop: react to whatever the peer sends next. Shared by
	/// the initiating and responding sides, since both read off the same
	/// transport and may see frames in either order.
	async fn drive(&self, mut now_ms: i64) -> Result<(), BdpError> {
		let mut pending_entries: Vec<FileEntry> = Vec::new();
		let mut sender_max_seq = 0u64;
		let mut stats = DoneStats::default();
		let mut sync_type = SyncType::Full;
		// Set once planning/conflicts are otherwise done but chunk transfers
		// dispatched by run_download are still in flight (see `self.downloads`):
		// the actual DONE waits for the last one's ACK rather than firing the
		// moment the plan looks satisfied.
		let mut pending_finalize = false;
		// Our own FINALIZE only sends DONE — it doesn't stop `drive()` (the
		// peer may still need us to serve requests), so this guards against
		// sending a second DONE if more finalize-eligible frames arrive
		// before the peer's own DONE closes the loop.
		let mut finalized = false;
		// The peer's DONE can arrive before frames it queued *after* its own
		// DONE (e.g. CHUNKs served in response to a request of ours that
		// hadn't reached it yet when it finalized) — DONE only means "the
		// peer's own plan is satisfied," not "nothing more is coming from
		// it." So receiving it alone isn't enough to stop: `drive()` only
		// actually returns once both sides have reached this state, i.e.
		// `finalized && peer_done`.
		let mut peer_done = false;

		loop {
			let message = match self.transport.recv().await? {
				Some(m) => m,
				None => return Err(BdpError::TransportClosed),
			};

			match message {
				WireMessage::Binary(bytes) => {
					self.with_retry(|| async { self.handle_chunk_frame(&bytes).await }).await?;
					self.dispatch_pending().await?;
					if pending_finalize && !finalized && !self.downloads_outstanding().await {
						self.finalize_with_stats(sync_type, &mut stats, now_ms).await?;
						finalized = true;
						if peer_done {
							self.transition(SessionState::Idle).await;
							self.callbacks.on_stopped();
							return Ok(());
						}
					}
				}
				WireMessage::Text(text) => {
					let envelope = Envelope::decode(&text)?;
					now_ms = envelope.ts;

					match envelope.frame {
						FramePayload::Hello(hello) => {
							self.transition(SessionState::Greeting).await;
							let (decided, peer_max_seq) = self.handle_hello(&hello).await?;
							sync_type = decided;

							if sync_type == SyncType::NoChange {
								self.finalize_with_stats(sync_type, &mut stats, now_ms).await?;
								finalized = true;
								if peer_done {
									self.transition(SessionState::Idle).await;
									self.callbacks.on_stopped();
									return Ok(());
								}
							} else {
								self.transition(if sync_type == SyncType::Delta {
									SessionState::DeltaSync
								} else {
									SessionState::FullSync
								})
								.await;
								self.refresh_local_index(now_ms).await?;

								let since_seq = if sync_type == SyncType::Delta { peer_max_seq } else { 0 };
								let request = Envelope::new(
									self.pair.pair_id.0.clone(),
									uuid::Uuid::new_v4().to_string(),
									self.device_id.0.clone(),
									now_ms,
									FramePayload::IndexRequest(IndexRequestPayload { since_seq }),
								);
								self.transport.send_text(request.encode()?).await?;
							}
						}
						FramePayload::IndexRequest(req) => {
							for response in self.build_index_responses(&req)? {
								let env = Envelope::new(
									self.pair.pair_id.0.clone(),
									uuid::Uuid::new_v4().to_string(),
									self.device_id.0.clone(),
									now_ms,
									FramePayload::IndexResponse(response),
								);
								self.transport.send_text(env.encode()?).await?;
							}
						}
						FramePayload::IndexResponse(response) => {
							sender_max_seq = response.sender_max_seq;
							pending_entries.extend(response.entries);

							if response.is_complete {
								self.transition(SessionState::Transferring).await;
								let plan = self.exchange_and_plan(0, &pending_entries, sender_max_seq, now_ms).await?;

								for conflict in &plan.conflicts {
									let frame = build_conflict_frame(&self.pair.pair_id.0, &self.device_id.0, conflict, now_ms);
									self.transport.send_text(frame.encode()?).await?;

									// §4.8 step 3: the side that detected the conflict applies
									// its own auto-resolution immediately (unless manual) rather
									// than waiting on a round trip, and tells the peer.
									if self.pair.conflict_strategy != ConflictStrategy::Manual
										&& conflict.auto_resolution != Resolution::None
									{
										let mut mine = conflict.clone();
										self.apply_resolution(&mut mine, conflict.auto_resolution, now_ms).await?;
										let resolution_frame = build_conflict_resolution_frame(
											&self.pair.pair_id.0,
											&self.device_id.0,
											&conflict.path,
											conflict.auto_resolution,
											now_ms,
										);
										self.transport.send_text(resolution_frame.encode()?).await?;
									}
								}

								stats.files_uploaded += plan.upload.len() as u64;
								stats.files_downloaded += plan.download.len() as u64;
								self.enqueue_downloads(&plan, &pending_entries).await?;
								pending_entries.clear();

								if self.store.unresolved_conflicts(&self.pair.pair_id.0)?.is_empty() {
									if !self.downloads_outstanding().await {
										self.finalize_with_stats(sync_type, &mut stats, now_ms).await?;
										finalized = true;
										if peer_done {
											self.transition(SessionState::Idle).await;
											self.callbacks.on_stopped();
											return Ok(());
										}
									} else {
										pending_finalize = true;
									}
								} else {
									self.transition(SessionState::ResolvingConflict).await;
								}
							}
						}
						FramePayload::ChunkRequest(req) => {
							self.transition(SessionState::Transferring).await;
							match self.transfer_semaphore.clone().try_acquire_owned() {
								Ok(permit) => self.serve_chunk_request(&req, permit).await?,
								Err(_) => self.pending_upload_requests.lock().await.push_back(req),
							}
							self.dispatch_pending().await?;
						}
						FramePayload::Ack(ack) => {
							if ack.status != AckStatus::Ok {
								crate::logging::warn!(path = %ack.path, status = ?ack.status, "transfer failed");
							}
						}
						FramePayload::Conflict(c) => {
							self.transition(SessionState::ResolvingConflict).await;
							// A genuinely concurrent conflict is always detected by both
							// sides (the vector-clock comparison is symmetric), so we may
							// already have our own, self-resolved record for this path —
							// don't clobber it back to unresolved.
							let already_resolved = self
								.store
								.get_conflict(&self.pair.pair_id.0, &c.path)?
								.map(|existing| existing.resolved_at.is_some())
								.unwrap_or(false);
							if !already_resolved {
								// The sender's local/remote, and its resolution, are from its
								// own point of view — its "local" is our "remote" and vice
								// versa, so both the entries and the resolution invert. The
								// actual apply waits for its CONFLICT_RESOLUTION, which follows
								// immediately unless the pair's strategy is manual.
								let conflict = Conflict {
									path: c.path.clone(),
									local: c.remote_entry,
									remote: c.local_entry,
									auto_resolution: invert_resolution(c.auto_resolution),
									detected_at: now_ms,
									resolved_at: None,
									applied_resolution: None,
								};
								self.store.put_conflict(&self.pair.pair_id.0, &conflict)?;
							}
						}
						FramePayload::ConflictResolution(r) => {
							if let Some(mut conflict) = self.store.get_conflict(&self.pair.pair_id.0, &r.path)? {
								if conflict.resolved_at.is_none() {
									let mine = invert_resolution(r.resolution);
									self.apply_resolution(&mut conflict, mine, now_ms).await?;
								}
							}
							if self.store.unresolved_conflicts(&self.pair.pair_id.0)?.is_empty() {
								if !self.downloads_outstanding().await {
									self.finalize_with_stats(sync_type, &mut stats, now_ms).await?;
									finalized = true;
									if peer_done {
										self.transition(SessionState::Idle).await;
										self.callbacks.on_stopped();
										return Ok(());
									}
								} else {
									pending_finalize = true;
								}
							}
						}
						FramePayload::Done(_) => {
							peer_done = true;
							if finalized {
								self.transition(SessionState::Idle).await;
								self.callbacks.on_stopped();
								return Ok(());
							}
						}
						FramePayload::Error(e) => {
							if !e.recoverable {
								self.transition(SessionState::Error { recoverable: false }).await;
								return Err(BdpError::Other(e.message));
							}
						}
						FramePayload::Ping(p) => {
							let pong = Envelope::new(
								self.pair.pair_id.0.clone(),
								uuid::Uuid::new_v4().to_string(),
								self.device_id.0.clone(),
								now_ms,
								FramePayload::Pong(p),
							);
							self.transport.send_text(pong.encode()?).await?;
						}
						FramePayload::Pong(_) => {}
						FramePayload::Merkle(_) => {
							// Reserved for a walk_diff-driven incremental entry point;
							// the full-index exchange above already covers every case
							// this would optimize.
						}
					}
				}
			}
		}
	}

	/// Retry wrapper: runs `op`, and on a recoverable error enters
	/// `retrying`, sleeps the exponential backoff, then retries — up to
	/// `max_retries`. Exceeding the cap is `RetryExhausted` (fatal).
	pub async fn with_retry<F, Fut>(&self, mut op: F) -> Result<(), BdpError>
	where
		F: FnMut() -> Fut,
		Fut: std::future::Future<Output = Result<(), BdpError>>,
	{
		loop {
			match op().await {
				Ok(()) => return Ok(()),
				Err(e) if crate::error::is_recoverable(&e) => {
					let mut count = self.retry_count.lock().await;
					*count += 1;
					if *count > self.config.max_retries {
						self.transition(SessionState::Error { recoverable: false }).await;
						return Err(BdpError::RetryExhausted);
					}
					let attempt = *count;
					drop(count);
					self.transition(SessionState::Retrying { attempt }).await;
					sleep(Duration::from_millis(self.config.retry_delay_ms(attempt))).await;
				}
				Err(e) => {
					self.transition(SessionState::Error { recoverable: false }).await;
					return Err(e);
				}
			}
		}
	}

	/// Whether any download is still outstanding: either actively streaming
	/// chunks in (`downloads`) or merely waiting for a concurrency slot
	/// (`pending_downloads`). Finalize must wait on both — a download stuck
	/// in the queue because `max_concurrent_transfers` was saturated is just
	/// as unfinished as one mid-transfer.
	async fn downloads_outstanding(&self) -> bool {
		!self.downloads.lock().await.is_empty() || !self.pending_downloads.lock().await.is_empty()
	}

	/// Pull the running dedup total (accumulated as queued downloads
	/// actually dispatch, possibly after `finalize`'s caller already built
	/// its `stats`) into `stats.bytes_saved_dedup` before sending it on.
	async fn finalize_with_stats(&self, sync_type: SyncType, stats: &mut DoneStats, now_ms: i64) -> Result<(), BdpError> {
		stats.bytes_saved_dedup = *self.bytes_saved_dedup.lock().await;
		self.finalize(sync_type, stats.clone(), now_ms).await
	}

	/// FINALIZE: persist a `SyncHistory` row and send our `DONE`. This does
	/// not itself stop the session — both sides reach FINALIZE independently,
	/// and `drive()` only actually returns once the peer's own `DONE` has
	/// arrived (see the `FramePayload::Done` arm), so a session never stops
	/// listening while the peer might still need it to serve a request.
	pub async fn finalize(&self, sync_type: SyncType, stats: DoneStats, now_ms: i64) -> Result<(), BdpError> {
		self.transition(SessionState::Finalizing).await;

		let root = self.store.get_index_root(&self.pair.pair_id.0)?.unwrap_or_else(|| {
			crate::types::IndexRoot::empty(self.device_id.clone(), now_ms)
		});

		self.store.append_sync_history(&SyncHistoryEntry {
			pair_id: self.pair.pair_id.0.clone(),
			ts: now_ms,
			peer_device_id: self.pair.devices.iter().find(|d| **d != self.device_id).map(|d| d.0.clone()).unwrap_or_default(),
			sync_type: match sync_type {
				SyncType::NoChange => "no_change".to_string(),
				SyncType::Delta => "delta".to_string(),
				SyncType::Full => "full".to_string(),
			},
			new_merkle_root: root.root_hash.clone(),
			files_uploaded: stats.files_uploaded,
			files_downloaded: stats.files_downloaded,
		})?;

		let envelope = Envelope::new(
			self.pair.pair_id.0.clone(),
			uuid::Uuid::new_v4().to_string(),
			self.device_id.0.clone(),
			now_ms,
			FramePayload::Done(DonePayload { stats, new_merkle_root: root.root_hash, new_max_seq: root.max_seq }),
		);
		self.transport.send_text(envelope.encode()?).await
	}

	/// Keepalive: send `PING{nonce}`; caller schedules this every
	/// `ping_interval_ms` and expects a `PONG` echo within two intervals.
	pub async fn send_ping(&self, nonce: String) -> Result<(), BdpError> {
		let envelope = Envelope::new(
			self.pair.pair_id.0.clone(),
			uuid::Uuid::new_v4().to_string(),
			self.device_id.0.clone(),
			0,
			FramePayload::Ping(PingPongPayload { nonce }),
		);
		self.transport.send_text(envelope.encode()?).await
	}

	/// Build an `ERROR` frame for a recoverable or fatal condition.
	pub fn build_error(&self, code: &str, message: &str, recoverable: bool) -> Envelope {
		Envelope::new(
			self.pair.pair_id.0.clone(),
			uuid::Uuid::new_v4().to_string(),
			self.device_id.0.clone(),
			0,
			FramePayload::Error(ErrorPayload { code: code.into(), message: message.into(), recoverable }),
		)
	}

	/// Rebuild the full Merkle tree from scratch (first sync / corruption
	/// recovery / bulk import).
	pub fn rebuild_index(&self, now_ms: i64) -> Result<(), BdpError> {
		compute_root(&self.store, &self.pair.pair_id.0, &self.device_id, now_ms)?;
		Ok(())
	}
}

/// Build a `CONFLICT` frame for a detected conflict.
pub fn build_conflict_frame(pair_id: &str, device_id: &str, conflict: &Conflict, now_ms: i64) -> Envelope {
	Envelope::new(
		pair_id.to_string(),
		uuid::Uuid::new_v4().to_string(),
		device_id.to_string(),
		now_ms,
		FramePayload::Conflict(ConflictPayload {
			path: conflict.path.clone(),
			local_entry: conflict.local.clone(),
			remote_entry: conflict.remote.clone(),
			auto_resolution: conflict.auto_resolution,
		}),
	)
}

/// Build a `CONFLICT_RESOLUTION` frame applying `resolution` to `path`.
pub fn build_conflict_resolution_frame(pair_id: &str, device_id: &str, path: &str, resolution: Resolution, now_ms: i64) -> Envelope {
	Envelope::new(
		pair_id.to_string(),
		uuid::Uuid::new_v4().to_string(),
		device_id.to_string(),
		now_ms,
		FramePayload::ConflictResolution(ConflictResolutionPayload { path: path.to_string(), resolution }),
	)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::collaborators::duplex::DuplexTransport;
	use crate::collaborators::local_fs::LocalFolder;
	use crate::types::PairId;
	use std::sync::atomic::{AtomicU32, Ordering};

	fn test_session(config: Config) -> (tempfile::TempDir, Session<DuplexTransport, LocalFolder, LocalFolder>) {
		let dir = tempfile::tempdir().unwrap();
		let store = Arc::new(Store::open(&dir.path().join("bdp.redb")).unwrap());
		let cas = Arc::new(Cas::new(dir.path().join("cas"), config.compression_threshold, config.compression_ratio_cutoff));
		let pair = SyncPair {
			pair_id: PairId::generate(),
			devices: vec![],
			direction: crate::types::Direction::Bidirectional,
			conflict_strategy: ConflictStrategy::LastWriteWins,
			include_patterns: vec![],
			exclude_patterns: vec![],
			max_file_size_bytes: u64::MAX,
			last_synced_at: None,
		};
		let (transport, _other) = DuplexTransport::pair();
		let session = Session::new(
			config,
			store,
			cas,
			pair,
			DeviceId::generate(),
			Arc::new(transport),
			Arc::new(LocalFolder::new(dir.path().to_path_buf())),
			Arc::new(LocalFolder::new(dir.path().to_path_buf())),
			Arc::new(NoopCallbacks),
		);
		(dir, session)
	}

	fn fast_retry_config() -> Config {
		let mut config = Config::default();
		config.retry_base_delay_ms = 1;
		config.max_retries = 3;
		config
	}

	#[tokio::test]
	async fn with_retry_succeeds_without_retrying() {
		let (_dir, session) = test_session(fast_retry_config());
		let result = session.with_retry(|| async { Ok(()) }).await;
		assert!(result.is_ok());
		assert_eq!(session.current_state().await, SessionState::Idle);
	}

	#[tokio::test]
	async fn with_retry_recovers_after_transient_failures() {
		let (_dir, session) = test_session(fast_retry_config());
		let attempts = AtomicU32::new(0);
		let result = session
			.with_retry(|| {
				let n = attempts.fetch_add(1, Ordering::SeqCst);
				async move {
					if n < 2 {
						Err(BdpError::WriteError("transient".into()))
					} else {
						Ok(())
					}
				}
			})
			.await;
		assert!(result.is_ok());
		assert_eq!(attempts.load(Ordering::SeqCst), 3);
		assert_eq!(*session.retry_count.lock().await, 2);
	}

	#[tokio::test]
	async fn with_retry_exhausts_after_max_retries() {
		let (_dir, session) = test_session(fast_retry_config());
		let result = session.with_retry(|| async { Err(BdpError::WriteError("always fails".into())) }).await;
		assert!(matches!(result, Err(BdpError::RetryExhausted)));
		assert_eq!(session.current_state().await, SessionState::Error { recoverable: false });
	}

	#[tokio::test]
	async fn with_retry_does_not_retry_non_recoverable_errors() {
		let (_dir, session) = test_session(fast_retry_config());
		let result = session.with_retry(|| async { Err(BdpError::PairNotFound("p".into())) }).await;
		assert!(matches!(result, Err(BdpError::PairNotFound(_))));
		assert_eq!(*session.retry_count.lock().await, 0);
	}

	fn announcement(root: Option<&str>, index_id: &str) -> PairAnnouncement {
		PairAnnouncement {
			pair_id: "p".into(),
			merkle_root: root.map(|s| s.to_string()),
			max_seq: 0,
			index_id: index_id.into(),
		}
	}

	#[test]
	fn identical_roots_fast_path_to_no_change() {
		let decision = greeting_decision(Some("h"), "idx1", &announcement(Some("h"), "idx1"));
		assert_eq!(decision, SyncType::NoChange);
	}

	#[test]
	fn shared_index_id_with_differing_root_is_delta_sync() {
		let decision = greeting_decision(Some("h1"), "idx1", &announcement(Some("h2"), "idx1"));
		assert_eq!(decision, SyncType::Delta);
	}

	#[test]
	fn missing_index_id_forces_full_sync() {
		let decision = greeting_decision(None, "", &announcement(None, "idx-remote"));
		assert_eq!(decision, SyncType::Full);
	}

	#[test]
	fn differing_index_ids_force_full_sync() {
		let decision = greeting_decision(Some("h1"), "idx1", &announcement(Some("h2"), "idx2"));
		assert_eq!(decision, SyncType::Full);
	}

	#[test]
	fn retry_state_carries_attempt_number() {
		let state = SessionState::Retrying { attempt: 3 };
		assert_eq!(state, SessionState::Retrying { attempt: 3 });
		assert_ne!(state, SessionState::Retrying { attempt: 2 });
	}
}

// vim: ts=4
