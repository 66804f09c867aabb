//! Content-Addressable Store (C2).
//!
//! Chunks are stored under a two-character shard prefix of their lowercase
//! hex hash, each blob prefixed by a single compression-tag byte (`0x00`
//! raw, `0x01` deflate). Compression is attempted only above the
//! configured threshold and kept only if it actually shrinks the chunk
//! below the configured cutoff. All writes serialize on a process-wide
//! named lock (`cas-write`); reads are lockless.

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::CasError;

const TAG_RAW: u8 = 0x00;
const TAG_DEFLATE: u8 = 0x01;

/// Outcome of storing a chunk: how it ended up on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
	pub original_size: u64,
	pub stored_size: u64,
	pub stored_compressed: bool,
}

/// On-disk blob store, sharded by the first two hex characters of the hash.
pub struct Cas {
	root: PathBuf,
	compression_threshold: u64,
	compression_ratio_cutoff: f64,
	write_lock: AsyncMutex<()>,
	fail_next_put: AtomicBool,
}

impl Cas {
	pub fn new(root: impl Into<PathBuf>, compression_threshold: u64, compression_ratio_cutoff: f64) -> Self {
		Cas {
			root: root.into(),
			compression_threshold,
			compression_ratio_cutoff,
			write_lock: AsyncMutex::new(()),
			fail_next_put: AtomicBool::new(false),
		}
	}

	/// Test-only fault injection: makes the very next `put` call fail with
	/// a synthetic I/O error (then clears itself), so the session's retry
	/// path can be exercised without relying on real filesystem faults.
	pub fn inject_write_failure(&self) {
		self.fail_next_put.store(true, Ordering::SeqCst);
	}

	fn shard_path(&self, hash: &str) -> PathBuf {
		let (prefix, rest) = hash.split_at(2.min(hash.len()));
		self.root.join(prefix).join(rest)
	}

	/// Compute the SHA-256 hex digest of `bytes`.
	pub fn hash_of(bytes: &[u8]) -> String {
		hex::encode(Sha256::digest(bytes))
	}

	/// Store `bytes` under `hash`. A no-op if the hash is already present
	/// (content-addressing guarantees identical content already stored).
	/// If `already_compressed` is true, `bytes` is stored verbatim under
	/// the deflate tag without attempting to compress again.
	pub async fn put(&self, hash: &str, bytes: &[u8], already_compressed: bool) -> Result<PutOutcome, CasError> {
		let _guard = self.write_lock.lock().await;

		if self.fail_next_put.swap(false, Ordering::SeqCst) {
			return Err(CasError::Io(std::io::Error::new(std::io::ErrorKind::Other, "injected write failure")));
		}

		let path = self.shard_path(hash);

		if path.exists() {
			let stored_size = std::fs::metadata(&path)?.len();
			return Ok(PutOutcome {
				original_size: bytes.len() as u64,
				stored_size,
				stored_compressed: first_byte(&path)? == TAG_DEFLATE,
			});
		}

		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)?;
		}

		let (tag, payload): (u8, Vec<u8>) = if already_compressed {
			(TAG_DEFLATE, bytes.to_vec())
		} else if (bytes.len() as u64) >= self.compression_threshold {
			let compressed = deflate(bytes);
			if (compressed.len() as f64) < (bytes.len() as f64) * self.compression_ratio_cutoff {
				(TAG_DEFLATE, compressed)
			} else {
				(TAG_RAW, bytes.to_vec())
			}
		} else {
			(TAG_RAW, bytes.to_vec())
		};

		let tmp = path.with_extension("tmp");
		{
			let mut f = std::fs::File::create(&tmp)?;
			f.write_all(&[tag])?;
			f.write_all(&payload)?;
		}
		std::fs::rename(&tmp, &path)?;

		Ok(PutOutcome {
			original_size: bytes.len() as u64,
			stored_size: payload.len() as u64 + 1,
			stored_compressed: tag == TAG_DEFLATE,
		})
	}

	/// Fetch the original (decompressed) bytes for `hash`.
	pub fn get(&self, hash: &str) -> Result<Vec<u8>, CasError> {
		let path = self.shard_path(hash);
		let mut raw = std::fs::read(&path).map_err(|e| {
			if e.kind() == std::io::ErrorKind::NotFound {
				CasError::NotFound(hash.to_string())
			} else {
				CasError::Io(e)
			}
		})?;
		if raw.is_empty() {
			return Err(CasError::NotFound(hash.to_string()));
		}
		let tag = raw.remove(0);
		match tag {
			TAG_RAW => Ok(raw),
			TAG_DEFLATE => {
				let mut decoder = DeflateDecoder::new(raw.as_slice());
				let mut out = Vec::new();
				decoder.read_to_end(&mut out)?;
				Ok(out)
			}
			_ => Err(CasError::Io(std::io::Error::new(
				std::io::ErrorKind::InvalidData,
				"unknown compression tag",
			))),
		}
	}

	pub fn has(&self, hash: &str) -> bool {
		self.shard_path(hash).exists()
	}

	pub fn delete(&self, hash: &str) -> Result<(), CasError> {
		let path = self.shard_path(hash);
		match std::fs::remove_file(&path) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(CasError::Io(e)),
		}
	}

	/// Record a new reference to `hash` in the index (C1), creating the
	/// `CasChunk` row if this is the first reference.
	pub fn inc_ref(
		&self,
		store: &crate::store::Store,
		hash: &str,
		orig_size: u64,
		stored_size: u64,
		stored_compressed: bool,
		now_ms: i64,
	) -> Result<(), CasError> {
		let mut chunk = store
			.get_cas_chunk(hash)
			.map_err(|e| CasError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?
			.unwrap_or_else(|| crate::types::CasChunk {
				hash: hash.to_string(),
				original_size: orig_size,
				stored_size,
				stored_compressed,
				ref_count: 0,
				created_at: now_ms,
				last_accessed_at: now_ms,
			});
		chunk.ref_count += 1;
		chunk.last_accessed_at = now_ms;
		store
			.put_cas_chunk(&chunk)
			.map_err(|e| CasError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))
	}

	/// Release one reference to `hash`. Does not delete the blob; callers
	/// run [`Cas::reclaim`] to batch-delete zero-refcount chunks.
	pub fn dec_ref(&self, store: &crate::store::Store, hash: &str) -> Result<(), CasError> {
		if let Some(mut chunk) = store
			.get_cas_chunk(hash)
			.map_err(|e| CasError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?
		{
			chunk.ref_count = chunk.ref_count.saturating_sub(1);
			store
				.put_cas_chunk(&chunk)
				.map_err(|e| CasError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
		}
		Ok(())
	}

	/// Delete every chunk (blob + index row) whose refcount has reached
	/// zero. Returns the number reclaimed.
	pub fn reclaim(&self, store: &crate::store::Store) -> Result<usize, CasError> {
		let zero = store
			.zero_ref_chunks()
			.map_err(|e| CasError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
		let mut count = 0;
		for chunk in zero {
			self.delete(&chunk.hash)?;
			store
				.delete_cas_chunk(&chunk.hash)
				.map_err(|e| CasError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;
			count += 1;
		}
		Ok(count)
	}
}

fn first_byte(path: &Path) -> Result<u8, CasError> {
	let mut f = std::fs::File::open(path)?;
	let mut buf = [0u8; 1];
	f.read_exact(&mut buf)?;
	Ok(buf[0])
}

fn deflate(bytes: &[u8]) -> Vec<u8> {
	let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
	// In-memory Vec writer; write_all cannot fail.
	encoder.write_all(bytes).expect("compressing to an in-memory buffer cannot fail");
	encoder.finish().expect("finishing an in-memory deflate stream cannot fail")
}

#[cfg(test)]
mod tests {
	use super::*;

	fn temp_cas() -> (tempfile::TempDir, Cas) {
		let dir = tempfile::tempdir().unwrap();
		let cas = Cas::new(dir.path(), 4096, 0.90);
		(dir, cas)
	}

	#[tokio::test]
	async fn put_then_get_roundtrips_content() {
		let (_dir, cas) = temp_cas();
		let bytes = b"hello world".to_vec();
		let hash = Cas::hash_of(&bytes);
		cas.put(&hash, &bytes, false).await.unwrap();
		assert_eq!(cas.get(&hash).unwrap(), bytes);
	}

	#[tokio::test]
	async fn get_missing_hash_is_not_found() {
		let (_dir, cas) = temp_cas();
		let err = cas.get("deadbeef").unwrap_err();
		assert!(matches!(err, CasError::NotFound(_)));
	}

	#[tokio::test]
	async fn put_is_idempotent_for_identical_content() {
		let (_dir, cas) = temp_cas();
		let bytes = vec![7u8; 1000];
		let hash = Cas::hash_of(&bytes);
		let first = cas.put(&hash, &bytes, false).await.unwrap();
		let second = cas.put(&hash, &bytes, false).await.unwrap();
		assert_eq!(first.stored_size, second.stored_size);
		assert_eq!(cas.get(&hash).unwrap(), bytes);
	}

	#[tokio::test]
	async fn highly_compressible_large_chunk_is_stored_compressed() {
		let (_dir, cas) = temp_cas();
		let bytes = vec![0u8; 100_000];
		let hash = Cas::hash_of(&bytes);
		let outcome = cas.put(&hash, &bytes, false).await.unwrap();
		assert!(outcome.stored_compressed);
		assert!(outcome.stored_size < bytes.len() as u64);
		assert_eq!(cas.get(&hash).unwrap(), bytes);
	}

	#[tokio::test]
	async fn small_chunk_under_threshold_is_not_compressed() {
		let (_dir, cas) = temp_cas();
		let bytes = vec![0u8; 100];
		let hash = Cas::hash_of(&bytes);
		let outcome = cas.put(&hash, &bytes, false).await.unwrap();
		assert!(!outcome.stored_compressed);
	}

	#[tokio::test]
	async fn incompressible_content_above_threshold_falls_back_to_raw() {
		let (_dir, cas) = temp_cas();
		// Pseudo-random bytes via a simple LCG: not deflate-friendly.
		let mut bytes = Vec::with_capacity(5000);
		let mut x: u32 = 12345;
		for _ in 0..5000 {
			x = x.wrapping_mul(1103515245).wrapping_add(12345);
			bytes.push((x >> 16) as u8);
		}
		let hash = Cas::hash_of(&bytes);
		cas.put(&hash, &bytes, false).await.unwrap();
		assert_eq!(cas.get(&hash).unwrap(), bytes);
	}

	#[tokio::test]
	async fn delete_then_has_is_false() {
		let (_dir, cas) = temp_cas();
		let bytes = b"x".to_vec();
		let hash = Cas::hash_of(&bytes);
		cas.put(&hash, &bytes, false).await.unwrap();
		assert!(cas.has(&hash));
		cas.delete(&hash).unwrap();
		assert!(!cas.has(&hash));
	}

	#[tokio::test]
	async fn shard_layout_uses_two_char_prefix_directory() {
		let (dir, cas) = temp_cas();
		let bytes = b"shard me".to_vec();
		let hash = Cas::hash_of(&bytes);
		cas.put(&hash, &bytes, false).await.unwrap();
		let expected = dir.path().join(&hash[0..2]).join(&hash[2..]);
		assert!(expected.exists());
	}

	#[tokio::test]
	async fn dedup_then_reclaim_removes_blob_once_unreferenced() {
		let (_dir, cas) = temp_cas();
		let store_dir = tempfile::tempdir().unwrap();
		let store = crate::store::Store::open(&store_dir.path().join("s.redb")).unwrap();

		let bytes = vec![3u8; 10_000];
		let hash = Cas::hash_of(&bytes);

		// Two independent puts of identical content: one blob, two refs.
		let out1 = cas.put(&hash, &bytes, false).await.unwrap();
		cas.inc_ref(&store, &hash, out1.original_size, out1.stored_size, out1.stored_compressed, 1).unwrap();
		let out2 = cas.put(&hash, &bytes, false).await.unwrap();
		cas.inc_ref(&store, &hash, out2.original_size, out2.stored_size, out2.stored_compressed, 2).unwrap();

		assert_eq!(store.get_cas_chunk(&hash).unwrap().unwrap().ref_count, 2);

		cas.dec_ref(&store, &hash).unwrap();
		assert!(cas.has(&hash), "blob survives while refcount > 0");

		cas.dec_ref(&store, &hash).unwrap();
		assert_eq!(store.get_cas_chunk(&hash).unwrap().unwrap().ref_count, 0);
		assert!(cas.has(&hash), "reclaim is batch, not eager on decRef");

		let reclaimed = cas.reclaim(&store).unwrap();
		assert_eq!(reclaimed, 1);
		assert!(!cas.has(&hash));
		assert!(store.get_cas_chunk(&hash).unwrap().is_none());
	}
}

// vim: ts=4
