//! Content chunking and hashing (§4.4).
//!
//! Chunks are fixed-size slices of the file starting at offset 0; the last
//! chunk may be shorter. Each chunk's SHA-256 is computed, and the ordered
//! list becomes the file's `chunkHashes`. The whole-file hash is SHA-256
//! over the full content, not a hash of hashes.

use sha2::{Digest, Sha256};

/// Result of chunking and hashing a file's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedContent {
	pub chunk_hashes: Vec<String>,
	pub whole_hash: String,
}

/// Split `content` into fixed-size chunks of `chunk_size` bytes and hash
/// each, plus the whole file. An empty input produces a single chunk hash
/// equal to the SHA-256 of the empty string.
pub fn hash_content(content: &[u8], chunk_size: u64) -> HashedContent {
	let chunk_size = chunk_size.max(1) as usize;

	let whole_hash = hex::encode(Sha256::digest(content));

	if content.is_empty() {
		return HashedContent {
			chunk_hashes: vec![whole_hash.clone()],
			whole_hash,
		};
	}

	let chunk_hashes = content
		.chunks(chunk_size)
		.map(|chunk| hex::encode(Sha256::digest(chunk)))
		.collect();

	HashedContent { chunk_hashes, whole_hash }
}

/// Split `content` into the raw chunk byte slices, in order, at the given
/// fixed size. Used by the session's upload path to read chunks by index
/// without re-deriving offsets elsewhere.
pub fn split_chunks(content: &[u8], chunk_size: u64) -> Vec<&[u8]> {
	let chunk_size = chunk_size.max(1) as usize;
	if content.is_empty() {
		return vec![&content[0..0]];
	}
	content.chunks(chunk_size).collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_content_hashes_to_single_empty_chunk() {
		let hashed = hash_content(&[], 65536);
		assert_eq!(hashed.chunk_hashes.len(), 1);
		assert_eq!(hashed.chunk_hashes[0], hashed.whole_hash);
		assert_eq!(hashed.whole_hash, hex::encode(Sha256::digest(b"")));
	}

	#[test]
	fn hello_hashes_to_known_sha256() {
		let hashed = hash_content(b"hello", 65536);
		assert_eq!(
			hashed.whole_hash,
			"2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
		);
		assert_eq!(hashed.chunk_hashes.len(), 1);
		assert_eq!(hashed.chunk_hashes[0], hashed.whole_hash);
	}

	#[test]
	fn multi_chunk_content_produces_one_hash_per_chunk() {
		let content = vec![0xABu8; 150];
		let hashed = hash_content(&content, 64);
		assert_eq!(hashed.chunk_hashes.len(), 3);
		assert_eq!(hashed.chunk_hashes[2], hex::encode(Sha256::digest(&content[128..150])));
	}

	#[test]
	fn split_chunks_matches_hash_count() {
		let content = vec![1u8; 200];
		let chunks = split_chunks(&content, 64);
		let hashed = hash_content(&content, 64);
		assert_eq!(chunks.len(), hashed.chunk_hashes.len());
		assert_eq!(chunks.iter().map(|c| c.len()).sum::<usize>(), 200);
	}

	#[test]
	fn split_chunks_of_empty_is_one_empty_slice() {
		let chunks = split_chunks(&[], 65536);
		assert_eq!(chunks.len(), 1);
		assert_eq!(chunks[0].len(), 0);
	}
}

// vim: ts=4
