//! External collaborator traits (§6): `FolderSource`, `FolderSink`, and the
//! bidirectional message `Transport`. These are injected by the host
//! application; this crate only depends on their trait surface.

use async_trait::async_trait;

use crate::error::BdpError;
use crate::index::ScannedFile;

/// A file enumerated by a `FolderSource`, with its content available for
/// hashing.
pub struct SourceEntry {
	pub path: String,
	pub content: Vec<u8>,
	pub mtime: i64,
}

/// Enumerates and hashes local files. Injected; not implemented by this
/// crate beyond a reference local-filesystem adapter used in tests.
#[async_trait]
pub trait FolderSource: Send + Sync {
	/// Enumerate every file currently present.
	async fn scan(&self) -> Result<Vec<SourceEntry>, BdpError>;

	/// Read a single file's content for (re-)hashing.
	async fn read(&self, path: &str) -> Result<Vec<u8>, BdpError>;
}

impl SourceEntry {
	pub fn as_scanned(&self) -> ScannedFile {
		ScannedFile { path: self.path.clone(), size: self.content.len() as u64, mtime: self.mtime }
	}
}

/// Materializes received files and applies deletes. Injected.
#[async_trait]
pub trait FolderSink: Send + Sync {
	/// Write `path`'s full content (already reassembled from ordered
	/// chunks) to the destination, returning an error on local failure.
	async fn write(&self, path: &str, content: &[u8]) -> Result<(), BdpError>;

	/// Delete `path` from the destination (tombstone propagation).
	async fn delete(&self, path: &str) -> Result<(), BdpError>;

	/// List every file currently materialized at the destination.
	async fn list(&self) -> Result<Vec<SourceEntry>, BdpError>;
}

/// A reliable, in-order, bidirectional message channel. The core assumes
/// UTF-8 text messages for control frames and binary messages up to at
/// least 256 KiB for chunk frames.
#[async_trait]
pub trait Transport: Send + Sync {
	async fn send_text(&self, message: String) -> Result<(), BdpError>;
	async fn send_binary(&self, message: Vec<u8>) -> Result<(), BdpError>;

	/// Receive the next message. Returns `None` when the channel has
	/// closed (§7 `TransportClosed`).
	async fn recv(&self) -> Result<Option<WireMessage>, BdpError>;
}

/// A message received from the transport, not yet validated as BDP.
pub enum WireMessage {
	Text(String),
	Binary(Vec<u8>),
}

/// A local-filesystem-backed `FolderSource`/`FolderSink`, used by the
/// integration tests to exercise two in-process peers against real
/// directories.
pub mod local_fs {
	use super::*;
	use std::path::PathBuf;

	/// Name of the engine's own metadata directory (redb database + CAS
	/// blob shards), excluded from every walk so the live store is never
	/// enumerated, hashed, or overwritten as an ordinary synced file.
	pub const METADATA_DIR_NAME: &str = ".bdp";

	pub struct LocalFolder {
		root: PathBuf,
	}

	impl LocalFolder {
		pub fn new(root: impl Into<PathBuf>) -> Self {
			LocalFolder { root: root.into() }
		}

		fn abs(&self, path: &str) -> PathBuf {
			self.root.join(path)
		}

		fn walk(&self) -> Result<Vec<(String, PathBuf)>, BdpError> {
			let mut out = Vec::new();
			let mut stack = vec![self.root.clone()];
			while let Some(dir) = stack.pop() {
				for entry in std::fs::read_dir(&dir)? {
					let entry = entry?;
					let path = entry.path();
					if path.file_name().map(|n| n == METADATA_DIR_NAME).unwrap_or(false) {
						continue;
					}
					if path.is_dir() {
						stack.push(path);
					} else {
						let rel = path.strip_prefix(&self.root).unwrap().to_string_lossy().replace('\\', "/");
						out.push((rel, path));
					}
				}
			}
			Ok(out)
		}
	}

	#[async_trait]
	impl FolderSource for LocalFolder {
		async fn scan(&self) -> Result<Vec<SourceEntry>, BdpError> {
			let mut out = Vec::new();
			for (rel, abs) in self.walk()? {
				let content = std::fs::read(&abs)?;
				let mtime = std::fs::metadata(&abs)?
					.modified()
					.ok()
					.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
					.map(|d| d.as_millis() as i64)
					.unwrap_or(0);
				out.push(SourceEntry { path: rel, content, mtime });
			}
			Ok(out)
		}

		async fn read(&self, path: &str) -> Result<Vec<u8>, BdpError> {
			Ok(std::fs::read(self.abs(path))?)
		}
	}

	#[async_trait]
	impl FolderSink for LocalFolder {
		async fn write(&self, path: &str, content: &[u8]) -> Result<(), BdpError> {
			let dest = self.abs(path);
			if let Some(parent) = dest.parent() {
				std::fs::create_dir_all(parent)?;
			}
			std::fs::write(dest, content)?;
			Ok(())
		}

		async fn delete(&self, path: &str) -> Result<(), BdpError> {
			let dest = self.abs(path);
			match std::fs::remove_file(&dest) {
				Ok(()) => Ok(()),
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
				Err(e) => Err(e.into()),
			}
		}

		async fn list(&self) -> Result<Vec<SourceEntry>, BdpError> {
			self.scan().await
		}
	}
}

/// An in-process, in-memory `Transport` pair, used to run two `Session`s
/// against each other without any real network — the local 2-way `sync`
/// CLI subcommand and the integration tests both run on this.
pub mod duplex {
	use super::*;
	use tokio::sync::mpsc;

	pub struct DuplexTransport {
		tx: mpsc::UnboundedSender<WireMessage>,
		rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<WireMessage>>,
	}

	impl DuplexTransport {
		/// Build a linked pair: whatever side A sends, side B receives, and
		/// vice versa.
		pub fn pair() -> (Self, Self) {
			let (tx_a, rx_b) = mpsc::unbounded_channel();
			let (tx_b, rx_a) = mpsc::unbounded_channel();
			(
				DuplexTransport { tx: tx_a, rx: tokio::sync::Mutex::new(rx_a) },
				DuplexTransport { tx: tx_b, rx: tokio::sync::Mutex::new(rx_b) },
			)
		}
	}

	#[async_trait]
	impl Transport for DuplexTransport {
		async fn send_text(&self, message: String) -> Result<(), BdpError> {
			self.tx.send(WireMessage::Text(message)).map_err(|_| BdpError::TransportClosed)
		}

		async fn send_binary(&self, message: Vec<u8>) -> Result<(), BdpError> {
			self.tx.send(WireMessage::Binary(message)).map_err(|_| BdpError::TransportClosed)
		}

		async fn recv(&self) -> Result<Option<WireMessage>, BdpError> {
			Ok(self.rx.lock().await.recv().await)
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[tokio::test]
		async fn text_sent_on_one_end_arrives_on_the_other() {
			let (a, b) = DuplexTransport::pair();
			a.send_text("hello".into()).await.unwrap();
			match b.recv().await.unwrap() {
				Some(WireMessage::Text(s)) => assert_eq!(s, "hello"),
				other => panic!("unexpected message: {:?}", other.is_some()),
			}
		}

		#[tokio::test]
		async fn binary_sent_on_one_end_arrives_on_the_other() {
			let (a, b) = DuplexTransport::pair();
			a.send_binary(vec![1, 2, 3]).await.unwrap();
			match b.recv().await.unwrap() {
				Some(WireMessage::Binary(bytes)) => assert_eq!(bytes, vec![1, 2, 3]),
				other => panic!("unexpected message: {:?}", other.is_some()),
			}
		}

		#[tokio::test]
		async fn recv_returns_none_after_sender_dropped() {
			let (a, b) = DuplexTransport::pair();
			drop(a);
			assert!(b.recv().await.unwrap().is_none());
		}
	}
}

#[cfg(test)]
mod tests {
	use super::local_fs::LocalFolder;
	use super::*;

	#[tokio::test]
	async fn local_folder_write_then_scan_roundtrips() {
		let dir = tempfile::tempdir().unwrap();
		let folder = LocalFolder::new(dir.path());
		folder.write("a/b.txt", b"hello").await.unwrap();

		let scanned = folder.scan().await.unwrap();
		assert_eq!(scanned.len(), 1);
		assert_eq!(scanned[0].path, "a/b.txt");
		assert_eq!(scanned[0].content, b"hello");
	}

	#[tokio::test]
	async fn local_folder_delete_removes_file() {
		let dir = tempfile::tempdir().unwrap();
		let folder = LocalFolder::new(dir.path());
		folder.write("a.txt", b"x").await.unwrap();
		folder.delete("a.txt").await.unwrap();
		assert!(folder.scan().await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn local_folder_delete_of_missing_file_is_ok() {
		let dir = tempfile::tempdir().unwrap();
		let folder = LocalFolder::new(dir.path());
		assert!(folder.delete("missing.txt").await.is_ok());
	}
}

// vim: ts=4
