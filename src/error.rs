//! Crate-wide error types
//!
//! A manually implemented error taxonomy, mirroring the kinds called out in
//! the protocol's error handling design: decode failures, missing data,
//! write failures, hash mismatches, transport loss, and retry exhaustion.

use std::fmt;
use std::io;

/// Top-level error type returned by every public operation in this crate.
#[derive(Debug)]
pub enum BdpError {
	/// A frame failed to decode (malformed JSON, bad envelope, bad chunk header).
	Decode(String),
	/// A chunk or entry lookup found nothing.
	NotFound(String),
	/// A CAS or FolderSink write failed.
	WriteError(String),
	/// A materialized file's hash did not match the expected content hash.
	HashMismatch { expected: String, actual: String },
	/// The transport channel closed unexpectedly.
	TransportClosed,
	/// The remote peer does not know our pair id.
	PairNotFound(String),
	/// The FolderSink rejected a write due to permissions.
	PermissionDenied(String),
	/// More than `MAX_RETRIES` transient failures occurred.
	RetryExhausted,
	/// The operation was cancelled by the caller.
	Cancelled,
	/// Underlying I/O error.
	Io(io::Error),
	/// Underlying KV store error.
	Store(StoreError),
	/// Underlying CAS error.
	Cas(CasError),
	/// Catch-all for errors not worth a dedicated variant.
	Other(String),
}

impl fmt::Display for BdpError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			BdpError::Decode(msg) => write!(f, "decode error: {}", msg),
			BdpError::NotFound(what) => write!(f, "not found: {}", what),
			BdpError::WriteError(msg) => write!(f, "write error: {}", msg),
			BdpError::HashMismatch { expected, actual } => {
				write!(f, "hash mismatch: expected {}, got {}", expected, actual)
			}
			BdpError::TransportClosed => write!(f, "transport closed"),
			BdpError::PairNotFound(pair_id) => write!(f, "pair not found: {}", pair_id),
			BdpError::PermissionDenied(msg) => write!(f, "permission denied: {}", msg),
			BdpError::RetryExhausted => write!(f, "retry exhausted"),
			BdpError::Cancelled => write!(f, "cancelled"),
			BdpError::Io(e) => write!(f, "I/O error: {}", e),
			BdpError::Store(e) => write!(f, "store error: {}", e),
			BdpError::Cas(e) => write!(f, "CAS error: {}", e),
			BdpError::Other(msg) => write!(f, "{}", msg),
		}
	}
}

impl std::error::Error for BdpError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			BdpError::Io(e) => Some(e),
			BdpError::Store(e) => Some(e),
			BdpError::Cas(e) => Some(e),
			_ => None,
		}
	}
}

impl From<io::Error> for BdpError {
	fn from(e: io::Error) -> Self {
		BdpError::Io(e)
	}
}

impl From<String> for BdpError {
	fn from(e: String) -> Self {
		BdpError::Other(e)
	}
}

impl From<&str> for BdpError {
	fn from(e: &str) -> Self {
		BdpError::Other(e.to_string())
	}
}

impl From<serde_json::Error> for BdpError {
	fn from(e: serde_json::Error) -> Self {
		BdpError::Decode(e.to_string())
	}
}

impl From<StoreError> for BdpError {
	fn from(e: StoreError) -> Self {
		BdpError::Store(e)
	}
}

impl From<CasError> for BdpError {
	fn from(e: CasError) -> Self {
		BdpError::Cas(e)
	}
}

/// Whether an error should be surfaced to the peer as `ERROR{recoverable}`
/// and drive the session into `retrying`, or is fatal and stops the session.
pub fn is_recoverable(err: &BdpError) -> bool {
	match err {
		BdpError::WriteError(_) | BdpError::HashMismatch { .. } | BdpError::NotFound(_) => true,
		BdpError::TransportClosed
		| BdpError::PairNotFound(_)
		| BdpError::PermissionDenied(_)
		| BdpError::RetryExhausted
		| BdpError::Cancelled => false,
		BdpError::Decode(_) => true,
		_ => false,
	}
}

fn boxed_error<E: std::error::Error + 'static>(e: E) -> BdpError {
	BdpError::Other(e.to_string())
}

/// Errors from the persistent KV store (C1).
#[derive(Debug)]
pub enum StoreError {
	AlreadyOpen(String),
	Backend(String),
	Corrupt(String),
}

impl fmt::Display for StoreError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StoreError::AlreadyOpen(path) => write!(f, "store already open: {}", path),
			StoreError::Backend(msg) => write!(f, "store backend error: {}", msg),
			StoreError::Corrupt(msg) => write!(f, "store corrupt: {}", msg),
		}
	}
}

impl std::error::Error for StoreError {}

impl From<redb::Error> for StoreError {
	fn from(e: redb::Error) -> Self {
		StoreError::Backend(e.to_string())
	}
}

impl From<redb::DatabaseError> for StoreError {
	fn from(e: redb::DatabaseError) -> Self {
		match e {
			redb::DatabaseError::DatabaseAlreadyOpen => {
				StoreError::AlreadyOpen("database already open".into())
			}
			other => StoreError::Backend(other.to_string()),
		}
	}
}

impl From<redb::TransactionError> for StoreError {
	fn from(e: redb::TransactionError) -> Self {
		StoreError::Backend(e.to_string())
	}
}

impl From<redb::TableError> for StoreError {
	fn from(e: redb::TableError) -> Self {
		StoreError::Backend(e.to_string())
	}
}

impl From<redb::CommitError> for StoreError {
	fn from(e: redb::CommitError) -> Self {
		StoreError::Backend(e.to_string())
	}
}

impl From<redb::StorageError> for StoreError {
	fn from(e: redb::StorageError) -> Self {
		StoreError::Backend(e.to_string())
	}
}

impl From<serde_json::Error> for StoreError {
	fn from(e: serde_json::Error) -> Self {
		StoreError::Corrupt(boxed_error(e).to_string())
	}
}

/// Errors from the content-addressable store (C2).
#[derive(Debug)]
pub enum CasError {
	NotFound(String),
	Io(io::Error),
}

impl fmt::Display for CasError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			CasError::NotFound(hash) => write!(f, "chunk not found: {}", hash),
			CasError::Io(e) => write!(f, "I/O error: {}", e),
		}
	}
}

impl std::error::Error for CasError {}

impl From<io::Error> for CasError {
	fn from(e: io::Error) -> Self {
		CasError::Io(e)
	}
}

// vim: ts=4
