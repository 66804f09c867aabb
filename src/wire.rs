//! Wire codec (C7): the tagged-union framed protocol of §4.7.
//!
//! Control frames are UTF-8 JSON text; chunk frames are binary with layout
//! `[u16 BE header length][header UTF-8 JSON][raw chunk bytes]`. Every
//! frame shares the envelope `{cp, v, type, pairId, msgId, fromDeviceId,
//! ts, payload}`; `cp: true` is a cheap fast-discriminant for rejecting
//! non-BDP traffic on a shared channel before any real parsing happens.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BdpError;
use crate::types::{FileEntry, Resolution};

pub const PROTOCOL_VERSION: u32 = 1;

/// Quick pre-parse check: is this plausibly a BDP message? For text, looks
/// for the `"cp":true` substring without a full parse; for binary, accepts
/// anything over 4 bytes (full validation happens on decode).
pub fn looks_like_bdp_text(s: &str) -> bool {
	s.contains("\"cp\":true") || s.contains("\"cp\": true")
}

pub fn looks_like_bdp_binary(bytes: &[u8]) -> bool {
	bytes.len() > 4
}

/// The 13 closed frame variants, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum FramePayload {
	#[serde(rename = "HELLO")]
	Hello(HelloPayload),
	#[serde(rename = "MERKLE")]
	Merkle(MerklePayload),
	#[serde(rename = "INDEX_REQUEST")]
	IndexRequest(IndexRequestPayload),
	#[serde(rename = "INDEX_RESPONSE")]
	IndexResponse(IndexResponsePayload),
	#[serde(rename = "CHUNK_REQUEST")]
	ChunkRequest(ChunkRequestPayload),
	#[serde(rename = "ACK")]
	Ack(AckPayload),
	#[serde(rename = "CONFLICT")]
	Conflict(ConflictPayload),
	#[serde(rename = "CONFLICT_RESOLUTION")]
	ConflictResolution(ConflictResolutionPayload),
	#[serde(rename = "DONE")]
	Done(DonePayload),
	#[serde(rename = "ERROR")]
	Error(ErrorPayload),
	#[serde(rename = "PING")]
	Ping(PingPongPayload),
	#[serde(rename = "PONG")]
	Pong(PingPongPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PairAnnouncement {
	pub pair_id: String,
	pub merkle_root: Option<String>,
	pub max_seq: u64,
	pub index_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
	pub device_name: String,
	pub capabilities: Vec<String>,
	pub public_key_b64: Option<String>,
	pub pairs: Vec<PairAnnouncement>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MerklePayload {
	pub node_path: String,
	pub node_hash: String,
	pub child_hashes: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexRequestPayload {
	pub since_seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexResponsePayload {
	pub entries: Vec<FileEntry>,
	pub is_complete: bool,
	pub total_entries: u64,
	pub sender_max_seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRequestPayload {
	pub transfer_id: String,
	pub path: String,
	pub have_chunks: Vec<String>,
	pub need_chunks: Vec<String>,
	pub total_chunks: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
	Ok,
	WriteError,
	HashMismatch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
	pub transfer_id: String,
	pub path: String,
	pub status: AckStatus,
	pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictPayload {
	pub path: String,
	pub local_entry: FileEntry,
	pub remote_entry: FileEntry,
	pub auto_resolution: Resolution,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolutionPayload {
	pub path: String,
	pub resolution: Resolution,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DoneStats {
	pub files_uploaded: u64,
	pub files_downloaded: u64,
	pub files_skipped: u64,
	pub bytes_transferred: u64,
	/// Sum of the original sizes of chunks a download needed but already
	/// held in local CAS, i.e. bytes the transfer avoided re-fetching
	/// (§9 Q3: precise accounting, not size/chunk-count division).
	pub bytes_saved_dedup: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DonePayload {
	pub stats: DoneStats,
	pub new_merkle_root: String,
	pub new_max_seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
	pub code: String,
	pub message: String,
	pub recoverable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PingPongPayload {
	pub nonce: String,
}

/// The shared envelope wrapping every control frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
	pub cp: bool,
	pub v: u32,
	pub pair_id: String,
	pub msg_id: String,
	pub from_device_id: String,
	pub ts: i64,
	#[serde(flatten)]
	pub frame: FramePayload,
}

impl Envelope {
	pub fn new(pair_id: String, msg_id: String, from_device_id: String, ts: i64, frame: FramePayload) -> Self {
		Envelope { cp: true, v: PROTOCOL_VERSION, pair_id, msg_id, from_device_id, ts, frame }
	}

	/// Encode as a control (text JSON) frame.
	pub fn encode(&self) -> Result<String, BdpError> {
		serde_json::to_string(self).map_err(BdpError::from)
	}

	/// Decode a control frame. Fails with `BdpError::Decode` on malformed
	/// or non-BDP input; callers should log and drop rather than kill the
	/// session (§7).
	pub fn decode(text: &str) -> Result<Self, BdpError> {
		let value: Value = serde_json::from_str(text)?;
		if value.get("cp") != Some(&Value::Bool(true)) {
			return Err(BdpError::Decode("missing cp:true discriminant".into()));
		}
		serde_json::from_value(value).map_err(|e| BdpError::Decode(e.to_string()))
	}
}

/// Header of a binary CHUNK frame (the payload following the 2-byte length
/// prefix). The raw chunk bytes follow the header JSON directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
	pub transfer_id: String,
	pub chunk_hash: String,
	pub chunk_index: u64,
	pub is_last: bool,
	pub compressed: bool,
	pub original_size: u64,
}

/// Encode a binary CHUNK frame: `[u16 BE header length][header JSON][bytes]`.
pub fn encode_chunk_frame(header: &ChunkHeader, bytes: &[u8]) -> Result<Vec<u8>, BdpError> {
	let header_json = serde_json::to_vec(header)?;
	if header_json.len() > u16::MAX as usize {
		return Err(BdpError::Decode("chunk header exceeds 65535 bytes".into()));
	}
	let mut out = Vec::with_capacity(2 + header_json.len() + bytes.len());
	out.extend_from_slice(&(header_json.len() as u16).to_be_bytes());
	out.extend_from_slice(&header_json);
	out.extend_from_slice(bytes);
	Ok(out)
}

/// Decode a binary CHUNK frame back into its header and raw byte payload.
pub fn decode_chunk_frame(frame: &[u8]) -> Result<(ChunkHeader, &[u8]), BdpError> {
	if frame.len() < 2 {
		return Err(BdpError::Decode("chunk frame shorter than length prefix".into()));
	}
	let header_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
	if frame.len() < 2 + header_len {
		return Err(BdpError::Decode("chunk frame truncated before end of header".into()));
	}
	let header: ChunkHeader = serde_json::from_slice(&frame[2..2 + header_len])?;
	Ok((header, &frame[2 + header_len..]))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample_envelope(frame: FramePayload) -> Envelope {
		Envelope::new("pair123".into(), "msg1".into(), "device1".into(), 1000, frame)
	}

	#[test]
	fn hello_round_trips() {
		let env = sample_envelope(FramePayload::Hello(HelloPayload {
			device_name: "laptop".into(),
			capabilities: vec!["chunked".into()],
			public_key_b64: None,
			pairs: vec![PairAnnouncement {
				pair_id: "pair123".into(),
				merkle_root: Some("abc".into()),
				max_seq: 5,
				index_id: "idx1".into(),
			}],
		}));
		let text = env.encode().unwrap();
		assert!(looks_like_bdp_text(&text));
		let back = Envelope::decode(&text).unwrap();
		assert_eq!(env, back);
	}

	#[test]
	fn ping_pong_round_trip() {
		let env = sample_envelope(FramePayload::Ping(PingPongPayload { nonce: "n1".into() }));
		let text = env.encode().unwrap();
		let back = Envelope::decode(&text).unwrap();
		assert_eq!(env, back);
	}

	#[test]
	fn decode_rejects_missing_cp_discriminant() {
		let text = r#"{"v":1,"type":"PING","pairId":"p","msgId":"m","fromDeviceId":"d","ts":0,"nonce":"n"}"#;
		let err = Envelope::decode(text).unwrap_err();
		assert!(matches!(err, BdpError::Decode(_)));
	}

	#[test]
	fn decode_rejects_malformed_json() {
		let err = Envelope::decode("not json").unwrap_err();
		assert!(matches!(err, BdpError::Decode(_)));
	}

	#[test]
	fn chunk_frame_round_trips_with_binary_payload() {
		let header = ChunkHeader {
			transfer_id: "t1".into(),
			chunk_hash: "h1".into(),
			chunk_index: 0,
			is_last: true,
			compressed: false,
			original_size: 4,
		};
		let bytes = vec![1u8, 2, 3, 4];
		let frame = encode_chunk_frame(&header, &bytes).unwrap();
		let (decoded_header, decoded_bytes) = decode_chunk_frame(&frame).unwrap();
		assert_eq!(decoded_header, header);
		assert_eq!(decoded_bytes, bytes.as_slice());
	}

	#[test]
	fn chunk_frame_header_length_prefix_is_big_endian_u16() {
		let header = ChunkHeader {
			transfer_id: "t".into(),
			chunk_hash: "h".into(),
			chunk_index: 0,
			is_last: false,
			compressed: false,
			original_size: 0,
		};
		let frame = encode_chunk_frame(&header, &[]).unwrap();
		let header_json_len = serde_json::to_vec(&header).unwrap().len();
		assert_eq!(u16::from_be_bytes([frame[0], frame[1]]) as usize, header_json_len);
	}

	#[test]
	fn decode_chunk_frame_rejects_truncated_input() {
		let err = decode_chunk_frame(&[0, 10, 1, 2]).unwrap_err();
		assert!(matches!(err, BdpError::Decode(_)));
	}

	#[test]
	fn binary_discriminant_requires_more_than_four_bytes() {
		assert!(!looks_like_bdp_binary(&[1, 2, 3, 4]));
		assert!(looks_like_bdp_binary(&[1, 2, 3, 4, 5]));
	}
}

// vim: ts=4
