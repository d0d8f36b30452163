//! Chunk geometry, transfer metadata and the data-channel wire protocol.
//!
//! Frames are JSON text:
//!
//! ```text
//! {"type":"chunk","transferId":ID,"seq":N,"data":BASE64}
//! {"type":"chunk-end","transferId":ID}
//! {"type":"ack","transferId":ID,"lastSeq":N}
//! ```
//!
//! Any other `type` is a free-form application message.

use crate::core::config::MAX_CHUNK_SIZE;
use crate::error::{PeerError, Result};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Serialize `Vec<u8>` as a base64 string instead of a JSON number array.
pub(crate) mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}

/// Fresh opaque transfer id.
pub fn new_transfer_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// `ceil(size / chunk_size)`. An empty file has zero chunks.
pub fn total_chunks(size: u64, chunk_size: usize) -> u32 {
    size.div_ceil(chunk_size as u64) as u32
}

/// Byte range `[seq*chunk_size, min(size, (seq+1)*chunk_size))`.
pub fn chunk_range(seq: u32, size: u64, chunk_size: usize) -> Range<u64> {
    let start = (seq as u64 * chunk_size as u64).min(size);
    let end = (start + chunk_size as u64).min(size);
    start..end
}

/// Contract the receiver uses to reassemble a transfer. Published as the
/// `file-meta` signal before any chunk is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferMeta {
    pub transfer_id: String,
    pub file_name: String,
    pub total_size: u64,
    pub total_chunks: u32,
    pub chunk_size: usize,
}

impl TransferMeta {
    pub fn new(transfer_id: String, file_name: String, total_size: u64, chunk_size: usize) -> Self {
        Self {
            total_chunks: total_chunks(total_size, chunk_size),
            transfer_id,
            file_name,
            total_size,
            chunk_size,
        }
    }

    pub fn chunk_range(&self, seq: u32) -> Range<u64> {
        chunk_range(seq, self.total_size, self.chunk_size)
    }

    /// Exact byte length chunk `seq` must have.
    pub fn expected_len(&self, seq: u32) -> usize {
        let r = self.chunk_range(seq);
        (r.end - r.start) as usize
    }

    /// Reject a peer's meta whose geometry does not add up: every chunk but
    /// the last must be full and the chunks must cover exactly `total_size`.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(PeerError::FrameParse(format!(
                "file-meta {}: chunkSize {} out of range",
                self.transfer_id, self.chunk_size
            )));
        }
        let expected = self.total_size.div_ceil(self.chunk_size as u64);
        if expected != u64::from(self.total_chunks) {
            return Err(PeerError::FrameParse(format!(
                "file-meta {}: totalChunks {} does not match totalSize {} / chunkSize {}",
                self.transfer_id, self.total_chunks, self.total_size, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// Transfer-control frames routed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChannelFrame {
    #[serde(rename_all = "camelCase")]
    Chunk {
        transfer_id: String,
        seq: u32,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    #[serde(rename_all = "camelCase")]
    ChunkEnd { transfer_id: String },
    #[serde(rename_all = "camelCase")]
    Ack { transfer_id: String, last_seq: i64 },
}

impl ChannelFrame {
    /// `type` strings this enum owns; everything else is an app message.
    pub const TYPES: [&'static str; 3] = ["chunk", "chunk-end", "ack"];

    pub fn transfer_id(&self) -> &str {
        match self {
            ChannelFrame::Chunk { transfer_id, .. }
            | ChannelFrame::ChunkEnd { transfer_id }
            | ChannelFrame::Ack { transfer_id, .. } => transfer_id,
        }
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CHUNK_SIZE;

    #[test]
    fn chunk_count_is_ceiling() {
        assert_eq!(total_chunks(0, CHUNK_SIZE), 0);
        assert_eq!(total_chunks(1, CHUNK_SIZE), 1);
        assert_eq!(total_chunks(CHUNK_SIZE as u64, CHUNK_SIZE), 1);
        assert_eq!(total_chunks(CHUNK_SIZE as u64 + 1, CHUNK_SIZE), 2);
        assert_eq!(total_chunks(300_000, CHUNK_SIZE), 3);
    }

    #[test]
    fn ranges_cover_file_without_gaps_or_overlap() {
        for size in [0u64, 1, 4096, 131_071, 131_072, 131_073, 300_000, 1_000_000] {
            let n = total_chunks(size, CHUNK_SIZE);
            let mut cursor = 0u64;
            for seq in 0..n {
                let r = chunk_range(seq, size, CHUNK_SIZE);
                assert_eq!(r.start, cursor, "gap before chunk {seq} of {size}");
                assert!(r.end > r.start);
                cursor = r.end;
            }
            assert_eq!(cursor, size);
        }
    }

    #[test]
    fn three_chunk_split_sizes() {
        let meta = TransferMeta::new("t".into(), "f".into(), 300_000, CHUNK_SIZE);
        assert_eq!(meta.total_chunks, 3);
        assert_eq!(meta.expected_len(0), 131_072);
        assert_eq!(meta.expected_len(1), 131_072);
        assert_eq!(meta.expected_len(2), 37_856);
    }

    #[test]
    fn chunk_frame_wire_format() {
        let frame = ChannelFrame::Chunk {
            transfer_id: "abc".into(),
            seq: 4,
            data: b"hi".to_vec(),
        };
        let v: serde_json::Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        assert_eq!(v["type"], "chunk");
        assert_eq!(v["transferId"], "abc");
        assert_eq!(v["seq"], 4);
        assert_eq!(v["data"], "aGk=");
    }

    #[test]
    fn ack_and_end_wire_format() {
        let ack: ChannelFrame =
            serde_json::from_str(r#"{"type":"ack","transferId":"x","lastSeq":-1}"#).unwrap();
        assert_eq!(
            ack,
            ChannelFrame::Ack {
                transfer_id: "x".into(),
                last_seq: -1
            }
        );
        let end = ChannelFrame::ChunkEnd {
            transfer_id: "x".into(),
        };
        assert_eq!(end.to_text().unwrap(), r#"{"type":"chunk-end","transferId":"x"}"#);
    }

    #[test]
    fn meta_wire_names() {
        let meta = TransferMeta::new("t".into(), "a.txt".into(), 10, CHUNK_SIZE);
        let v = serde_json::to_value(&meta).unwrap();
        assert_eq!(v["transferId"], "t");
        assert_eq!(v["fileName"], "a.txt");
        assert_eq!(v["totalSize"], 10);
        assert_eq!(v["totalChunks"], 1);
        assert_eq!(v["chunkSize"], CHUNK_SIZE);
    }

    #[test]
    fn meta_geometry_is_validated() {
        assert!(TransferMeta::new("t".into(), "f".into(), 300_000, CHUNK_SIZE).validate().is_ok());
        assert!(TransferMeta::new("t".into(), "f".into(), 0, CHUNK_SIZE).validate().is_ok());

        let mut short = TransferMeta::new("t".into(), "f".into(), 300_000, CHUNK_SIZE);
        short.total_chunks = 1;
        assert!(matches!(short.validate(), Err(PeerError::FrameParse(_))));

        let mut zero = TransferMeta::new("t".into(), "f".into(), 10, CHUNK_SIZE);
        zero.chunk_size = 0;
        assert!(zero.validate().is_err());

        let mut huge = TransferMeta::new("t".into(), "f".into(), 10, CHUNK_SIZE);
        huge.chunk_size = MAX_CHUNK_SIZE + 1;
        assert!(huge.validate().is_err());
    }

    #[test]
    fn transfer_ids_are_unique() {
        assert_ne!(new_transfer_id(), new_transfer_id());
    }
}
