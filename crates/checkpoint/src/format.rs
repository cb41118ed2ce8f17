//! On-disk checkpoint layout
//!
//! ```text
//! magic "CKPT" | version u32 | step u64 | epoch u64 | type u8 |
//! payload length u64 | metadata length u32 | metadata JSON | payload
//! ```
//!
//! All integers are little-endian. The payload is opaque to this crate.

use bytes::{BufMut, Bytes, BytesMut};
use runtime_core::{CheckpointType, Epoch, Error, Result, Step};
use std::collections::HashMap;

/// Magic bytes for checkpoint files
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"CKPT";

/// Checkpoint format version
pub const CHECKPOINT_VERSION: u32 = 1;

/// Size of the fixed part of the header
const FIXED_HEADER_LEN: usize = 4 + 4 + 8 + 8 + 1 + 8 + 4;

/// Checkpoint file header
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointHeader {
    pub version: u32,
    pub step: Step,
    pub epoch: Epoch,
    pub checkpoint_type: CheckpointType,
    pub data_size: u64,
    pub metadata: HashMap<String, String>,
}

impl CheckpointHeader {
    pub fn new(step: Step, epoch: Epoch, checkpoint_type: CheckpointType) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            step,
            epoch,
            checkpoint_type,
            data_size: 0,
            metadata: HashMap::new(),
        }
    }
}

/// Serialize a header followed by its payload
pub fn encode(header: &CheckpointHeader, payload: &[u8]) -> Result<Bytes> {
    let metadata_json = serde_json::to_string(&header.metadata)?;
    let metadata_bytes = metadata_json.as_bytes();

    let mut buf = BytesMut::with_capacity(FIXED_HEADER_LEN + metadata_bytes.len() + payload.len());
    buf.put_slice(&CHECKPOINT_MAGIC);
    buf.put_u32_le(header.version);
    buf.put_u64_le(header.step);
    buf.put_u64_le(header.epoch);
    buf.put_u8(header.checkpoint_type.as_u8());
    buf.put_u64_le(payload.len() as u64);
    buf.put_u32_le(metadata_bytes.len() as u32);
    buf.put_slice(metadata_bytes);
    buf.put_slice(payload);

    Ok(buf.freeze())
}

/// Parse and validate a checkpoint file; `path` is only used in errors
pub fn decode(path: &str, data: Bytes) -> Result<(CheckpointHeader, Bytes)> {
    let corrupted = |reason: String| Error::CheckpointCorrupted {
        path: path.to_string(),
        reason,
    };

    if data.len() < FIXED_HEADER_LEN {
        return Err(corrupted(format!("{} bytes is shorter than a header", data.len())));
    }
    if data[0..4] != CHECKPOINT_MAGIC {
        return Err(corrupted("invalid checkpoint magic".to_string()));
    }

    let u32_at = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
    let u64_at = |at: usize| {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&data[at..at + 8]);
        u64::from_le_bytes(raw)
    };

    let version = u32_at(4);
    if version != CHECKPOINT_VERSION {
        return Err(corrupted(format!(
            "unsupported version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    let step = u64_at(8);
    let epoch = u64_at(16);
    let checkpoint_type = CheckpointType::from_u8(data[24])
        .ok_or_else(|| corrupted(format!("unknown checkpoint type {}", data[24])))?;
    let data_size = u64_at(25);
    let metadata_len = u32_at(33) as usize;

    let payload_start = FIXED_HEADER_LEN + metadata_len;
    if data.len() < payload_start {
        return Err(corrupted("truncated metadata".to_string()));
    }
    let available = (data.len() - payload_start) as u64;
    if available != data_size {
        return Err(corrupted(format!(
            "payload has {} bytes, header declares {}",
            available, data_size
        )));
    }

    let metadata: HashMap<String, String> =
        serde_json::from_slice(&data[FIXED_HEADER_LEN..payload_start])
            .map_err(|e| corrupted(format!("invalid metadata: {}", e)))?;

    let header = CheckpointHeader {
        version,
        step,
        epoch,
        checkpoint_type,
        data_size,
        metadata,
    };
    Ok((header, data.slice(payload_start..)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Bytes {
        let mut header = CheckpointHeader::new(42, 3, CheckpointType::Full);
        header.metadata.insert("rank".to_string(), "0".to_string());
        encode(&header, &[7u8; 100]).unwrap()
    }

    #[test]
    fn test_decode_reads_header_fields() {
        let (header, payload) = decode("mem", sample()).unwrap();
        assert_eq!(header.step, 42);
        assert_eq!(header.epoch, 3);
        assert_eq!(header.checkpoint_type, CheckpointType::Full);
        assert_eq!(header.data_size, 100);
        assert_eq!(header.metadata.get("rank").map(String::as_str), Some("0"));
        assert_eq!(payload.len(), 100);
        assert!(payload.iter().all(|b| *b == 7));
    }

    #[test]
    fn test_truncated_rejected() {
        let full = sample();
        let truncated = full.slice(..full.len() - 1);
        let err = decode("mem", truncated).unwrap_err();
        assert!(matches!(err, Error::CheckpointCorrupted { .. }));

        let err = decode("mem", full.slice(..10)).unwrap_err();
        assert!(matches!(err, Error::CheckpointCorrupted { .. }));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut raw = sample().to_vec();
        raw[0] = b'X';
        let err = decode("mem", Bytes::from(raw)).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut raw = sample().to_vec();
        raw[24] = 9;
        assert!(decode("mem", Bytes::from(raw)).is_err());
    }
}
