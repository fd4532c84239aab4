//! Wire types shared by the Verdict server, workers, and clients.
//!
//! Two distinct formats live here: the **task envelope** staged on the
//! durable queue between the API front end and the worker processes,
//! and the **RPC surface** (JSON request/response envelopes served over
//! the server's ROUTER socket, see [`rpc`]).
//!
//! # Envelope layout
//!
//! Header (24 bytes, Network Byte Order / Big Endian):
//! ```text
//! [VER:1][RES:1][KIND_LEN:2][TOKEN:16][PAYLOAD_LEN:4]
//! ```
//!
//! followed by `KIND_LEN` bytes of UTF-8 kind tag and `PAYLOAD_LEN`
//! bytes of JSON-encoded task parameters. Both ends check the version
//! and the declared lengths before trusting a byte of the body.

pub mod defaults;
pub mod error;
pub mod paths;
pub mod rpc;
pub mod types;

pub use error::{ApiError, EnvelopeError, ErrorKind};
pub use rpc::{RpcRequest, RpcResponse, ServiceCall};
pub use types::{
    validate_endpoint_name,
    CleanupPlanInfo,
    ConnectionSpec,
    EchoParams,
    FilterPresetInfo,
    IdentityInfo,
    NotificationInfo,
    Permission,
    ProductPatch,
    ProductSummary,
    SchemaStatus,
    SourceComponentInfo,
    StoreResultsParams,
    TaskComment,
    TaskFilter,
    TaskInfo,
    TaskKind,
    TaskParams,
    TaskStatus,
    TaskToken,
};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Envelope version
pub const ENVELOPE_VERSION: u8 = 0x01;

/// Envelope header size in bytes
pub const ENVELOPE_HEADER_SIZE: usize = 24;

/// Maximum payload size staged on the queue (16 MiB).
///
/// Bulk inputs travel through the task data directory, not the queue.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// A task payload staged on the durable queue.
///
/// Self-describing: carries its own version, kind tag, and token so a
/// worker can reject unknown kinds without consulting the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEnvelope {
    pub token: TaskToken,
    pub kind_tag: String,
    pub payload: Vec<u8>,
}

impl TaskEnvelope {
    /// Create a new envelope.
    ///
    /// Fails if the payload exceeds [`MAX_PAYLOAD_SIZE`] or the kind tag
    /// does not fit a u16 length prefix.
    pub fn new(
        token: TaskToken,
        kind_tag: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<Self, EnvelopeError> {
        let kind_tag = kind_tag.into();
        if kind_tag.is_empty() || kind_tag.len() > u16::MAX as usize {
            return Err(EnvelopeError::InvalidKindTag {
                len: kind_tag.len(),
            });
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(EnvelopeError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            token,
            kind_tag,
            payload,
        })
    }

    /// Pack the envelope into a single byte buffer for the queue table.
    pub fn pack(&self) -> Result<Vec<u8>, EnvelopeError> {
        let mut buf =
            Vec::with_capacity(ENVELOPE_HEADER_SIZE + self.kind_tag.len() + self.payload.len());
        buf.write_u8(ENVELOPE_VERSION)?;
        buf.write_u8(0)?; // reserved
        buf.write_u16::<BigEndian>(self.kind_tag.len() as u16)?;
        buf.extend_from_slice(self.token.as_bytes());
        buf.write_u32::<BigEndian>(self.payload.len() as u32)?;
        buf.extend_from_slice(self.kind_tag.as_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Unpack an envelope from queue bytes, validating the header.
    pub fn unpack(data: &[u8]) -> Result<Self, EnvelopeError> {
        if data.len() < ENVELOPE_HEADER_SIZE {
            return Err(EnvelopeError::HeaderTooShort {
                expected: ENVELOPE_HEADER_SIZE,
                got: data.len(),
            });
        }

        let mut cursor = Cursor::new(&data[..ENVELOPE_HEADER_SIZE]);
        let version = cursor.read_u8()?;
        if version != ENVELOPE_VERSION {
            return Err(EnvelopeError::VersionMismatch {
                expected: ENVELOPE_VERSION,
                got: version,
            });
        }
        let _reserved = cursor.read_u8()?;
        let kind_len = cursor.read_u16::<BigEndian>()? as usize;

        let mut token_bytes = [0u8; 16];
        token_bytes.copy_from_slice(&data[4..20]);
        let token = TaskToken::from_bytes(token_bytes);

        let mut tail = Cursor::new(&data[20..ENVELOPE_HEADER_SIZE]);
        let payload_len = tail.read_u32::<BigEndian>()? as usize;

        let expected = ENVELOPE_HEADER_SIZE + kind_len + payload_len;
        if data.len() != expected {
            return Err(EnvelopeError::LengthMismatch {
                expected,
                got: data.len(),
            });
        }

        let kind_tag = std::str::from_utf8(&data[ENVELOPE_HEADER_SIZE..ENVELOPE_HEADER_SIZE + kind_len])
            .map_err(|_| EnvelopeError::InvalidKindTag { len: kind_len })?
            .to_string();
        let payload = data[ENVELOPE_HEADER_SIZE + kind_len..].to_vec();

        Ok(Self {
            token,
            kind_tag,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_pack_unpack() {
        let token = TaskToken::new();
        let payload = br#"{"delay_ms":50}"#.to_vec();
        let env = TaskEnvelope::new(token, "echo", payload.clone()).unwrap();

        let packed = env.pack().unwrap();
        assert_eq!(packed[0], ENVELOPE_VERSION);
        assert_eq!(packed.len(), ENVELOPE_HEADER_SIZE + 4 + payload.len());

        let unpacked = TaskEnvelope::unpack(&packed).unwrap();
        assert_eq!(unpacked.token, token);
        assert_eq!(unpacked.kind_tag, "echo");
        assert_eq!(unpacked.payload, payload);
    }

    #[test]
    fn test_envelope_version_mismatch() {
        let env = TaskEnvelope::new(TaskToken::new(), "echo", vec![]).unwrap();
        let mut packed = env.pack().unwrap();
        packed[0] = 0x7F;

        let result = TaskEnvelope::unpack(&packed);
        assert!(matches!(result, Err(EnvelopeError::VersionMismatch { .. })));
    }

    #[test]
    fn test_envelope_header_too_short() {
        let result = TaskEnvelope::unpack(&[0u8; 8]);
        assert!(matches!(result, Err(EnvelopeError::HeaderTooShort { .. })));
    }

    #[test]
    fn test_envelope_truncated_body() {
        let env = TaskEnvelope::new(TaskToken::new(), "echo", b"{}".to_vec()).unwrap();
        let packed = env.pack().unwrap();

        let result = TaskEnvelope::unpack(&packed[..packed.len() - 1]);
        assert!(matches!(result, Err(EnvelopeError::LengthMismatch { .. })));
    }

    #[test]
    fn test_envelope_rejects_empty_kind() {
        let result = TaskEnvelope::new(TaskToken::new(), "", vec![]);
        assert!(matches!(result, Err(EnvelopeError::InvalidKindTag { .. })));
    }
}
