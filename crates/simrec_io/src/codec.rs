//! Integrity frame shared by the dataset and checkpoint formats.
//!
//! ```text
//! Bytes 0-3:   magic
//! Bytes 4-5:   format version (u16 little-endian)
//! Bytes 6-9:   CRC32 of the payload (u32 little-endian)
//! Bytes 10-17: payload length (u64 little-endian)
//! Bytes 18+:   payload (bincode)
//! ```
//!
//! Bytes after the payload are not covered by the frame and are handed back
//! to the caller untouched.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Size of the fixed frame header.
pub(crate) const FRAME_HEADER_SIZE: usize = 18;

#[derive(Debug, Error)]
pub(crate) enum FrameError {
    #[error("file is {size} bytes, shorter than the {FRAME_HEADER_SIZE}-byte header")]
    TooSmall { size: usize },

    #[error("bad magic {found:?}")]
    BadMagic { found: [u8; 4] },

    #[error("unsupported version {found} (supported: {supported})")]
    UnsupportedVersion { found: u16, supported: u16 },

    #[error("header declares {declared} payload bytes, {available} available")]
    LengthMismatch { declared: u64, available: u64 },

    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("payload encoding: {0}")]
    Payload(#[from] bincode::Error),
}

/// Serialises `value` with bincode and prepends the frame header.
pub(crate) fn encode<T: Serialize>(
    magic: [u8; 4],
    version: u16,
    value: &T,
) -> Result<Vec<u8>, FrameError> {
    let payload = bincode::serialize(value)?;
    let checksum = crc32fast::hash(&payload);

    let mut bytes = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    bytes.extend_from_slice(&magic);
    bytes.extend_from_slice(&version.to_le_bytes());
    bytes.extend_from_slice(&checksum.to_le_bytes());
    bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Verifies the frame at the start of `bytes` and decodes its payload.
///
/// Returns the value and the bytes following the payload.
pub(crate) fn decode<T: DeserializeOwned>(
    magic: [u8; 4],
    version: u16,
    bytes: &[u8],
) -> Result<(T, &[u8]), FrameError> {
    if bytes.len() < FRAME_HEADER_SIZE {
        return Err(FrameError::TooSmall { size: bytes.len() });
    }
    let (header, rest) = bytes.split_at(FRAME_HEADER_SIZE);

    let mut found = [0u8; 4];
    found.copy_from_slice(&header[0..4]);
    if found != magic {
        return Err(FrameError::BadMagic { found });
    }

    let found = u16::from_le_bytes([header[4], header[5]]);
    if found != version {
        return Err(FrameError::UnsupportedVersion {
            found,
            supported: version,
        });
    }

    let mut word = [0u8; 4];
    word.copy_from_slice(&header[6..10]);
    let stored = u32::from_le_bytes(word);
    let mut word = [0u8; 8];
    word.copy_from_slice(&header[10..18]);
    let declared = u64::from_le_bytes(word);

    let payload_len = usize::try_from(declared)
        .ok()
        .filter(|len| *len <= rest.len())
        .ok_or(FrameError::LengthMismatch {
            declared,
            available: rest.len() as u64,
        })?;
    let (payload, trailing) = rest.split_at(payload_len);

    let computed = crc32fast::hash(payload);
    if stored != computed {
        return Err(FrameError::ChecksumMismatch { stored, computed });
    }

    Ok((bincode::deserialize(payload)?, trailing))
}
