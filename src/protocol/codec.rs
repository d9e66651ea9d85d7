//! Frame codec
//!
//! Encodes payloads into the framed wire format and validates incoming frames.
//! Decoding is split in two because a stream socket only tells us how many
//! bytes to wait for once the fixed-size header has been read.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{FOOTER_MAGIC, HEADER_MAGIC};

/// Header size: magic(2) + total length(4) = 6 bytes
pub const HEADER_SIZE: usize = 6;

/// Footer size: magic(2)
pub const FOOTER_SIZE: usize = 2;

/// Bytes of envelope around every payload
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + FOOTER_SIZE;

/// Largest payload whose frame length still fits the 4 byte length field
pub const MAX_FRAME_PAYLOAD: usize = u32::MAX as usize - FRAME_OVERHEAD;

/// Framing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("Invalid header magic bytes")]
    InvalidHeaderMagic,

    #[error("Invalid footer magic bytes")]
    InvalidFooterMagic,

    #[error("Frame length {0} is shorter than the frame envelope")]
    LengthUnderflow(u32),

    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

/// Reject payloads too large to be described by a frame header
pub fn check_payload_len(payload_len: usize) -> Result<(), FramingError> {
    if payload_len > MAX_FRAME_PAYLOAD {
        return Err(FramingError::PayloadTooLarge {
            size: payload_len,
            max: MAX_FRAME_PAYLOAD,
        });
    }
    Ok(())
}

/// Build the 6 byte header announcing a payload of `payload_len` bytes.
///
/// The length field counts the whole frame, header and footer included.
/// `payload_len` must pass [`check_payload_len`].
pub fn encode_header(payload_len: usize) -> [u8; HEADER_SIZE] {
    let total = (FRAME_OVERHEAD + payload_len) as u32;
    let mut header = [0u8; HEADER_SIZE];
    header[..2].copy_from_slice(&HEADER_MAGIC);
    header[2..].copy_from_slice(&total.to_le_bytes());
    header
}

/// Encode a payload into a complete frame
pub fn encode(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD + payload.len());
    buf.put_slice(&encode_header(payload.len()));
    buf.put_slice(payload);
    buf.put_slice(&FOOTER_MAGIC);
    buf.freeze()
}

/// Validate a frame header and return the length of the payload that follows.
///
/// The caller must then read `payload_len + FOOTER_SIZE` more bytes.
pub fn decode_header(header: &[u8; HEADER_SIZE]) -> Result<usize, FramingError> {
    if header[..2] != HEADER_MAGIC {
        return Err(FramingError::InvalidHeaderMagic);
    }

    let total = u32::from_le_bytes([header[2], header[3], header[4], header[5]]);
    (total as usize)
        .checked_sub(FRAME_OVERHEAD)
        .ok_or(FramingError::LengthUnderflow(total))
}

/// Validate a frame body (payload followed by the footer) and strip the footer.
pub fn decode_body(body: &[u8]) -> Result<&[u8], FramingError> {
    match body.len().checked_sub(FOOTER_SIZE) {
        Some(payload_len) if body[payload_len..] == FOOTER_MAGIC => Ok(&body[..payload_len]),
        _ => Err(FramingError::InvalidFooterMagic),
    }
}
