//! Wire format encoding and decoding.
//!
//! Implements the 4-byte frame header:
//! ```text
//! ┌────────────────┬─────────────────────┐
//! │ Payload length │ Payload             │
//! │ 4 bytes        │ payload_length bytes│
//! │ uint32 LE      │                     │
//! └────────────────┴─────────────────────┘
//! ```
//!
//! There is no other framing: no magic numbers, no escape sequences. The
//! payload length is bounded by the maximum message size the endpoint was
//! constructed with; a length of zero or above that bound is a hard
//! protocol error.

use crate::error::{FramewireError, Result};

/// Header size in bytes (fixed, exactly 4).
pub const HEADER_SIZE: usize = 4;

/// Ceiling on any configurable payload bound (~2 GiB).
///
/// Endpoint constructors reject `max_message_size` / `packet_buffer_size`
/// above this, which keeps every frame length representable in the wire
/// header's `u32` and bounds what a single frame may ask the buffer pool
/// to allocate.
pub const ABSOLUTE_MAX_PAYLOAD_SIZE: usize = 2_147_483_647;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(payload_length: u32) -> Self {
        Self { payload_length }
    }

    /// Encode the header to bytes (Little Endian).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode the header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is smaller than `HEADER_SIZE` (4 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..HEADER_SIZE].copy_from_slice(&self.payload_length.to_le_bytes());
    }

    /// Decode and validate a header from bytes (Little Endian).
    ///
    /// Fails with [`FramewireError::MalformedHeader`] when the declared
    /// payload length is zero or exceeds `max_payload`.
    pub fn decode(buf: &[u8], max_payload: usize) -> Result<Self> {
        debug_assert!(buf.len() >= HEADER_SIZE);
        let payload_length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);

        if payload_length == 0 || payload_length as usize > max_payload {
            return Err(FramewireError::MalformedHeader {
                length: payload_length,
                max: max_payload,
            });
        }

        Ok(Self { payload_length })
    }

    /// Total size of the frame on the wire: header plus payload.
    #[inline]
    pub fn total_frame_size(&self) -> usize {
        HEADER_SIZE + self.payload_length as usize
    }
}
