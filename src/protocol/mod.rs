//! Protocol module - the frame wire format.
//!
//! Every application message on the stream is one frame: a 4-byte
//! little-endian payload length followed by exactly that many payload
//! bytes.

mod wire_format;

pub use wire_format::{Header, ABSOLUTE_MAX_PAYLOAD_SIZE, HEADER_SIZE};
