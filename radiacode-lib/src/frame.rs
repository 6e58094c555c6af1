//! Wire framing shared by both transports.
//!
//! ```text
//! [A5 5A][length u32 LE][opcode u16 LE][0x00][seq][payload][fletcher16 u16 LE]
//! ```
//!
//! `length` covers the 4-byte header and the payload. The checksum is computed
//! over the same span. Responses echo the request header byte for byte.

use crate::command::{Command, Opcode};
use crate::constants::{CHECKSUM_SIZE, FRAME_MARKER, FRAME_OVERHEAD, HEADER_SIZE, LENGTH_FIELD_SIZE};
use crate::error::FrameError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::FromPrimitive;
use zerocopy::byteorder::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// The 4-byte command header carried by every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct FrameHeader {
    pub opcode: U16,
    pub reserved: u8,
    pub seq: u8,
}

impl FrameHeader {
    pub fn new(opcode: Opcode, seq: u8) -> Self {
        Self {
            opcode: U16::new(opcode.into()),
            reserved: 0,
            seq,
        }
    }

    pub fn opcode(&self) -> Opcode {
        Opcode::from_primitive(self.opcode.get())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: Opcode, seq: u8, payload: Bytes) -> Self {
        Self {
            header: FrameHeader::new(opcode, seq),
            payload,
        }
    }

    pub fn request(command: &Command, seq: u8) -> Self {
        Self::new(command.opcode(), seq, command.payload().clone())
    }

    pub fn opcode(&self) -> Opcode {
        self.header.opcode()
    }

    pub fn seq(&self) -> u8 {
        self.header.seq
    }

    /// Length of this frame once encoded.
    pub fn wire_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.wire_len());
        out.extend_from_slice(&FRAME_MARKER);
        out.put_u32_le((HEADER_SIZE + self.payload.len()) as u32);
        let body_start = out.len();
        out.extend_from_slice(self.header.as_bytes());
        out.extend_from_slice(&self.payload);
        let checksum = fletcher16(&out[body_start..]);
        out.put_u16_le(checksum);
        out.freeze()
    }
}

/// Outcome of one decode attempt on the front of a buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Frame(Frame),
    Incomplete,
    Invalid(FrameError),
}

/// Fletcher-16 over `data`, modulo 255 on both running sums.
pub fn fletcher16(data: &[u8]) -> u16 {
    let mut sum1: u16 = 0;
    let mut sum2: u16 = 0;
    for &byte in data {
        sum1 = (sum1 + byte as u16) % 255;
        sum2 = (sum2 + sum1) % 255;
    }
    (sum2 << 8) | sum1
}

/// Try to take one frame off the front of `buf`.
///
/// Returns the outcome and how many bytes of `buf` it accounts for. Invalid
/// input is always consumed (at least one byte) so repeated calls make progress
/// towards the next marker.
pub fn decode(buf: &[u8], max_frame_len: usize) -> (Decoded, usize) {
    if buf.is_empty() {
        return (Decoded::Incomplete, 0);
    }

    match find_marker(buf) {
        Some(0) => {}
        Some(start) => return (Decoded::Invalid(FrameError::Unsynchronized { skipped: start }), start),
        None => {
            // Keep a trailing first marker byte: the second may still be in flight.
            let keep = usize::from(buf[buf.len() - 1] == FRAME_MARKER[0]);
            let skipped = buf.len() - keep;
            if skipped == 0 {
                return (Decoded::Incomplete, 0);
            }
            return (Decoded::Invalid(FrameError::Unsynchronized { skipped }), skipped);
        }
    }

    let prefix = FRAME_MARKER.len() + LENGTH_FIELD_SIZE;
    if buf.len() < prefix {
        return (Decoded::Incomplete, 0);
    }

    let mut length_field = &buf[FRAME_MARKER.len()..prefix];
    let length = length_field.get_u32_le() as usize;
    let max_body = max_frame_len.saturating_sub(FRAME_OVERHEAD - HEADER_SIZE);
    if length < HEADER_SIZE {
        return (Decoded::Invalid(FrameError::TooShort { length }), 1);
    }
    if length > max_body {
        return (Decoded::Invalid(FrameError::TooLong { length, max: max_body }), 1);
    }

    let total = prefix + length + CHECKSUM_SIZE;
    if buf.len() < total {
        // A marker in line noise can announce a frame that never arrives. Give
        // it up once a complete, checksummed frame is already waiting behind it.
        if let Some(start) = complete_frame_after(buf, max_body) {
            return (Decoded::Invalid(FrameError::Abandoned { length, next: start }), 1);
        }
        return (Decoded::Incomplete, 0);
    }

    let body = &buf[prefix..prefix + length];
    let mut checksum_field = &buf[prefix + length..total];
    let actual = checksum_field.get_u16_le();
    let expected = fletcher16(body);
    if actual != expected {
        return (Decoded::Invalid(FrameError::ChecksumMismatch { expected, actual }), 1);
    }

    let (header, payload) = match FrameHeader::read_from_prefix(body) {
        Ok(parts) => parts,
        // length >= HEADER_SIZE was checked above
        Err(_) => return (Decoded::Invalid(FrameError::TooShort { length }), 1),
    };

    (
        Decoded::Frame(Frame {
            header,
            payload: Bytes::copy_from_slice(payload),
        }),
        total,
    )
}

fn find_marker(buf: &[u8]) -> Option<usize> {
    buf.windows(FRAME_MARKER.len()).position(|w| w == FRAME_MARKER)
}

/// Offset of the first marker after position 0 that starts a complete frame
/// with a valid checksum.
fn complete_frame_after(buf: &[u8], max_body: usize) -> Option<usize> {
    let mut from = 1;
    while let Some(offset) = buf.get(from..).and_then(find_marker) {
        let start = from + offset;
        if is_complete_frame(&buf[start..], max_body) {
            return Some(start);
        }
        from = start + 1;
    }
    None
}

fn is_complete_frame(buf: &[u8], max_body: usize) -> bool {
    let prefix = FRAME_MARKER.len() + LENGTH_FIELD_SIZE;
    if buf.len() < prefix {
        return false;
    }
    let mut length_field = &buf[FRAME_MARKER.len()..prefix];
    let length = length_field.get_u32_le() as usize;
    if !(HEADER_SIZE..=max_body).contains(&length) || buf.len() < prefix + length + CHECKSUM_SIZE {
        return false;
    }
    let mut checksum_field = &buf[prefix + length..prefix + length + CHECKSUM_SIZE];
    checksum_field.get_u16_le() == fletcher16(&buf[prefix..prefix + length])
}

/// Accumulates transport chunks and hands out complete frames.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_frame_len: usize,
}

impl FrameBuffer {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(max_frame_len.min(64 * 1024)),
            max_frame_len,
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Decode from the front of the buffer, dropping whatever the attempt consumed.
    pub fn next_frame(&mut self) -> Decoded {
        let (decoded, consumed) = decode(&self.buf, self.max_frame_len);
        self.buf.advance(consumed);
        decoded
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
