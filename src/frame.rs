//! Byte-stuffed, CRC16 protected frames of the RS485 slave bus.
//!
//! On the wire a frame looks like this:
//!
//! ```text
//! STX | id + 0x20 | len + 0x20 | stuffed payload ... | 4 CRC nibbles + 0x20 | ETX
//! ```
//!
//! `len` counts the whole frame, from `STX` to `ETX`. The CRC is a
//! CRC-16/ARC over everything that precedes the CRC nibbles, exactly as
//! transmitted (markers and bias included, payload still stuffed). Nibbles
//! are sent most significant first.
//!
//! Reserved byte values inside the payload are escaped with `ESC`:
//!
//! | byte  | on wire     |
//! |-------|-------------|
//! | `ESC` | `ESC` `'0'` |
//! | `STX` | `ESC` `'2'` |
//! | `ETX` | `ESC` `'3'` |

use crc::{Crc, CRC_16_ARC};

/// Start of frame marker.
pub const STX: u8 = 0x02;
/// End of frame marker.
pub const ETX: u8 = 0x03;
/// Escape marker.
pub const ESC: u8 = 0x1B;

const ESC_BASE: u8 = b'0';

/// Bias added to the device id, the length and each CRC nibble so they
/// never collide with the markers.
pub const OFFSET: u8 = 0x20;

/// `STX`, device id and length.
pub const HEADER_LEN: usize = 3;
/// Four CRC nibbles and `ETX`.
pub const TRAILER_LEN: usize = 5;
/// Number of CRC nibbles.
pub const CRC_NIBBLES: usize = 4;

/// Largest unstuffed payload carried by a frame.
///
/// A data chunk for a slave with 3-byte addresses is the largest message:
/// tag, sequence, address, count and 28 program words.
pub const MAX_PAYLOAD: usize = 63;

/// Shortest valid frame: header, one payload byte and trailer.
pub const MIN_FRAME_SIZE: usize = HEADER_LEN + 1 + TRAILER_LEN;

/// Longest valid frame: every payload byte escaped.
pub const MAX_FRAME_SIZE: usize = HEADER_LEN + 2 * MAX_PAYLOAD + TRAILER_LEN;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

/// Errors detected while building or receiving a frame.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Frame does not fit into its buffer.
    Overflow = 1,
    /// `ESC` followed by something other than `'0'`, `'2'` or `'3'`.
    IllegalEscape = 2,
    /// Device id outside of both master and slave ranges.
    InvalidDeviceId = 3,
    /// Length byte outside of [`MIN_FRAME_SIZE`]..=[`MAX_FRAME_SIZE`].
    InvalidLength = 4,
    /// Received CRC does not match the frame contents.
    CrcMismatch = 5,
    /// Byte after the CRC is not `ETX`.
    MissingEndMarker = 6,
    /// Well-formed frame addressed to somebody else.
    NotAddressed = 7,
}

/// Append `byte` to `buf` at `index`, escaping it when it is reserved.
///
/// Returns the index right after the written bytes.
pub fn stuff_byte(buf: &mut [u8], index: usize, byte: u8) -> Result<usize, FrameError> {
    let escaped = matches!(byte, STX | ETX | ESC);
    let needed = if escaped { 2 } else { 1 };

    if index + needed > buf.len() {
        return Err(FrameError::Overflow);
    }

    if escaped {
        buf[index] = ESC;
        buf[index + 1] = escape_code(byte);
    } else {
        buf[index] = byte;
    }

    Ok(index + needed)
}

fn escape_code(byte: u8) -> u8 {
    match byte {
        ESC => ESC_BASE,
        other => ESC_BASE + other,
    }
}

/// Byte restored from an escape continuation, `None` when it is not one
/// of the three legal codes.
pub fn unescape(code: u8) -> Option<u8> {
    match code.wrapping_sub(ESC_BASE) {
        0 => Some(ESC),
        c @ (STX | ETX) => Some(c),
        _ => None,
    }
}

/// Collapse escape sequences of `buf[start..start + len]` in place.
///
/// Returns the new length of the region. Bytes after the region are
/// left untouched.
pub fn unstuff(buf: &mut [u8], start: usize, len: usize) -> Result<usize, FrameError> {
    let end = start.checked_add(len).ok_or(FrameError::Overflow)?;
    if end > buf.len() {
        return Err(FrameError::Overflow);
    }

    let mut read = start;
    let mut write = start;

    while read < end {
        let byte = buf[read];
        read += 1;

        buf[write] = if byte == ESC {
            if read == end {
                return Err(FrameError::IllegalEscape);
            }
            let code = buf[read];
            read += 1;
            unescape(code).ok_or(FrameError::IllegalEscape)?
        } else {
            byte
        };
        write += 1;
    }

    Ok(write - start)
}

/// CRC-16/ARC of `data`, continuing from `seed`.
///
/// A `seed` of `0` starts a fresh computation, a previous result
/// continues it, so `crc(a ++ b, 0) == crc(b, crc(a, 0))`.
pub fn compute_crc16(data: &[u8], seed: u16) -> u16 {
    // reflected algorithm: the crate expects the initial value unreflected
    let mut digest = CRC16.digest_with_initial(seed.reverse_bits());
    digest.update(data);
    digest.finalize()
}

/// Add the fixed bias to a header byte.
pub const fn bias(value: u8) -> u8 {
    value.wrapping_add(OFFSET)
}

/// Remove the fixed bias from a header byte.
pub const fn unbias(value: u8) -> u8 {
    value.wrapping_sub(OFFSET)
}

/// Split a CRC into the four biased nibbles sent on the wire.
pub fn crc_nibbles(crc: u16) -> [u8; CRC_NIBBLES] {
    [
        bias((crc >> 12) as u8 & 0x0f),
        bias((crc >> 8) as u8 & 0x0f),
        bias((crc >> 4) as u8 & 0x0f),
        bias(crc as u8 & 0x0f),
    ]
}

/// Rebuild a CRC from the four biased nibbles received.
///
/// Returns `None` if a byte is not a biased nibble.
pub fn crc_from_nibbles(nibbles: &[u8]) -> Option<u16> {
    if nibbles.len() != CRC_NIBBLES {
        return None;
    }
    nibbles.iter().try_fold(0u16, |acc, n| {
        let nibble = unbias(*n);
        (nibble <= 0x0f).then(|| (acc << 4) | nibble as u16)
    })
}

/// Outbound frame under construction.
///
/// ```
/// use usbd_relay_boot::frame::FrameWriter;
///
/// let mut frame = FrameWriter::new(5);
/// frame.push(0x0e).unwrap();
/// let bytes = frame.finish().unwrap();
/// assert_eq!(bytes.len(), 9);
/// ```
pub struct FrameWriter {
    buf: [u8; MAX_FRAME_SIZE],
    len: usize,
    sealed: bool,
}

impl FrameWriter {
    /// Start a frame addressed to `device_id`.
    pub fn new(device_id: u8) -> Self {
        let mut buf = [0; MAX_FRAME_SIZE];
        buf[0] = STX;
        buf[1] = bias(device_id);
        Self {
            buf,
            len: HEADER_LEN,
            sealed: false,
        }
    }

    /// Append one payload byte.
    pub fn push(&mut self, byte: u8) -> Result<(), FrameError> {
        if self.sealed {
            return Err(FrameError::Overflow);
        }
        // keep room for the trailer
        let limit = MAX_FRAME_SIZE - TRAILER_LEN;
        self.len = stuff_byte(&mut self.buf[..limit], self.len, byte)?;
        Ok(())
    }

    /// Append payload bytes.
    pub fn extend(&mut self, bytes: &[u8]) -> Result<(), FrameError> {
        bytes.iter().try_for_each(|b| self.push(*b))
    }

    /// Append a 16-bit value, low byte first.
    pub fn push_u16(&mut self, value: u16) -> Result<(), FrameError> {
        self.extend(&value.to_le_bytes())
    }

    /// Number of bytes written so far, header included.
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` until a payload byte is pushed.
    pub fn is_empty(&self) -> bool {
        self.len == HEADER_LEN
    }

    /// Fill in length, CRC and end marker. Returns the complete frame.
    pub fn finish(&mut self) -> Result<&[u8], FrameError> {
        if self.sealed {
            return Ok(self.as_bytes());
        }
        if self.is_empty() {
            return Err(FrameError::InvalidLength);
        }

        let body = self.len;
        let total = body + TRAILER_LEN;
        self.buf[2] = bias(total as u8);

        let crc = compute_crc16(&self.buf[..body], 0);
        self.buf[body..body + CRC_NIBBLES].copy_from_slice(&crc_nibbles(crc));
        self.buf[body + CRC_NIBBLES] = ETX;

        self.len = total;
        self.sealed = true;
        Ok(&self.buf[..total])
    }

    /// The frame as built so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}
