//! Application messages carried inside slave bus frames.
//!
//! The first payload byte is always the message tag, the remaining bytes
//! are positional. Multi-byte counters are little-endian.

use crate::frame::{FrameError, FrameWriter};
use crate::target::AddressWidth;

/// Program words carried by one data chunk.
pub const CHUNK_WORDS: usize = 28;

/// Error code a slave reports when a packet was lost.
pub const ERROR_PACKET_LOST: u8 = 0x02;

/// Message tags, master to slave.
pub mod tag {
    /// Firmware upload start.
    pub const UPLOAD_START: u8 = 0x0F;
    /// Firmware data chunk.
    pub const DATA_CHUNK: u8 = 0x10;
    /// Last firmware chunk.
    pub const END_OF_UPLOAD: u8 = 0x0A;
    /// Read back program memory.
    pub const GET_PROGRAM_DATA: u8 = 0x0D;
    /// Reset the slave.
    pub const RESET: u8 = 0x0E;
    /// Broadcast, keep slaves in their bootloader.
    pub const FORCE_BOOTLOADER: u8 = 0x0B;
    /// Ask for the bootloader version.
    pub const VERSION_REQUEST: u8 = 0x09;
    /// Broadcast, start the applications.
    pub const JUMP_TO_APPLICATION: u8 = 0x0C;

    /// Chunk accepted.
    pub const ACK: u8 = 0x11;
    /// Chunk refused.
    pub const NACK: u8 = 0x12;
    /// Program memory contents.
    pub const PROGRAM_DATA: u8 = 0x13;
    /// Bootloader version.
    pub const VERSION: u8 = 0x14;
}

/// One piece of a firmware image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chunk {
    /// Upload sequence number.
    pub sequence: u16,
    /// Program memory address of the first word.
    pub address: u32,
    /// Number of data bytes, two per word.
    pub size: u8,
    /// Data words. Unused words are zero.
    pub words: [u16; CHUNK_WORDS],
}

/// Message sent by the master.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request {
    /// Start of an upload. Slaves erase their application area.
    UploadStart {
        /// First application address.
        address: u32,
        /// Most packets that will follow.
        packets: u16,
    },
    /// Firmware data.
    DataChunk(Chunk),
    /// Final firmware data. Only `size / 2` words are sent.
    EndOfUpload(Chunk),
    /// Read back program memory.
    GetProgramData {
        /// First address.
        address: u32,
        /// Number of bytes.
        size: u8,
    },
    /// Reset the slave.
    Reset,
    /// Broadcast keeping every slave in its bootloader.
    ForceBootloader,
    /// Bootloader version request.
    VersionRequest,
    /// Broadcast starting every slave application.
    JumpToApplication,
}

impl Request {
    /// Message tag.
    pub fn tag(&self) -> u8 {
        match self {
            Request::UploadStart { .. } => tag::UPLOAD_START,
            Request::DataChunk(_) => tag::DATA_CHUNK,
            Request::EndOfUpload(_) => tag::END_OF_UPLOAD,
            Request::GetProgramData { .. } => tag::GET_PROGRAM_DATA,
            Request::Reset => tag::RESET,
            Request::ForceBootloader => tag::FORCE_BOOTLOADER,
            Request::VersionRequest => tag::VERSION_REQUEST,
            Request::JumpToApplication => tag::JUMP_TO_APPLICATION,
        }
    }

    /// `true` for messages addressed to every slave.
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Request::ForceBootloader | Request::JumpToApplication)
    }

    /// Write the message payload to `frame`.
    pub fn encode(&self, width: AddressWidth, frame: &mut FrameWriter) -> Result<(), FrameError> {
        frame.push(self.tag())?;

        match self {
            Request::UploadStart { address, packets } => {
                push_address(frame, width, *address)?;
                frame.push_u16(*packets)?;
            }
            Request::DataChunk(chunk) => {
                push_chunk(frame, width, chunk, CHUNK_WORDS)?;
            }
            Request::EndOfUpload(chunk) => {
                let words = (chunk.size as usize / 2).min(CHUNK_WORDS);
                push_chunk(frame, width, chunk, words)?;
            }
            Request::GetProgramData { address, size } => {
                frame.push(*size)?;
                push_address(frame, width, *address)?;
            }
            Request::Reset
            | Request::ForceBootloader
            | Request::VersionRequest
            | Request::JumpToApplication => {}
        }

        Ok(())
    }
}

fn push_address(frame: &mut FrameWriter, width: AddressWidth, address: u32) -> Result<(), FrameError> {
    let bytes = address.to_le_bytes();
    match width {
        AddressWidth::Short => frame.extend(&bytes[..2]),
        AddressWidth::Long => frame.extend(&bytes[..3]),
    }
}

fn push_chunk(
    frame: &mut FrameWriter,
    width: AddressWidth,
    chunk: &Chunk,
    words: usize,
) -> Result<(), FrameError> {
    frame.push_u16(chunk.sequence)?;
    push_address(frame, width, chunk.address)?;
    frame.push(chunk.size)?;
    chunk.words[..words]
        .iter()
        .try_for_each(|w| frame.push_u16(*w))
}

/// Message received from a slave.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reply {
    /// Bootloader version, least significant byte first.
    Version([u8; 3]),
    /// Chunk accepted.
    Ack {
        /// Sequence number of the accepted chunk.
        sequence: u16,
    },
    /// Chunk refused.
    Nack {
        /// Sequence number of the refused chunk.
        sequence: u16,
        /// Reason, e.g. [`ERROR_PACKET_LOST`].
        error: u8,
    },
    /// Program memory contents.
    ProgramData([u16; CHUNK_WORDS]),
    /// Unrecognized tag, ignored.
    Unknown(u8),
}

impl Reply {
    /// Interpret an unstuffed payload. Missing trailing bytes read as zero.
    ///
    /// Returns `None` for an empty payload.
    pub fn decode(payload: &[u8]) -> Option<Reply> {
        let (&tag, rest) = payload.split_first()?;
        let byte = |i: usize| rest.get(i).copied().unwrap_or(0);
        let word = |i: usize| u16::from_le_bytes([byte(i), byte(i + 1)]);

        let reply = match tag {
            tag::VERSION => Reply::Version([byte(0), byte(1), byte(2)]),
            tag::ACK => Reply::Ack { sequence: word(0) },
            tag::NACK => Reply::Nack {
                sequence: word(0),
                error: byte(2),
            },
            tag::PROGRAM_DATA => {
                let mut words = [0u16; CHUNK_WORDS];
                for (i, w) in words.iter_mut().enumerate() {
                    *w = word(2 * i);
                }
                Reply::ProgramData(words)
            }
            other => Reply::Unknown(other),
        };

        Some(reply)
    }
}
