//! 64-byte command and response packets exchanged with the host.
//!
//! All multi-byte fields are little-endian.
//!
//! | offset | field                                   |
//! |--------|-----------------------------------------|
//! | 0      | command                                 |
//! | 1..5   | address                                 |
//! | 5      | size, in bytes                          |
//! | 8..64  | data, 28 words, right-justified         |
//!
//! Commands that select a target carry an 8-byte password at `1..9` and
//! the target id at `9`. `UnlockConfig` carries its value at `1`.

use crate::message::CHUNK_WORDS;
use crate::target::{MemoryRegion, MAX_REGIONS};

/// Size of every packet.
pub const PACKET_SIZE: usize = 64;
/// Length of the shared secret.
pub const PASSWORD_LEN: usize = 8;
/// Largest data block carried by one packet.
pub const DATA_BLOCK_SIZE: usize = 2 * CHUNK_WORDS;
/// Program memory addresses per data byte pair.
pub const BYTES_PER_ADDRESS: u8 = 2;

const ADDRESS_OFFSET: usize = 1;
const SIZE_OFFSET: usize = 5;
const DATA_OFFSET: usize = 8;
const TARGET_OFFSET: usize = 1 + PASSWORD_LEN;

/// A raw packet.
pub type Packet = [u8; PACKET_SIZE];

/// Host command codes.
pub mod code {
    /// Query device, selects a target.
    pub const QUERY_DEVICE: u8 = 0x02;
    /// Lock or unlock vectors and configuration words.
    pub const UNLOCK_CONFIG: u8 = 0x03;
    /// Erase the application.
    pub const ERASE_DEVICE: u8 = 0x04;
    /// Program a data block.
    pub const PROGRAM_DEVICE: u8 = 0x05;
    /// Flush buffered data.
    pub const PROGRAM_COMPLETE: u8 = 0x06;
    /// Read back program memory.
    pub const GET_DATA: u8 = 0x07;
    /// Reset the target.
    pub const RESET_DEVICE: u8 = 0x08;
    /// Leave the bootloader.
    pub const JUMP_TO_APPLICATION: u8 = 0x09;
    /// Bootloader version, selects a target.
    pub const BOOT_FW_VERSION_REQUEST: u8 = 0x0A;
}

/// Errors found while parsing a host packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketError {
    /// Command code not known.
    UnknownCommand(u8),
    /// Data size larger than [`DATA_BLOCK_SIZE`].
    InvalidSize(u8),
}

/// Address, size and data of a program or read command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataBlock {
    /// Program memory address.
    pub address: u32,
    /// Number of valid data bytes.
    pub size: u8,
    /// The 28 data words as received.
    pub data: [u16; CHUNK_WORDS],
}

impl DataBlock {
    fn parse(packet: &Packet) -> Result<Self, PacketError> {
        let size = packet[SIZE_OFFSET];
        if size as usize > DATA_BLOCK_SIZE {
            return Err(PacketError::InvalidSize(size));
        }

        let mut data = [0u16; CHUNK_WORDS];
        for (i, w) in data.iter_mut().enumerate() {
            let at = DATA_OFFSET + 2 * i;
            *w = u16::from_le_bytes([packet[at], packet[at + 1]]);
        }

        Ok(Self {
            address: read_u32(packet, ADDRESS_OFFSET),
            size,
            data,
        })
    }

    /// Valid data words. Data is right-justified: it ends at the last word.
    pub fn words(&self) -> &[u16] {
        let count = (self.size as usize / 2).min(CHUNK_WORDS);
        &self.data[CHUNK_WORDS - count..]
    }
}

/// Decoded host command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostCommand {
    /// Report memory layout of `target`.
    QueryDevice {
        /// Shared secret.
        password: [u8; PASSWORD_LEN],
        /// Target id.
        target: u8,
    },
    /// `0` unlocks vectors and configuration words, anything else locks.
    UnlockConfig {
        /// Raw value.
        lock: u8,
    },
    /// Erase the application.
    EraseDevice,
    /// Program a data block.
    ProgramDevice(DataBlock),
    /// Flush buffered data.
    ProgramComplete(DataBlock),
    /// Read back program memory.
    GetData {
        /// First address.
        address: u32,
        /// Number of bytes.
        size: u8,
    },
    /// Reset the target.
    ResetDevice,
    /// Leave the bootloader.
    JumpToApplication,
    /// Report the bootloader version of `target`.
    BootFwVersionRequest {
        /// Shared secret.
        password: [u8; PASSWORD_LEN],
        /// Target id.
        target: u8,
    },
}

impl HostCommand {
    /// Decode a packet received from the host.
    pub fn parse(packet: &Packet) -> Result<Self, PacketError> {
        let command = match packet[0] {
            code::QUERY_DEVICE => HostCommand::QueryDevice {
                password: password(packet),
                target: packet[TARGET_OFFSET],
            },
            code::UNLOCK_CONFIG => HostCommand::UnlockConfig { lock: packet[1] },
            code::ERASE_DEVICE => HostCommand::EraseDevice,
            code::PROGRAM_DEVICE => HostCommand::ProgramDevice(DataBlock::parse(packet)?),
            code::PROGRAM_COMPLETE => HostCommand::ProgramComplete(DataBlock::parse(packet)?),
            code::GET_DATA => {
                let block = DataBlock::parse(packet)?;
                HostCommand::GetData {
                    address: block.address,
                    size: block.size,
                }
            }
            code::RESET_DEVICE => HostCommand::ResetDevice,
            code::JUMP_TO_APPLICATION => HostCommand::JumpToApplication,
            code::BOOT_FW_VERSION_REQUEST => HostCommand::BootFwVersionRequest {
                password: password(packet),
                target: packet[TARGET_OFFSET],
            },
            other => return Err(PacketError::UnknownCommand(other)),
        };
        Ok(command)
    }

    /// Command code.
    pub fn code(&self) -> u8 {
        match self {
            HostCommand::QueryDevice { .. } => code::QUERY_DEVICE,
            HostCommand::UnlockConfig { .. } => code::UNLOCK_CONFIG,
            HostCommand::EraseDevice => code::ERASE_DEVICE,
            HostCommand::ProgramDevice(_) => code::PROGRAM_DEVICE,
            HostCommand::ProgramComplete(_) => code::PROGRAM_COMPLETE,
            HostCommand::GetData { .. } => code::GET_DATA,
            HostCommand::ResetDevice => code::RESET_DEVICE,
            HostCommand::JumpToApplication => code::JUMP_TO_APPLICATION,
            HostCommand::BootFwVersionRequest { .. } => code::BOOT_FW_VERSION_REQUEST,
        }
    }
}

fn password(packet: &Packet) -> [u8; PASSWORD_LEN] {
    let mut pw = [0; PASSWORD_LEN];
    pw.copy_from_slice(&packet[1..1 + PASSWORD_LEN]);
    pw
}

fn read_u32(packet: &Packet, at: usize) -> u32 {
    u32::from_le_bytes([packet[at], packet[at + 1], packet[at + 2], packet[at + 3]])
}

/// Response packets.
pub struct Response;

impl Response {
    /// Query response listing `regions`, terminated by an end marker.
    pub fn query(regions: &[MemoryRegion; MAX_REGIONS + 1]) -> Packet {
        let mut p = [0; PACKET_SIZE];
        p[0] = code::QUERY_DEVICE;
        p[1] = DATA_BLOCK_SIZE as u8;
        p[2] = BYTES_PER_ADDRESS;

        let mut at = 3;
        for region in regions.iter() {
            p[at] = region.kind as u8;
            if region.kind == crate::target::RegionKind::EndOfList {
                break;
            }
            p[at + 1..at + 5].copy_from_slice(&region.address.to_le_bytes());
            p[at + 5..at + 9].copy_from_slice(&region.length.to_le_bytes());
            at += 9;
        }
        p
    }

    /// Read back response. `words` are placed right-justified.
    pub fn data(address: u32, size: u8, words: &[u16]) -> Packet {
        let mut p = [0; PACKET_SIZE];
        p[0] = code::GET_DATA;
        p[ADDRESS_OFFSET..ADDRESS_OFFSET + 4].copy_from_slice(&address.to_le_bytes());
        p[SIZE_OFFSET] = size;

        let words = &words[..words.len().min(CHUNK_WORDS)];
        let first = CHUNK_WORDS - words.len();
        for (i, w) in words.iter().enumerate() {
            let at = DATA_OFFSET + 2 * (first + i);
            p[at..at + 2].copy_from_slice(&w.to_le_bytes());
        }
        p
    }

    /// Version response. The version overwrites the command byte.
    pub fn version(version: [u8; 3]) -> Packet {
        let mut p = [0; PACKET_SIZE];
        p[..3].copy_from_slice(&version);
        p
    }
}
