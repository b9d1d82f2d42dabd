use crate::flash::FlashError;
use crate::message::{Chunk, CHUNK_WORDS};
use crate::target::Target;

/// Version reported when a slave does not answer.
pub const UNKNOWN_VERSION: [u8; 3] = [0xFF; 3];

/// State of the operation in progress, shared by the host state
/// machine and the serial link.
pub struct ProgrammingSession {
    pub(crate) target: Target,
    pub(crate) start_address: u32,
    pub(crate) packet_count: u16,
    pub(crate) tx_sequence: u16,
    pub(crate) rx_sequence: u16,
    pub(crate) chunk: Chunk,
    pub(crate) slave_error: Option<u8>,
    pub(crate) flash_error: Option<FlashError>,
    pub(crate) broadcast_retries: u8,
    pub(crate) reset_retries: u8,
    pub(crate) resetting: bool,
    pub(crate) end_programming: bool,
    pub(crate) version_requested: bool,
    pub(crate) slave_version: [u8; 3],
    pub(crate) config_unlocked: bool,
    pub(crate) program_pointer: Option<u32>,
}

impl ProgrammingSession {
    pub(crate) fn new() -> Self {
        Self {
            target: Target::Broadcast,
            start_address: 0,
            packet_count: 0,
            tx_sequence: 0,
            rx_sequence: 0,
            chunk: Chunk {
                sequence: 0,
                address: 0,
                size: 0,
                words: [0; CHUNK_WORDS],
            },
            slave_error: None,
            flash_error: None,
            broadcast_retries: 0,
            reset_retries: 0,
            resetting: false,
            end_programming: false,
            version_requested: false,
            slave_version: UNKNOWN_VERSION,
            config_unlocked: false,
            program_pointer: None,
        }
    }

    /// Device selected by the last query or version request.
    pub fn target(&self) -> Target {
        self.target
    }

    /// First application address of the current upload.
    pub fn start_address(&self) -> u32 {
        self.start_address
    }

    /// Sequence number of the last chunk sent to a slave.
    pub fn tx_sequence(&self) -> u16 {
        self.tx_sequence
    }

    /// Sequence number in the last ack or nack received.
    pub fn rx_sequence(&self) -> u16 {
        self.rx_sequence
    }

    /// Error code of the last nack.
    pub fn slave_error(&self) -> Option<u8> {
        self.slave_error
    }

    /// Last flash failure on the master.
    pub fn flash_error(&self) -> Option<FlashError> {
        self.flash_error
    }

    /// Broadcasts sent since broadcasting was (re)enabled.
    pub fn broadcast_retries(&self) -> u8 {
        self.broadcast_retries
    }

    /// Reset messages sent to the current slave.
    pub fn reset_retries(&self) -> u8 {
        self.reset_retries
    }

    /// `true` once a slave reset sequence is over.
    pub fn end_programming(&self) -> bool {
        self.end_programming
    }

    /// `true` when the vectors and configuration words are unlocked.
    pub fn config_unlocked(&self) -> bool {
        self.config_unlocked
    }

    /// Next expected contiguous program address.
    pub fn program_pointer(&self) -> Option<u32> {
        self.program_pointer
    }

    pub(crate) fn enable_broadcast(&mut self) {
        self.broadcast_retries = 0;
    }

    pub(crate) fn start_reset(&mut self) {
        self.resetting = true;
        self.reset_retries = 1;
        self.end_programming = false;
    }
}
