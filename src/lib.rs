#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
//!
//! USB HID bootloader core for a master controller that also reprograms
//! a population of slave controllers over an RS485 bus.
//!
//! ## About
//!
//! The host talks to the master with fixed 64-byte command packets over
//! USB HID (interrupt endpoints). Every command is addressed to the
//! target selected by the last query: either the master itself, whose
//! flash is then erased, programmed and read back directly, or one of
//! the slaves, in which case the command is translated into messages
//! relayed over the serial bus.
//!
//! Serial frames are byte-stuffed and protected by a CRC16, see
//! [`frame`]. Slaves answer with their id plus 100.
//!
//! This library is the protocol and state machine only. Flash access,
//! the UART, the RS485 transmit enable pin and the final jump to the
//! application are provided by the library user through
//! [`ProgramMemory`], `embedded-hal` traits and [`Platform`].
//!
//! ### Supported commands
//!
//! * Query device, with target selection and password check
//! * Unlock / lock vectors and configuration words
//! * Erase, program, program complete, read back
//! * Reset, jump to application
//! * Bootloader version request
//!
//! ### Limitations
//!
//! * Malformed or unauthorized commands are ignored, the host only sees
//! a timeout.
//!
//! * Only version requests are bounded by a slave answer window. Other
//! slave exchanges wait until the slave answers.
//!
//! ## Example
//!
//! Hardware setup (clocks, USB peripheral, UART, interrupts) is not part
//! of the example.
//!
//! ```ignore
//! use usb_device::prelude::*;
//! use usbd_relay_boot::*;
//!
//! struct Board;
//!
//! impl Platform for Board {
//!     fn leave(&mut self, exit: Exit) {
//!         // disable USB, wait, then jump or reset
//!     }
//! }
//!
//! struct Nvm;
//!
//! impl ProgramMemory for Nvm {
//!     fn begin_erase(&mut self, address: u32) { /* NVMCON, unlock */ }
//!     fn begin_write(&mut self, address: u32, word: u32) { /* latches, unlock */ }
//!     fn is_busy(&mut self) -> bool { /* NVMCON.WR */ false }
//!     fn read(&mut self, address: u32) -> u32 { /* table read */ 0 }
//! }
//!
//! static TIME: TimeBase = TimeBase::new();
//!
//! let mut hid = HidBootClass::new(&usb_bus_alloc);
//! let mut usb_dev = UsbDeviceBuilder::new(&usb_bus_alloc, UsbVidPid(0x04d8, 0xe89b)).build();
//! let mut boot = Bootloader::new(Board, Nvm, uart_tx, rs485_de);
//!
//! loop {
//!     usb_dev.poll(&mut [&mut hid]);
//!     let host = (usb_dev.state() == UsbDeviceState::Configured).then(|| &mut hid);
//!     boot.poll(TIME.now(), host);
//! }
//!
//! // UART interrupts forward to boot.on_serial_byte(),
//! // boot.on_serial_error() and boot.on_serial_tx_complete(),
//! // the 10 ms timer interrupt calls TIME.tick().
//! ```

/// USB HID transport
pub mod class;
/// Flash programming
pub mod flash;
pub mod frame;
pub mod link;
pub mod message;
pub mod packet;
/// Host command state machine
pub mod server;
/// Operation state shared between the state machine and the link
pub mod session;
pub mod target;
pub mod timer;

#[doc(inline)]
pub use crate::class::HidBootClass;
#[doc(inline)]
pub use crate::flash::{FlashEngine, FlashError, ProgramMemory};
#[doc(inline)]
pub use crate::frame::FrameError;
#[doc(inline)]
pub use crate::packet::{HostCommand, Packet, PacketError};
#[doc(inline)]
pub use crate::server::{Bootloader, Exit, HostPort, HostState, Platform, RunMode};
#[doc(inline)]
pub use crate::timer::{TimeBase, Timings};
