//! RS485 link to the slaves.
//!
//! Bytes are received one at a time from the UART receive interrupt and
//! reassembled by [`Receiver`]. Outgoing messages wait in a single slot,
//! are framed when the transmitter is idle and are then drained by the
//! transmit interrupt, with the transceiver driver enabled for the whole
//! frame.

use embedded_hal::digital::v2::OutputPin;
use embedded_hal::serial;
use log::{debug, info, warn};

use crate::frame::{
    self, compute_crc16, crc_from_nibbles, unbias, unstuff, FrameError, FrameWriter, CRC_NIBBLES,
    ESC, ETX, HEADER_LEN, MAX_FRAME_SIZE, MIN_FRAME_SIZE, STX, TRAILER_LEN,
};
use crate::message::{Reply, Request};
use crate::session::{ProgrammingSession, UNKNOWN_VERSION};
use crate::target::{is_valid_id, BROADCAST_ID};
use crate::timer::{TimerBank, TimerId, TimerState};

/// Receive state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RxState {
    /// Discarding bytes until `STX`.
    WaitStart,
    /// Next byte is the biased device id.
    WaitDeviceId,
    /// Next byte is the biased frame length.
    WaitLength,
    /// Collecting stuffed payload bytes.
    WaitPayload {
        /// Previous byte was `ESC`.
        escape: bool,
    },
    /// Collecting the CRC nibbles.
    WaitCrc,
    /// Next byte must be `ETX`.
    WaitEnd,
    /// A frame addressed to us is waiting to be decoded. Further bytes
    /// are dropped until it is consumed.
    Complete,
}

/// Reassembles frames from received bytes.
pub struct Receiver {
    state: RxState,
    buf: [u8; MAX_FRAME_SIZE],
    index: usize,
    body_len: usize,
    payload_len: usize,
    device_id: u8,
    peer: u8,
}

impl Receiver {
    /// Receiver waiting for a frame from device `peer` (on-wire id).
    pub fn new(peer: u8) -> Self {
        Self {
            state: RxState::WaitStart,
            buf: [0; MAX_FRAME_SIZE],
            index: 0,
            body_len: 0,
            payload_len: 0,
            device_id: 0,
            peer,
        }
    }

    /// Current state.
    pub fn state(&self) -> RxState {
        self.state
    }

    /// Only frames with this on-wire id complete.
    pub fn set_peer(&mut self, peer: u8) {
        self.peer = peer;
    }

    /// Drop whatever was received and wait for the next `STX`.
    pub fn reset(&mut self) {
        self.state = RxState::WaitStart;
        self.index = 0;
        self.body_len = 0;
        self.payload_len = 0;
        self.device_id = 0;
    }

    /// `true` when a frame is waiting to be decoded.
    pub fn is_complete(&self) -> bool {
        self.state == RxState::Complete
    }

    /// Unstuffed payload of a completed frame.
    pub fn payload(&self) -> Option<&[u8]> {
        self.is_complete()
            .then(|| &self.buf[HEADER_LEN..HEADER_LEN + self.payload_len])
    }

    /// Feed one received byte. Any error resets the receiver.
    pub fn push(&mut self, byte: u8) -> Result<(), FrameError> {
        let res = self.step(byte);
        if res.is_err() {
            self.reset();
        }
        res
    }

    fn store(&mut self, byte: u8) -> Result<(), FrameError> {
        let slot = self.buf.get_mut(self.index).ok_or(FrameError::Overflow)?;
        *slot = byte;
        self.index += 1;
        Ok(())
    }

    fn step(&mut self, byte: u8) -> Result<(), FrameError> {
        match self.state {
            RxState::WaitStart => {
                if byte == STX {
                    self.store(byte)?;
                    self.state = RxState::WaitDeviceId;
                }
            }
            RxState::WaitDeviceId => {
                self.store(byte)?;
                let id = unbias(byte);
                if !is_valid_id(id) {
                    return Err(FrameError::InvalidDeviceId);
                }
                self.device_id = id;
                self.state = RxState::WaitLength;
            }
            RxState::WaitLength => {
                self.store(byte)?;
                let len = unbias(byte) as usize;
                if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&len) {
                    return Err(FrameError::InvalidLength);
                }
                self.body_len = len - TRAILER_LEN;
                self.state = RxState::WaitPayload { escape: false };
            }
            RxState::WaitPayload { escape } => {
                let escape = if escape {
                    if frame::unescape(byte).is_none() {
                        return Err(FrameError::IllegalEscape);
                    }
                    false
                } else {
                    byte == ESC
                };
                self.store(byte)?;

                self.state = if self.index < self.body_len {
                    RxState::WaitPayload { escape }
                } else if escape {
                    // payload cannot end in the middle of an escape
                    return Err(FrameError::IllegalEscape);
                } else {
                    RxState::WaitCrc
                };
            }
            RxState::WaitCrc => {
                self.store(byte)?;
                if self.index == self.body_len + CRC_NIBBLES {
                    self.state = RxState::WaitEnd;
                }
            }
            RxState::WaitEnd => {
                if byte != ETX {
                    return Err(FrameError::MissingEndMarker);
                }

                let body = self.body_len;
                let received = crc_from_nibbles(&self.buf[body..body + CRC_NIBBLES])
                    .ok_or(FrameError::CrcMismatch)?;
                if received != compute_crc16(&self.buf[..body], 0) {
                    return Err(FrameError::CrcMismatch);
                }
                self.store(byte)?;

                self.payload_len = unstuff(&mut self.buf, HEADER_LEN, body - HEADER_LEN)?;

                if self.device_id != self.peer {
                    return Err(FrameError::NotAddressed);
                }
                self.state = RxState::Complete;
            }
            RxState::Complete => {}
        }
        Ok(())
    }
}

/// Transmit path state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxState {
    /// Nothing to send.
    Idle,
    /// A frame is built and waits for the line.
    Ready,
    /// A frame is being shifted out, `index` is the next byte.
    Sending {
        /// Next byte to send.
        index: usize,
    },
}

/// Retry limits of the link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryLimits {
    /// Most broadcasts per broadcast period.
    pub broadcast: u8,
    /// Most reset messages sent to a slave.
    pub reset: u8,
}

/// Serial link manager: receiver, transmit slot and retry policy.
pub struct SerialLink {
    rx: Receiver,
    tx_state: TxState,
    tx_buf: [u8; MAX_FRAME_SIZE],
    tx_len: usize,
    pending: Option<Request>,
}

impl Default for SerialLink {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialLink {
    /// Idle link, not listening to any slave.
    pub fn new() -> Self {
        Self {
            rx: Receiver::new(BROADCAST_ID),
            tx_state: TxState::Idle,
            tx_buf: [0; MAX_FRAME_SIZE],
            tx_len: 0,
            pending: None,
        }
    }

    /// The receiver.
    pub fn receiver(&self) -> &Receiver {
        &self.rx
    }

    /// State of the transmit path.
    pub fn tx_state(&self) -> TxState {
        self.tx_state
    }

    /// Message waiting for the transmitter.
    pub fn pending(&self) -> Option<&Request> {
        self.pending.as_ref()
    }

    /// Accept replies from on-wire id `peer` only.
    pub fn listen_to(&mut self, peer: u8) {
        self.rx.set_peer(peer);
    }

    /// Queue a message, replacing one that was not framed yet.
    pub fn request(&mut self, request: Request) {
        if let Some(old) = self.pending.replace(request) {
            debug!("link: {:#04x} replaced by {:#04x}", old.tag(), request.tag());
        }
    }

    /// Byte from the UART receive interrupt.
    pub fn on_byte(&mut self, byte: u8) {
        if let Err(e) = self.rx.push(byte) {
            debug!("link: rx error {:?}", e);
        }
    }

    /// Overrun or framing error reported by the UART.
    pub fn on_line_error(&mut self) {
        debug!("link: line error");
        self.rx.reset();
    }

    /// Previous byte left the transmitter. Call from the UART transmit
    /// interrupt.
    pub fn on_tx_complete<U, D>(&mut self, uart: &mut U, de: &mut D)
    where
        U: serial::Write<u8>,
        D: OutputPin,
    {
        if let TxState::Sending { index } = self.tx_state {
            if index >= self.tx_len {
                de.set_low().ok();
                self.tx_state = TxState::Idle;
            } else if uart.write(self.tx_buf[index]).is_ok() {
                self.tx_state = TxState::Sending { index: index + 1 };
            }
        }
    }

    /// Decode a completed frame once the line has been quiet long enough,
    /// or give up on a slave that does not answer.
    pub(crate) fn decode(
        &mut self,
        session: &mut ProgrammingSession,
        timers: &mut TimerBank,
    ) -> Option<Reply> {
        if self.rx.is_complete() {
            timers.stop(TimerId::SlaveWindow);

            match timers.state(TimerId::IntraFrame) {
                TimerState::Halted => {
                    timers.start(TimerId::IntraFrame);
                    None
                }
                TimerState::Elapsed => {
                    let reply = self.rx.payload().and_then(Reply::decode);
                    self.rx.reset();
                    timers.stop(TimerId::IntraFrame);
                    reply.map(|r| absorb(session, r))
                }
                TimerState::Started | TimerState::Running => None,
            }
        } else if timers.elapsed(TimerId::SlaveWindow) {
            timers.stop(TimerId::SlaveWindow);
            timers.stop(TimerId::IntraFrame);
            self.rx.reset();

            if session.version_requested {
                info!("link: no answer from slave {}", session.target.id());
                session.version_requested = false;
                session.slave_version = UNKNOWN_VERSION;
                Some(Reply::Version(UNKNOWN_VERSION))
            } else {
                None
            }
        } else {
            None
        }
    }

    /// Queue broadcasts and reset retries, then frame the pending message
    /// if the transmitter is free.
    pub(crate) fn schedule(
        &mut self,
        session: &mut ProgrammingSession,
        timers: &mut TimerBank,
        broadcast: Option<Request>,
        limits: RetryLimits,
    ) {
        if let Some(message) = broadcast {
            if timers.state(TimerId::RetryBroadcast) != TimerState::Running
                && self.pending.is_none()
            {
                if session.broadcast_retries < limits.broadcast {
                    self.pending = Some(message);
                    session.broadcast_retries += 1;
                    timers.start(TimerId::RetryBroadcast);
                } else {
                    timers.stop(TimerId::RetryBroadcast);
                }
            }
        }

        if session.resetting && timers.elapsed(TimerId::SendReset) {
            if session.reset_retries < limits.reset {
                self.request(Request::Reset);
                session.reset_retries += 1;
                timers.start(TimerId::SendReset);
            } else {
                info!("link: reset retries exhausted, programming ended");
                timers.stop(TimerId::SendReset);
                session.resetting = false;
                session.end_programming = true;
            }
        }

        if self.tx_state == TxState::Idle {
            if let Some(request) = self.pending.take() {
                if let Err(e) = self.build(session, &request) {
                    warn!("link: cannot frame {:#04x}: {:?}", request.tag(), e);
                }
            }
        }
    }

    fn build(&mut self, session: &ProgrammingSession, request: &Request) -> Result<(), FrameError> {
        let destination = if request.is_broadcast() {
            BROADCAST_ID
        } else {
            session.target.id()
        };
        let width = session.target.class().profile().address_width;

        let mut frame = FrameWriter::new(destination);
        request.encode(width, &mut frame)?;
        let bytes = frame.finish()?;

        self.tx_buf[..bytes.len()].copy_from_slice(bytes);
        self.tx_len = bytes.len();
        self.tx_state = TxState::Ready;

        debug!(
            "link: frame {:#04x} to {} ({} bytes)",
            request.tag(),
            destination,
            self.tx_len
        );
        Ok(())
    }

    /// Start shifting out a ready frame.
    pub(crate) fn send<U, D>(&mut self, uart: &mut U, de: &mut D)
    where
        U: serial::Write<u8>,
        D: OutputPin,
    {
        if self.tx_state != TxState::Ready {
            return;
        }

        de.set_high().ok();
        match uart.write(self.tx_buf[0]) {
            Ok(()) => self.tx_state = TxState::Sending { index: 1 },
            Err(nb::Error::WouldBlock) => {
                // try again on the next poll
                de.set_low().ok();
            }
            Err(nb::Error::Other(_)) => {
                warn!("link: uart write failed");
                de.set_low().ok();
            }
        }
    }
}

fn absorb(session: &mut ProgrammingSession, reply: Reply) -> Reply {
    debug!("link: reply {:?}", reply);

    if session.version_requested {
        session.version_requested = false;
        let version = match reply {
            Reply::Version(v) => v,
            _ => UNKNOWN_VERSION,
        };
        session.slave_version = version;
        return Reply::Version(version);
    }

    match reply {
        Reply::Ack { sequence } => session.rx_sequence = sequence,
        Reply::Nack { sequence, error } => {
            session.rx_sequence = sequence;
            session.slave_error = Some(error);
        }
        Reply::Version(v) => session.slave_version = v,
        Reply::ProgramData(_) | Reply::Unknown(_) => {}
    }
    reply
}
