#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::rc::Rc;

use embedded_hal::digital::v2::OutputPin;
use embedded_hal::serial;

use usbd_relay_boot::frame::{
    compute_crc16, crc_from_nibbles, unbias, unstuff, FrameWriter, ETX, HEADER_LEN, STX,
    TRAILER_LEN,
};
use usbd_relay_boot::link::TxState;
use usbd_relay_boot::packet::{code, Packet, PACKET_SIZE};
use usbd_relay_boot::server::DEFAULT_PASSWORD;
use usbd_relay_boot::target::{reply_id, MASTER_APPLICATION_WITH_CONFIG};
use usbd_relay_boot::{Bootloader, Exit, HostPort, Platform, ProgramMemory};

pub const ERASED: u32 = 0x00FF_FFFF;

/// Flash with a byte of garbage above each 24-bit word, the way table
/// reads return phantom bits.
pub struct MockFlash {
    words: Vec<u32>,
    pub stuck_busy: bool,
    pub ignore_writes: bool,
    pub erases: usize,
    pub writes: usize,
    pub suspended: usize,
    pub resumed: usize,
}

impl MockFlash {
    pub fn new() -> Self {
        Self {
            words: vec![ERASED; MASTER_APPLICATION_WITH_CONFIG.stop as usize / 2],
            stuck_busy: false,
            ignore_writes: false,
            erases: 0,
            writes: 0,
            suspended: 0,
            resumed: 0,
        }
    }

    /// Program memory contents, without going through the engine.
    pub fn word(&self, address: u32) -> u32 {
        self.words[address as usize / 2]
    }

    pub fn set_word(&mut self, address: u32, value: u32) {
        self.words[address as usize / 2] = value & ERASED;
    }
}

impl ProgramMemory for MockFlash {
    const BUSY_POLL_LIMIT: u32 = 100;

    fn begin_erase(&mut self, address: u32) {
        self.erases += 1;
        let first = address as usize / 2;
        let count = Self::PAGE_SIZE as usize / 2;
        for w in self.words[first..first + count].iter_mut() {
            *w = ERASED;
        }
    }

    fn begin_write(&mut self, address: u32, word: u32) {
        self.writes += 1;
        if !self.ignore_writes {
            // flash can only clear bits
            self.words[address as usize / 2] &= word;
        }
    }

    fn is_busy(&mut self) -> bool {
        self.stuck_busy
    }

    fn read(&mut self, address: u32) -> u32 {
        // unimplemented memory reads as zero
        let word = self.words.get(address as usize / 2).copied().unwrap_or(0);
        word | 0xAB00_0000
    }

    fn suspend_watchdog(&mut self) {
        self.suspended += 1;
    }

    fn resume_watchdog(&mut self) {
        self.resumed += 1;
    }
}

/// RS485 line as seen from the master: transmitted bytes and the
/// driver enable level.
#[derive(Default)]
pub struct Wire {
    pub sent: Vec<u8>,
    pub de: bool,
    pub de_toggles: usize,
    pub sent_with_de_low: usize,
    pub busy: bool,
}

pub type SharedWire = Rc<RefCell<Wire>>;

pub struct MockUart(pub SharedWire);

impl serial::Write<u8> for MockUart {
    type Error = Infallible;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        let mut wire = self.0.borrow_mut();
        if wire.busy {
            return Err(nb::Error::WouldBlock);
        }
        if !wire.de {
            wire.sent_with_de_low += 1;
        }
        wire.sent.push(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

pub struct MockPin(pub SharedWire);

impl OutputPin for MockPin {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        let mut wire = self.0.borrow_mut();
        if wire.de {
            wire.de_toggles += 1;
        }
        wire.de = false;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        let mut wire = self.0.borrow_mut();
        if !wire.de {
            wire.de_toggles += 1;
        }
        wire.de = true;
        Ok(())
    }
}

#[derive(Default)]
pub struct TestPlatform {
    pub exits: Vec<Exit>,
}

impl Platform for TestPlatform {
    fn leave(&mut self, exit: Exit) {
        self.exits.push(exit);
    }
}

#[derive(Default)]
pub struct MockHost {
    pub inbox: VecDeque<Packet>,
    pub outbox: Vec<Packet>,
    pub busy: bool,
}

impl HostPort for MockHost {
    fn receive(&mut self, packet: &mut Packet) -> bool {
        match self.inbox.pop_front() {
            Some(p) => {
                *packet = p;
                true
            }
            None => false,
        }
    }

    fn transmit(&mut self, packet: &Packet) -> bool {
        if self.busy {
            return false;
        }
        self.outbox.push(*packet);
        true
    }
}

pub type TestBoot = Bootloader<TestPlatform, MockFlash, MockUart, MockPin>;

/// Bootloader wired to mocks, with a host and a clock.
pub struct Rig {
    pub boot: TestBoot,
    pub wire: SharedWire,
    pub host: MockHost,
    pub now: u16,
}

impl Rig {
    pub fn new() -> Self {
        let wire = SharedWire::default();
        let boot = Bootloader::new(
            TestPlatform::default(),
            MockFlash::new(),
            MockUart(wire.clone()),
            MockPin(wire.clone()),
        );
        Self {
            boot,
            wire,
            host: MockHost::default(),
            now: 0,
        }
    }

    /// Rig with an application installed on the master.
    pub fn with_application() -> Self {
        let mut rig = Self::new();
        rig.flash().set_word(0x2C04, 0x04_0200);
        rig
    }

    pub fn flash(&mut self) -> &mut MockFlash {
        self.boot.flash().memory()
    }

    /// One tick with USB configured. The transmit interrupt drains
    /// whatever frame was started.
    pub fn poll(&mut self) {
        self.now = self.now.wrapping_add(1);
        self.boot.poll(self.now, Some(&mut self.host));
        self.drain_tx();
    }

    /// One tick with USB not configured.
    pub fn poll_detached(&mut self) {
        self.now = self.now.wrapping_add(1);
        self.boot.poll::<MockHost>(self.now, None);
        self.drain_tx();
    }

    pub fn run(&mut self, ticks: usize) {
        for _ in 0..ticks {
            self.poll();
        }
    }

    pub fn drain_tx(&mut self) {
        for _ in 0..1000 {
            if self.boot.link().tx_state() == TxState::Idle {
                return;
            }
            self.boot.on_serial_tx_complete();
        }
        panic!("transmitter stuck");
    }

    /// Host sends `packet`, then the bootloader gets one tick.
    pub fn command(&mut self, packet: Packet) {
        self.host.inbox.push_back(packet);
        self.poll();
    }

    /// Last response to the host.
    pub fn response(&mut self) -> Packet {
        self.host.outbox.pop().expect("no response")
    }

    /// Frames sent since the last call, as (destination, payload).
    pub fn take_frames(&mut self) -> Vec<(u8, Vec<u8>)> {
        let bytes: Vec<u8> = self.wire.borrow_mut().sent.drain(..).collect();
        split_frames(&bytes).iter().map(|f| decode_frame(f)).collect()
    }

    /// Frames sent since the last call, broadcasts left out.
    pub fn take_addressed(&mut self) -> Vec<(u8, Vec<u8>)> {
        self.take_frames()
            .into_iter()
            .filter(|(id, _)| *id != 0)
            .collect()
    }

    /// Slave `slave` answers with `payload`.
    pub fn slave_says(&mut self, slave: u8, payload: &[u8]) {
        for b in slave_frame(slave, payload) {
            self.boot.on_serial_byte(b);
        }
    }

    /// Poll until the host state machine is idle again.
    pub fn until_idle(&mut self, limit: usize) -> usize {
        for i in 0..limit {
            if self.boot.state() == usbd_relay_boot::HostState::Idle {
                return i;
            }
            self.poll();
        }
        panic!("still {:?} after {} ticks", self.boot.state(), limit);
    }

    /// Select `target` with a query, dropping the response and any frames.
    pub fn select(&mut self, target: u8) {
        self.command(query(&DEFAULT_PASSWORD, target));
        self.response();
        self.take_frames();
    }
}

pub fn slave_frame(slave: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = FrameWriter::new(reply_id(slave));
    frame.extend(payload).unwrap();
    frame.finish().unwrap().to_vec()
}

pub fn split_frames(bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut start = None;
    for (i, b) in bytes.iter().enumerate() {
        match *b {
            STX => start = Some(i),
            ETX => {
                let s = start.take().expect("ETX without STX");
                frames.push(bytes[s..=i].to_vec());
            }
            _ => {}
        }
    }
    assert!(start.is_none(), "unterminated frame");
    frames
}

/// Check a complete frame and return (destination, unstuffed payload).
pub fn decode_frame(bytes: &[u8]) -> (u8, Vec<u8>) {
    assert_eq!(bytes[0], STX);
    assert_eq!(*bytes.last().unwrap(), ETX);

    let len = unbias(bytes[2]) as usize;
    assert_eq!(len, bytes.len());

    let body = len - TRAILER_LEN;
    let crc = crc_from_nibbles(&bytes[body..body + 4]).unwrap();
    assert_eq!(crc, compute_crc16(&bytes[..body], 0));

    let mut buf = bytes.to_vec();
    let n = unstuff(&mut buf, HEADER_LEN, body - HEADER_LEN).unwrap();
    (unbias(bytes[1]), buf[HEADER_LEN..HEADER_LEN + n].to_vec())
}

fn with_password(command: u8, password: &[u8; 8], target: u8) -> Packet {
    let mut p = [0u8; PACKET_SIZE];
    p[0] = command;
    p[1..9].copy_from_slice(password);
    p[9] = target;
    p
}

pub fn query(password: &[u8; 8], target: u8) -> Packet {
    with_password(code::QUERY_DEVICE, password, target)
}

pub fn version_request(password: &[u8; 8], target: u8) -> Packet {
    with_password(code::BOOT_FW_VERSION_REQUEST, password, target)
}

pub fn simple(command: u8) -> Packet {
    let mut p = [0u8; PACKET_SIZE];
    p[0] = command;
    p
}

pub fn unlock(lock: u8) -> Packet {
    let mut p = simple(code::UNLOCK_CONFIG);
    p[1] = lock;
    p
}

/// Program packet with `words` right-justified in the data field.
pub fn program(command: u8, address: u32, words: &[u16]) -> Packet {
    let mut p = simple(command);
    p[1..5].copy_from_slice(&address.to_le_bytes());
    p[5] = 2 * words.len() as u8;
    let first = 28 - words.len();
    for (i, w) in words.iter().enumerate() {
        let at = 8 + 2 * (first + i);
        p[at..at + 2].copy_from_slice(&w.to_le_bytes());
    }
    p
}

pub fn get_data(address: u32, size: u8) -> Packet {
    let mut p = simple(code::GET_DATA);
    p[1..5].copy_from_slice(&address.to_le_bytes());
    p[5] = size;
    p
}

/// Data words of a response, in packet order.
pub fn response_words(p: &Packet) -> Vec<u16> {
    (0..28)
        .map(|i| u16::from_le_bytes([p[8 + 2 * i], p[9 + 2 * i]]))
        .collect()
}
