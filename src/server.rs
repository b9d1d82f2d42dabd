use embedded_hal::digital::v2::OutputPin;
use embedded_hal::serial;
use log::{debug, info, warn};

use crate::flash::{FlashEngine, FlashError, ProgramMemory};
use crate::link::{RetryLimits, SerialLink};
use crate::message::{Chunk, Reply, Request, CHUNK_WORDS};
use crate::packet::{DataBlock, HostCommand, Packet, Response, PACKET_SIZE, PASSWORD_LEN};
use crate::session::{ProgrammingSession, UNKNOWN_VERSION};
use crate::target::{
    regions, reply_id, Target, APPLICATION_SENTINEL, MASTER_APPLICATION,
    MASTER_APPLICATION_WITH_CONFIG, MAX_SLAVE_PACKETS, VECTORS,
};
use crate::timer::{TimerBank, TimerId, Timings};

/// Shared secret expected in query and version requests.
pub const DEFAULT_PASSWORD: [u8; PASSWORD_LEN] = [0x82, 0x14, 0x2A, 0x5D, 0x6F, 0x9A, 0x25, 0x01];

/// Way out of the bootloader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exit {
    /// Shut down USB and start the resident application.
    JumpToApplication,
    /// Shut down USB and reset the master.
    Reset,
}

/// Board specific settings and the final jump.
pub trait Platform {
    /// Secret the host must present to select a target.
    const PASSWORD: [u8; PASSWORD_LEN] = DEFAULT_PASSWORD;

    /// Version reported for the master, least significant byte first.
    /// Default is 1.9.2.
    const BOOT_VERSION: [u8; 3] = [0x02, 0x09, 0x01];

    /// Timer durations in ticks of [`TICK_PERIOD_MS`](crate::timer::TICK_PERIOD_MS).
    const TIMINGS: Timings = Timings::DEFAULT;

    /// Force-bootloader and jump broadcasts sent per period. Default is `30`.
    const MAX_BROADCAST_RETRIES: u8 = 30;

    /// Reset messages sent to a slave before programming is considered
    /// over. Default is `5`.
    const MAX_RESET_RETRIES: u8 = 5;

    /// Leave the bootloader.
    ///
    /// Implementation disables USB, waits for the host to notice and then
    /// jumps or resets. It should not return on real hardware.
    fn leave(&mut self, exit: Exit);
}

/// Primitives of the host transport.
pub trait HostPort {
    /// Fetch the next command packet. Returns `false` if none is waiting.
    ///
    /// The transport should hold further packets back until this is called.
    fn receive(&mut self, packet: &mut Packet) -> bool;

    /// Send a response packet. Returns `false` while the transport is busy.
    fn transmit(&mut self, packet: &Packet) -> bool;
}

/// What a slave exchange waits for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Awaiting {
    /// Ack of the last chunk or upload start.
    Ack,
    /// Program data for a read back request.
    ProgramData {
        /// Requested address.
        address: u32,
        /// Requested size.
        size: u8,
    },
    /// Version reply, or the window timeout.
    Version,
    /// End of the reset retries.
    Reset,
}

/// Host command state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostState {
    /// Waiting for a command.
    Idle,
    /// Processing a command.
    Busy(HostCommand),
    /// Response waiting for the transport.
    Respond(Packet),
    /// Waiting for a slave.
    WaitSlaveResponse(Awaiting),
    /// Bootloader left.
    Finished(Exit),
}

/// Overall mode of the bootloader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// USB not configured.
    Init,
    /// USB configured, commands are served and slaves are held in their
    /// bootloaders.
    Connected,
    /// Slaves are told to start their applications, the master follows.
    JumpToApp,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum StandAlone {
    Undecided,
    Stay,
}

/// The bootloader: host commands, master flash and slave relay.
///
/// [`poll()`](Bootloader::poll) is called from the main loop. The
/// `on_serial_*` functions are called from UART interrupts; when the
/// bootloader is shared with interrupt handlers, access must be
/// serialized by the caller (e.g. a critical section).
pub struct Bootloader<P: Platform, M: ProgramMemory, U, D> {
    platform: P,
    flash: FlashEngine<M>,
    uart: U,
    de: D,
    link: SerialLink,
    timers: TimerBank,
    session: ProgrammingSession,
    state: HostState,
    mode: RunMode,
    stand_alone: StandAlone,
    buffer: [u16; CHUNK_WORDS],
    buffered: usize,
}

impl<P, M, U, D> Bootloader<P, M, U, D>
where
    P: Platform,
    M: ProgramMemory,
    U: serial::Write<u8>,
    D: OutputPin,
{
    /// Creates the bootloader. `de` drives the RS485 transmit enable line.
    pub fn new(platform: P, mem: M, uart: U, mut de: D) -> Self {
        de.set_low().ok();

        let mut timers = TimerBank::new(P::TIMINGS);
        timers.start(TimerId::ForceBootloader);

        Self {
            platform,
            flash: FlashEngine::new(mem),
            uart,
            de,
            link: SerialLink::new(),
            timers,
            session: ProgrammingSession::new(),
            state: HostState::Idle,
            mode: RunMode::Init,
            stand_alone: StandAlone::Undecided,
            buffer: [0; CHUNK_WORDS],
            buffered: 0,
        }
    }

    /// One main loop iteration.
    ///
    /// `now` is the current tick count, `host` is `None` while USB is
    /// not configured.
    pub fn poll<H: HostPort>(&mut self, now: u16, host: Option<&mut H>) {
        if self.finished() {
            return;
        }

        self.timers.update(now);
        self.supervise(host.is_some());
        if self.finished() {
            return;
        }

        let reply = self.link.decode(&mut self.session, &mut self.timers);

        if self.mode == RunMode::Connected {
            if let Some(host) = host {
                self.serve(host, reply);
            }
        }
        if self.finished() {
            return;
        }

        let broadcast = match self.mode {
            RunMode::Init => None,
            RunMode::Connected => Some(Request::ForceBootloader),
            RunMode::JumpToApp => Some(Request::JumpToApplication),
        };
        let limits = RetryLimits {
            broadcast: P::MAX_BROADCAST_RETRIES,
            reset: P::MAX_RESET_RETRIES,
        };
        self.link
            .schedule(&mut self.session, &mut self.timers, broadcast, limits);
        self.link.send(&mut self.uart, &mut self.de);
    }

    /// Byte received by the UART. Call from the receive interrupt.
    pub fn on_serial_byte(&mut self, byte: u8) {
        self.link.on_byte(byte);
    }

    /// Overrun or framing error. Call from the receive interrupt.
    pub fn on_serial_error(&mut self) {
        self.link.on_line_error();
    }

    /// Transmitter ready for the next byte. Call from the transmit interrupt.
    pub fn on_serial_tx_complete(&mut self) {
        self.link.on_tx_complete(&mut self.uart, &mut self.de);
    }

    /// Host command state.
    pub fn state(&self) -> HostState {
        self.state
    }

    /// Run mode.
    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// Operation in progress.
    pub fn session(&self) -> &ProgrammingSession {
        &self.session
    }

    /// Serial link.
    pub fn link(&self) -> &SerialLink {
        &self.link
    }

    /// Timers.
    pub fn timers(&self) -> &TimerBank {
        &self.timers
    }

    /// Master flash.
    pub fn flash(&mut self) -> &mut FlashEngine<M> {
        &mut self.flash
    }

    /// Board hooks.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// UART.
    pub fn uart(&mut self) -> &mut U {
        &mut self.uart
    }

    /// `true` if an application is installed on the master.
    pub fn application_present(&mut self) -> bool {
        self.flash.is_programmed(APPLICATION_SENTINEL)
    }

    fn finished(&self) -> bool {
        matches!(self.state, HostState::Finished(_))
    }

    fn finish(&mut self, exit: Exit) {
        info!("leaving bootloader: {:?}", exit);
        self.state = HostState::Finished(exit);
        // may not return
        self.platform.leave(exit);
    }

    fn supervise(&mut self, connected: bool) {
        if self.mode == RunMode::JumpToApp {
            if self.timers.elapsed(TimerId::ForceBootloader) {
                self.timers.stop(TimerId::ForceBootloader);
                self.finish(Exit::JumpToApplication);
            }
            return;
        }

        let mode = if connected {
            RunMode::Connected
        } else {
            RunMode::Init
        };
        if mode != self.mode {
            info!("mode {:?} -> {:?}", self.mode, mode);
            self.mode = mode;
        }

        if self.mode == RunMode::Init {
            self.session.enable_broadcast();

            if self.timers.elapsed(TimerId::ForceBootloader) {
                self.timers.stop(TimerId::ForceBootloader);
                if self.stand_alone == StandAlone::Undecided {
                    if self.application_present() {
                        self.finish(Exit::JumpToApplication);
                    } else {
                        info!("no application, staying in bootloader");
                        self.stand_alone = StandAlone::Stay;
                    }
                }
            }
        }
    }

    fn serve<H: HostPort>(&mut self, host: &mut H, reply: Option<Reply>) {
        if self.state == HostState::Idle {
            let mut packet = [0u8; PACKET_SIZE];
            if host.receive(&mut packet) {
                match HostCommand::parse(&packet) {
                    Ok(command) => {
                        debug!("host: command {:#04x}", command.code());
                        self.state = HostState::Busy(command);
                    }
                    Err(e) => warn!("host: {:?}", e),
                }
            }
        }

        match self.state {
            HostState::Busy(command) => self.state = self.execute(command),
            HostState::WaitSlaveResponse(awaiting) => self.state = self.resolve(awaiting, reply),
            HostState::Idle | HostState::Respond(_) | HostState::Finished(_) => {}
        }

        if let HostState::Respond(packet) = self.state {
            if host.transmit(&packet) {
                self.state = HostState::Idle;
            }
        }
    }

    fn execute(&mut self, command: HostCommand) -> HostState {
        match command {
            HostCommand::QueryDevice { password, target } => {
                if !self.authorize(&password, target) {
                    return HostState::Idle;
                }
                let list = regions(self.session.target, self.session.config_unlocked);
                HostState::Respond(Response::query(&list))
            }
            HostCommand::UnlockConfig { lock } => {
                self.session.config_unlocked = lock == 0;
                info!("config words unlocked: {}", self.session.config_unlocked);
                HostState::Idle
            }
            HostCommand::EraseDevice => match self.session.target {
                Target::Master => {
                    let res = self.erase_master();
                    self.after_flash(res)
                }
                Target::Slave(_) => self.erase_slave(),
                Target::Broadcast => self.no_slave(command),
            },
            HostCommand::ProgramDevice(block) => match self.session.target {
                Target::Master => {
                    let res = self.program_master(&block);
                    self.after_flash(res)
                }
                Target::Slave(_) => self.program_slave(&block, false),
                Target::Broadcast => self.no_slave(command),
            },
            HostCommand::ProgramComplete(block) => match self.session.target {
                Target::Master => {
                    let res = self.flush_master();
                    self.session.program_pointer = None;
                    self.after_flash(res)
                }
                Target::Slave(_) => self.program_slave(&block, true),
                Target::Broadcast => self.no_slave(command),
            },
            HostCommand::GetData { address, size } => match self.session.target {
                Target::Master => HostState::Respond(self.read_master(address, size)),
                Target::Slave(_) => {
                    self.link.request(Request::GetProgramData { address, size });
                    HostState::WaitSlaveResponse(Awaiting::ProgramData { address, size })
                }
                Target::Broadcast => self.no_slave(command),
            },
            HostCommand::ResetDevice => {
                if self.session.target.is_master() {
                    if self.application_present() {
                        self.finish(Exit::JumpToApplication);
                        return self.state;
                    }
                    warn!("reset: no application on master");
                    HostState::Idle
                } else {
                    self.session.start_reset();
                    self.link.request(Request::Reset);
                    self.timers.start(TimerId::SendReset);
                    HostState::WaitSlaveResponse(Awaiting::Reset)
                }
            }
            HostCommand::JumpToApplication => {
                self.select(Target::Broadcast);
                if self.application_present() {
                    info!("jump requested, releasing slaves");
                    self.mode = RunMode::JumpToApp;
                    self.session.enable_broadcast();
                    self.timers.stop(TimerId::RetryBroadcast);
                    self.timers.start(TimerId::ForceBootloader);
                } else {
                    warn!("jump: no application on master");
                }
                HostState::Idle
            }
            HostCommand::BootFwVersionRequest { password, target } => {
                if !self.authorize(&password, target) {
                    return HostState::Idle;
                }
                if self.session.target.is_master() {
                    HostState::Respond(Response::version(P::BOOT_VERSION))
                } else {
                    self.session.slave_version = UNKNOWN_VERSION;
                    self.session.version_requested = true;
                    self.timers.start(TimerId::SlaveWindow);
                    self.link.request(Request::VersionRequest);
                    HostState::WaitSlaveResponse(Awaiting::Version)
                }
            }
        }
    }

    fn resolve(&mut self, awaiting: Awaiting, reply: Option<Reply>) -> HostState {
        let waiting = HostState::WaitSlaveResponse(awaiting);

        match (awaiting, reply) {
            (Awaiting::Ack, Some(Reply::Ack { sequence })) => {
                if sequence == self.session.tx_sequence {
                    HostState::Idle
                } else {
                    debug!(
                        "ack {} while waiting for {}",
                        sequence, self.session.tx_sequence
                    );
                    waiting
                }
            }
            (Awaiting::Ack, Some(Reply::Nack { sequence, error })) => {
                warn!("slave refused chunk {}: error {:#04x}", sequence, error);
                HostState::Idle
            }
            (Awaiting::ProgramData { address, size }, Some(Reply::ProgramData(words))) => {
                HostState::Respond(Response::data(address, size, &words))
            }
            (Awaiting::Version, Some(Reply::Version(version))) => {
                HostState::Respond(Response::version(version))
            }
            (Awaiting::Reset, _) => {
                if self.session.end_programming {
                    self.finish(Exit::Reset);
                    self.state
                } else {
                    waiting
                }
            }
            _ => waiting,
        }
    }

    fn authorize(&mut self, password: &[u8; PASSWORD_LEN], target: u8) -> bool {
        if *password != P::PASSWORD {
            warn!("host: bad password");
            return false;
        }
        match Target::from_id(target) {
            Some(target) => {
                self.select(target);
                true
            }
            None => {
                warn!("host: no device with id {}", target);
                false
            }
        }
    }

    fn select(&mut self, target: Target) {
        if target != self.session.target {
            debug!("target {:?}", target);
        }
        self.session.target = target;
        self.link.listen_to(reply_id(target.id()));
    }

    fn no_slave(&self, command: HostCommand) -> HostState {
        warn!("command {:#04x} needs a slave target", command.code());
        HostState::Idle
    }

    fn after_flash(&mut self, res: Result<(), FlashError>) -> HostState {
        if let Err(e) = res {
            warn!("flash operation failed: {:?}", e);
            self.session.flash_error = Some(e);
            self.session.program_pointer = None;
            self.buffered = 0;
        }
        HostState::Idle
    }

    fn erase_master(&mut self) -> Result<(), FlashError> {
        self.stand_alone = StandAlone::Stay;

        let area = if self.session.config_unlocked {
            MASTER_APPLICATION_WITH_CONFIG
        } else {
            MASTER_APPLICATION
        };
        let first = area.start / M::PAGE_SIZE;
        let last = area.stop / M::PAGE_SIZE;
        info!("erasing master pages {}..{}", first, last);

        for page in first..last {
            self.flash.erase_page(page)?;
        }
        if self.session.config_unlocked {
            self.flash.erase_page(VECTORS.start / M::PAGE_SIZE)?;
        }
        Ok(())
    }

    fn program_master(&mut self, block: &DataBlock) -> Result<(), FlashError> {
        if block_end(block).is_none() {
            warn!("program @{:#x}: address out of range", block.address);
            return Ok(());
        }

        let mut pointer = *self.session.program_pointer.get_or_insert(block.address);
        if pointer != block.address {
            warn!(
                "program @{:#x} not contiguous, expected @{:#x}",
                block.address, pointer
            );
            return Ok(());
        }

        for word in block.words() {
            self.buffer[self.buffered] = *word;
            self.buffered += 1;
            pointer += 1;
            self.session.program_pointer = Some(pointer);

            if self.buffered == CHUNK_WORDS {
                self.buffered = 0;
                let start = pointer - CHUNK_WORDS as u32;
                self.flash.write_subblock(start, &self.buffer)?;
            }
        }
        Ok(())
    }

    fn flush_master(&mut self) -> Result<(), FlashError> {
        let count = self.buffered;
        self.buffered = 0;

        match self.session.program_pointer {
            Some(pointer) if count > 0 => {
                let start = pointer - count as u32;
                self.flash.write_subblock(start, &self.buffer[..count])
            }
            _ => Ok(()),
        }
    }

    fn read_master(&mut self, address: u32, size: u8) -> Packet {
        let count = (size as usize / 2).min(CHUNK_WORDS);
        let mut words = [0u16; CHUNK_WORDS];

        for (i, pair) in words[..count].chunks_mut(2).enumerate() {
            let word = self.flash.read_word(address.wrapping_add(2 * i as u32));
            pair[0] = word as u16;
            if let Some(high) = pair.get_mut(1) {
                *high = (word >> 16) as u16 & 0x00FF;
            }
        }
        Response::data(address, size, &words[..count])
    }

    fn erase_slave(&mut self) -> HostState {
        let profile = self.session.target.class().profile();
        self.session.start_address = profile.program.start;
        self.session.packet_count = MAX_SLAVE_PACKETS;
        self.session.tx_sequence = 0;
        self.session.slave_error = None;

        self.link.request(Request::UploadStart {
            address: self.session.start_address,
            packets: self.session.packet_count,
        });
        HostState::WaitSlaveResponse(Awaiting::Ack)
    }

    fn program_slave(&mut self, block: &DataBlock, last: bool) -> HostState {
        if last {
            self.session.program_pointer = None;
        } else {
            let end = match block_end(block) {
                Some(end) => end,
                None => {
                    warn!("program @{:#x}: address out of range", block.address);
                    return HostState::Idle;
                }
            };
            let pointer = *self.session.program_pointer.get_or_insert(block.address);
            if pointer != block.address {
                warn!(
                    "program @{:#x} not contiguous, expected @{:#x}",
                    block.address, pointer
                );
                return HostState::Idle;
            }
            self.session.program_pointer = Some(end);
        }

        self.session.tx_sequence = self.session.tx_sequence.wrapping_add(1);

        let mut words = [0u16; CHUNK_WORDS];
        let valid = block.words();
        words[..valid.len()].copy_from_slice(valid);

        let chunk = Chunk {
            sequence: self.session.tx_sequence,
            address: block.address,
            size: block.size,
            words,
        };
        self.session.chunk = chunk;

        self.link.request(if last {
            Request::EndOfUpload(chunk)
        } else {
            Request::DataChunk(chunk)
        });
        HostState::WaitSlaveResponse(Awaiting::Ack)
    }
}

/// Address following the last half of `block`, `None` past the address space.
fn block_end(block: &DataBlock) -> Option<u32> {
    block.address.checked_add(block.words().len() as u32)
}
