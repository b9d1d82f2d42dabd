use log::{debug, warn};

/// Errors reported by [`FlashEngine`].
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlashError {
    /// Read back differs from what was written or erased.
    VerifyMismatch = 1,
    /// Flash controller stayed busy for too long.
    Timeout = 2,
}

/// Access to the flash controller of the master.
///
/// Operations are split in a "start" part and a busy flag, the way
/// NVM controllers usually work. [`FlashEngine`] drives the sequence,
/// waits for completion and verifies the result.
///
/// Addresses are program memory addresses. A program word is 24 bits
/// wide and spans two addresses.
pub trait ProgramMemory {
    /// Number of addresses in one erase page. Default is `0x400`
    /// (512 program words).
    const PAGE_SIZE: u32 = 0x400;

    /// Value of an erased program word. Default is `0x00FF_FFFF`.
    const ERASED_WORD: u32 = 0x00FF_FFFF;

    /// How many times [`is_busy()`](ProgramMemory::is_busy) is polled
    /// before an operation is declared timed out.
    const BUSY_POLL_LIMIT: u32 = 1_000_000;

    /// Start erasing the page that begins at `address`.
    ///
    /// Implementation performs the unlock sequence with interrupts
    /// disabled for its duration.
    fn begin_erase(&mut self, address: u32);

    /// Start programming one word at `address`.
    fn begin_write(&mut self, address: u32, word: u32);

    /// `true` while an erase or write is in progress.
    fn is_busy(&mut self) -> bool;

    /// Read the program word at `address`. High bits need not be masked.
    fn read(&mut self, address: u32) -> u32;

    /// Called before an erase or write sequence. Default does nothing.
    fn suspend_watchdog(&mut self) {}

    /// Called after an erase or write sequence, successful or not.
    /// Default does nothing.
    fn resume_watchdog(&mut self) {}
}

const WORD_MASK: u32 = 0x00FF_FFFF;

/// Page erase, word and sub-block programming with read-back
/// verification on top of a [`ProgramMemory`].
pub struct FlashEngine<M: ProgramMemory> {
    mem: M,
}

impl<M: ProgramMemory> FlashEngine<M> {
    /// Wrap a flash controller.
    pub fn new(mem: M) -> Self {
        Self { mem }
    }

    /// Underlying flash controller.
    pub fn memory(&mut self) -> &mut M {
        &mut self.mem
    }

    /// Erase page number `page` and check it reads back erased.
    pub fn erase_page(&mut self, page: u32) -> Result<(), FlashError> {
        let address = page.wrapping_mul(M::PAGE_SIZE);
        debug!("flash: erase page {} @{:#x}", page, address);

        self.guarded(|mem| {
            mem.begin_erase(address);
            wait_ready(mem)?;

            let mut offset = 0;
            while offset < M::PAGE_SIZE {
                let at = address.wrapping_add(offset);
                if mem.read(at) & WORD_MASK != M::ERASED_WORD {
                    warn!("flash: page {} not erased @{:#x}", page, at);
                    return Err(FlashError::VerifyMismatch);
                }
                offset += 2;
            }
            Ok(())
        })
    }

    /// Program one 24-bit word and check it reads back.
    pub fn write_word(&mut self, address: u32, value: u32) -> Result<(), FlashError> {
        self.guarded(|mem| program(mem, address, value & WORD_MASK))
    }

    /// Program consecutive words starting at `start`.
    ///
    /// `data` holds pairs of 16-bit halves, low half first, so
    /// `data.len() / 2` program words are written. A trailing odd half
    /// is written with a zero high half.
    pub fn write_subblock(&mut self, start: u32, data: &[u16]) -> Result<(), FlashError> {
        debug!("flash: write {} halves @{:#x}", data.len(), start);

        self.guarded(|mem| {
            for (i, pair) in data.chunks(2).enumerate() {
                let low = pair[0] as u32;
                let high = pair.get(1).copied().unwrap_or(0) as u32;
                let address = start.wrapping_add(2 * i as u32);
                program(mem, address, (high << 16 | low) & WORD_MASK)?;
            }
            Ok(())
        })
    }

    /// Read a program word, with the unimplemented top byte cleared.
    pub fn read_word(&mut self, address: u32) -> u32 {
        self.mem.read(address) & WORD_MASK
    }

    /// `true` if the word at `address` is not erased.
    pub fn is_programmed(&mut self, address: u32) -> bool {
        self.read_word(address) != M::ERASED_WORD
    }

    fn guarded<F>(&mut self, op: F) -> Result<(), FlashError>
    where
        F: FnOnce(&mut M) -> Result<(), FlashError>,
    {
        self.mem.suspend_watchdog();
        let res = op(&mut self.mem);
        self.mem.resume_watchdog();
        res
    }
}

fn program<M: ProgramMemory>(mem: &mut M, address: u32, value: u32) -> Result<(), FlashError> {
    mem.begin_write(address, value);
    wait_ready(mem)?;

    let stored = mem.read(address) & WORD_MASK;
    if stored != value {
        warn!(
            "flash: verify @{:#x}: wrote {:#08x}, read {:#08x}",
            address, value, stored
        );
        return Err(FlashError::VerifyMismatch);
    }
    Ok(())
}

fn wait_ready<M: ProgramMemory>(mem: &mut M) -> Result<(), FlashError> {
    for _ in 0..M::BUSY_POLL_LIMIT {
        if !mem.is_busy() {
            return Ok(());
        }
    }
    warn!("flash: controller busy timeout");
    Err(FlashError::Timeout)
}
