//! Software timers driven by a single periodic tick.
//!
//! A hardware timer interrupt calls [`TimeBase::tick`] every
//! [`TICK_PERIOD_MS`] milliseconds. The main loop reads [`TimeBase::now`]
//! and passes it to [`TimerBank::update`], which is the only place where
//! timers move from `Started` to `Running` and from `Running` to `Elapsed`.

use core::sync::atomic::{AtomicU16, Ordering};

/// Period of one timer tick.
pub const TICK_PERIOD_MS: u16 = 10;

/// Free running tick counter shared with the tick interrupt.
pub struct TimeBase {
    ticks: AtomicU16,
}

impl TimeBase {
    /// Counter starting at zero.
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU16::new(0),
        }
    }

    /// Advance the counter by one tick. Call from the tick interrupt.
    pub fn tick(&self) {
        // load/store only, single writer
        let now = self.ticks.load(Ordering::Relaxed);
        self.ticks.store(now.wrapping_add(1), Ordering::Relaxed);
    }

    /// Current tick count, wraps around.
    pub fn now(&self) -> u16 {
        self.ticks.load(Ordering::Relaxed)
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::new()
    }
}

/// Timers used by the bootloader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerId {
    /// Delay before a stand-alone start decides to leave the bootloader.
    ForceBootloader = 0,
    /// Quiet time after a frame before it is decoded.
    IntraFrame = 1,
    /// Spacing of broadcast retries.
    RetryBroadcast = 2,
    /// Spacing of reset retries.
    SendReset = 3,
    /// How long a slave has to answer.
    SlaveWindow = 4,
}

const TIMER_COUNT: usize = 5;

/// State of a single timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerState {
    /// Not counting.
    Halted,
    /// Start requested, counting begins on the next update.
    Started,
    /// Counting.
    Running,
    /// Duration reached. Stays here until stopped or restarted.
    Elapsed,
}

/// Timer durations, in ticks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timings {
    /// [`TimerId::ForceBootloader`], 2 s by default.
    pub force_bootloader: u16,
    /// [`TimerId::IntraFrame`], 20 ms by default.
    pub intra_frame: u16,
    /// [`TimerId::RetryBroadcast`], 100 ms by default.
    pub retry_broadcast: u16,
    /// [`TimerId::SendReset`], 100 ms by default.
    pub send_reset: u16,
    /// [`TimerId::SlaveWindow`], 500 ms by default.
    pub slave_window: u16,
}

impl Timings {
    /// Default durations.
    pub const DEFAULT: Timings = Timings {
        force_bootloader: 200,
        intra_frame: 2,
        retry_broadcast: 10,
        send_reset: 10,
        slave_window: 50,
    };

    fn duration(&self, id: TimerId) -> u16 {
        match id {
            TimerId::ForceBootloader => self.force_bootloader,
            TimerId::IntraFrame => self.intra_frame,
            TimerId::RetryBroadcast => self.retry_broadcast,
            TimerId::SendReset => self.send_reset,
            TimerId::SlaveWindow => self.slave_window,
        }
    }
}

impl Default for Timings {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Clone, Copy)]
struct TimerSlot {
    state: TimerState,
    duration: u16,
    started_at: u16,
}

/// Fixed bank of software countdown timers.
pub struct TimerBank {
    slots: [TimerSlot; TIMER_COUNT],
}

impl TimerBank {
    /// All timers halted, durations taken from `timings`.
    pub fn new(timings: Timings) -> Self {
        let mut slots = [TimerSlot {
            state: TimerState::Halted,
            duration: 0,
            started_at: 0,
        }; TIMER_COUNT];

        for id in [
            TimerId::ForceBootloader,
            TimerId::IntraFrame,
            TimerId::RetryBroadcast,
            TimerId::SendReset,
            TimerId::SlaveWindow,
        ] {
            slots[id as usize].duration = timings.duration(id);
        }

        Self { slots }
    }

    /// (Re)start a timer. Counting begins on the next [`update`](TimerBank::update).
    pub fn start(&mut self, id: TimerId) {
        self.slots[id as usize].state = TimerState::Started;
    }

    /// Halt a timer.
    pub fn stop(&mut self, id: TimerId) {
        self.slots[id as usize].state = TimerState::Halted;
    }

    /// Current state of a timer.
    pub fn state(&self, id: TimerId) -> TimerState {
        self.slots[id as usize].state
    }

    /// `true` once the timer has elapsed.
    pub fn elapsed(&self, id: TimerId) -> bool {
        self.state(id) == TimerState::Elapsed
    }

    /// Advance all timers to `now`.
    pub fn update(&mut self, now: u16) {
        for slot in self.slots.iter_mut() {
            match slot.state {
                TimerState::Running => {
                    if now.wrapping_sub(slot.started_at) >= slot.duration {
                        slot.state = TimerState::Elapsed;
                    }
                }
                TimerState::Started => {
                    slot.started_at = now;
                    slot.state = TimerState::Running;
                }
                TimerState::Halted | TimerState::Elapsed => {}
            }
        }
    }
}
