// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel time: the tick counter, deadline arithmetic, and unit conversion.
//!
//! Time in this kernel is a free-running 32-bit tick counter that wraps.
//! Because it wraps, absolute tick values cannot be compared with `<`;
//! deadlines are compared with [`Ticks::reached_by`], which works in the
//! half-range window. Relative timeouts are therefore limited to
//! [`MAX_TIMEOUT_TICKS`]; everything longer saturates to that bound (at the
//! default 1 kHz tick that is about 24 days, which is plenty for a bounded
//! wait).

/// In-kernel timestamp, measured in ticks since boot (modulo 2^32).
///
/// This type *deliberately* does not implement `PartialOrd`/`Ord`: with a
/// wrapping counter, `a < b` is meaningless. Use [`Ticks::reached_by`] for
/// deadline checks.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Ticks(u32);

/// Largest relative timeout, in ticks, that can be armed.
///
/// One less than the half-range window so that the internal one-tick
/// round-up never pushes a deadline past the distance `reached_by` can
/// express.
pub const MAX_TIMEOUT_TICKS: u32 = (1 << 31) - 2;

impl Ticks {
    pub const fn new(t: u32) -> Self {
        Self(t)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns the timestamp `delta` ticks after `self`, wrapping.
    pub fn after(self, delta: u32) -> Ticks {
        Ticks(self.0.wrapping_add(delta))
    }

    /// Checks whether this deadline has been reached at time `now`.
    ///
    /// True when `now` is at or past `self`, interpreted in the half-range
    /// window: any distance up to 2^31 - 1 ticks ahead of the deadline
    /// counts as "reached"; anything else counts as "not yet". This is what
    /// makes deadline checks survive counter wraparound.
    pub fn reached_by(self, now: Ticks) -> bool {
        now.0.wrapping_sub(self.0) < (1 << 31)
    }
}

impl From<u32> for Ticks {
    fn from(v: u32) -> Self {
        Ticks(v)
    }
}

impl From<Ticks> for u32 {
    fn from(v: Ticks) -> Self {
        v.0
    }
}

/// Converts milliseconds to ticks at `hz`, rounding up, saturating at
/// [`MAX_TIMEOUT_TICKS`].
///
/// Rounding up means a nonzero duration never converts to zero ticks, so a
/// caller asking for "a little while" cannot accidentally ask for a poll.
pub fn ms_to_ticks(hz: u32, ms: u32) -> u32 {
    let t = (u64::from(ms) * u64::from(hz)).div_ceil(1_000);
    t.min(u64::from(MAX_TIMEOUT_TICKS)) as u32
}

/// Converts microseconds to ticks at `hz`, rounding up, saturating at
/// [`MAX_TIMEOUT_TICKS`].
pub fn us_to_ticks(hz: u32, us: u32) -> u32 {
    let t = (u64::from(us) * u64::from(hz)).div_ceil(1_000_000);
    t.min(u64::from(MAX_TIMEOUT_TICKS)) as u32
}

/// The kernel's clock state: current tick, uptime accumulator, and the
/// settable wall-clock offset.
///
/// Whole seconds of uptime are accumulated tick by tick, so the wall clock
/// and uptime stay correct across 32-bit tick wraparound.
#[derive(Debug)]
pub struct Clock {
    hz: u32,
    now: Ticks,
    subsec: u32,
    secs: u64,
    wall_at_boot: u64,
}

impl Clock {
    pub fn new(hz: u32, start: Ticks) -> Self {
        debug_assert!(hz > 0);
        Self {
            hz,
            now: start,
            subsec: 0,
            secs: 0,
            wall_at_boot: 0,
        }
    }

    /// Advances time by one tick.
    pub fn advance(&mut self) {
        self.now = self.now.after(1);
        self.subsec += 1;
        if self.subsec == self.hz {
            self.subsec = 0;
            self.secs += 1;
        }
    }

    /// Current kernel time.
    pub fn now(&self) -> Ticks {
        self.now
    }

    /// Configured tick frequency.
    pub fn hz(&self) -> u32 {
        self.hz
    }

    /// Whole seconds elapsed since boot.
    pub fn uptime_secs(&self) -> u64 {
        self.secs
    }

    /// Wall-clock time in seconds, as set by [`Clock::set_sys_time`] plus
    /// uptime since then. Before anyone sets it, this is just uptime.
    pub fn sys_time(&self) -> u64 {
        self.wall_at_boot + self.secs
    }

    /// Sets the wall clock to `secs`.
    ///
    /// Setting a value earlier than the accumulated uptime pins the clock at
    /// uptime; the wall clock never runs backwards past boot.
    pub fn set_sys_time(&mut self, secs: u64) {
        self.wall_at_boot = secs.saturating_sub(self.secs);
    }
}
