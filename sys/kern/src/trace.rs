// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel trace events.
//!
//! Interesting state transitions get recorded into a small in-memory ring
//! (see the `tracebuf` crate) stamped with the tick they happened on. The
//! ring is for a debugger or a test to read; nothing in the kernel consumes
//! it.
//!
//! Handles are recorded as their raw pool offsets and threads as raw ids,
//! keeping entries `Copy` and comparable so repeat events coalesce instead
//! of flushing the ring.

use tracebuf::Tracebuf;

/// How many trace slots the kernel carries.
pub const TRACE_DEPTH: usize = 64;

pub type KernelTrace = Tracebuf<Trace, TRACE_DEPTH>;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Trace {
    #[default]
    None,
    SemCreate { sem: u32 },
    SemDestroy { sem: u32 },
    /// Signal found a waiter and handed the permit straight over.
    SemSignalWake { sem: u32, thread: u16 },
    /// Signal found no waiter and bumped the count.
    SemSignalCount { sem: u32 },
    /// Wait took an available permit without blocking.
    SemAcquire { sem: u32, thread: u16 },
    /// Wait found nothing and parked the caller.
    SemBlock { sem: u32, thread: u16 },
    EventCreate { event: u32 },
    EventDestroy { event: u32 },
    EventSet { event: u32 },
    EventPulse { event: u32 },
    EventClear { event: u32 },
    /// Wait found the flag already set and completed in place.
    EventAcquire { event: u32, thread: u16 },
    EventBlock { event: u32, thread: u16 },
    EventWake { event: u32, thread: u16 },
    Sleep { thread: u16, ticks: u32 },
    Yield { thread: u16 },
    /// A blocking timeout or sleep deadline fired.
    Timeout { thread: u16 },
    AllocFail { size: u32 },
    TimeSet { secs: u64 },
}
