// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel context: one value owning everything the primitives touch.
//!
//! A [`Kernel`] borrows its thread table, pool arena, and block registry
//! from the embedder at construction and never allocates behind its back.
//! There is no global state anywhere in this crate (the optional
//! [`crate::startup`] seam installs a kernel into a static for embedders
//! that want that, but nothing here depends on it), so tests and multi-
//! instance embedders can build as many kernels as they like.
//!
//! The division of labor with the embedding scheduler is strict:
//!
//! * The embedder owns the CPU. It decides who runs, performs context
//!   switches, and delivers the periodic tick by calling [`Kernel::tick`].
//! * The kernel owns the *reasons* threads can't run. Every blocking
//!   operation returns a [`NextThread`] hint telling the scheduler whether
//!   the current thread may continue and who became runnable; acting on the
//!   hint is the embedder's call.
//!
//! Blocking operations take the calling thread's id explicitly. The kernel
//! has no notion of "current thread"; that is scheduler state.

use crate::event::event_view;
use crate::mem::{Entry, Pool, PoolFlags, PoolStat};
use crate::sem::sem_view;
use crate::thread::{NextThread, SchedState, Thread};
use crate::time::{self, Clock, Ticks, MAX_TIMEOUT_TICKS};
use crate::trace::{KernelTrace, Trace};
use crate::uassert;
use abi::{BlockAddr, KernError, ThreadId, WaitResult};

/// Boot-time kernel parameters.
#[derive(Copy, Clone, Debug)]
pub struct KernelConfig {
    /// Tick frequency the embedder will deliver, used to convert
    /// millisecond and microsecond timeouts.
    pub tick_hz: u32,
    /// Pool debugging aids.
    pub pool_flags: PoolFlags,
    /// Initial tick value. Starting near wraparound is useful in tests and
    /// harmless in production.
    pub start_tick: Ticks,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            tick_hz: 1_000,
            pool_flags: PoolFlags::empty(),
            start_tick: Ticks::new(0),
        }
    }
}

/// The kernel: thread table, pool, clock, and trace ring.
pub struct Kernel<'s> {
    pub(crate) threads: &'s mut [Thread],
    pub(crate) pool: Pool<'s>,
    pub(crate) clock: Clock,
    pub(crate) trace: KernelTrace,
}

impl<'s> Kernel<'s> {
    /// Builds a kernel over embedder-owned storage.
    ///
    /// `threads` is the fixed thread table; ids are indices into it. The
    /// pool is carved from `arena` with bookkeeping in `entries`. Asserts on
    /// boot-time configuration mistakes (oversized thread table, hopeless
    /// arena) rather than limping along.
    pub fn new(
        threads: &'s mut [Thread],
        arena: &'s mut [u8],
        entries: &'s mut [Entry],
        config: KernelConfig,
    ) -> Self {
        // Thread ids live in 16-bit links with one value reserved as the
        // sentinel.
        uassert!(threads.len() < usize::from(u16::MAX));
        Self {
            threads,
            pool: Pool::new(arena, entries, config.pool_flags),
            clock: Clock::new(config.tick_hz, config.start_tick),
            trace: KernelTrace::new(),
        }
    }

    /// Advances kernel time by one tick and pays out any expired timers.
    ///
    /// The embedder calls this from its periodic tick source. The returned
    /// hint says whether anyone woke: `Specific` for a single wake, `Other`
    /// for several.
    pub fn tick(&mut self) -> NextThread {
        self.clock.advance();
        let now = self.clock.now();
        self.expire_timers(now)
    }

    /// Sweeps the thread table for armed timers that `now` has reached,
    /// waking each affected thread with `TimedOut`.
    fn expire_timers(&mut self, now: Ticks) -> NextThread {
        let mut sched_hint = NextThread::Same;
        for i in 0..self.threads.len() {
            let Some(deadline) = self.threads[i].deadline() else {
                continue;
            };
            if !deadline.reached_by(now) {
                continue;
            }
            let tid = i as u16;
            match self.threads[i].state() {
                SchedState::InSemWait(h) => {
                    // The blocked state names the queue the thread is on;
                    // if the handle no longer validates, kernel state is
                    // corrupt.
                    let Ok(raw) = sem_view(&mut self.pool, h) else {
                        panic!("timer expiry on dead semaphore");
                    };
                    let r = raw.waiters.remove(&mut *self.threads, tid);
                    uassert!(r.is_ok());
                }
                SchedState::InEventWait(h) => {
                    let Ok(raw) = event_view(&mut self.pool, h) else {
                        panic!("timer expiry on dead event");
                    };
                    let r = raw.waiters.remove(&mut *self.threads, tid);
                    uassert!(r.is_ok());
                }
                SchedState::InSleep => {}
                SchedState::Runnable | SchedState::Stopped => {
                    // Timers are armed only by blocking and disarmed by
                    // every wake path.
                    uassert!(false);
                }
            }
            self.threads[i].wake(WaitResult::TimedOut);
            self.trace.record(now.raw(), Trace::Timeout { thread: tid });
            sched_hint = sched_hint.combine(NextThread::Specific(ThreadId::new(tid)));
        }
        sched_hint
    }

    /// Suspends `caller` for at least `ticks` ticks.
    ///
    /// `sleep(0)` does not suspend: the thread stays runnable and the hint
    /// asks the scheduler to offer the CPU around once (a yield). Nonzero
    /// sleeps are padded by one tick so the thread is never woken short of
    /// the requested duration by tick phase.
    pub fn sleep(&mut self, caller: ThreadId, ticks: u32) -> Result<NextThread, KernError> {
        let idx = self.caller_index(caller)?;
        uassert!(self.threads[idx].is_runnable());
        let now = self.clock.now();
        if ticks == 0 {
            self.threads[idx].set_result(WaitResult::TimedOut);
            self.trace
                .record(now.raw(), Trace::Yield { thread: caller.raw() });
            return Ok(NextThread::Other);
        }
        let deadline = now.after(ticks.min(MAX_TIMEOUT_TICKS) + 1);
        self.threads[idx].block(SchedState::InSleep, Some(deadline));
        self.trace.record(
            now.raw(),
            Trace::Sleep {
                thread: caller.raw(),
                ticks,
            },
        );
        Ok(NextThread::Other)
    }

    /// [`Kernel::sleep`] with the duration in milliseconds (rounded up to
    /// ticks; 0 ms is a yield).
    pub fn sleep_ms(&mut self, caller: ThreadId, ms: u32) -> Result<NextThread, KernError> {
        let t = time::ms_to_ticks(self.clock.hz(), ms);
        self.sleep(caller, t)
    }

    /// [`Kernel::sleep`] with the duration in microseconds.
    pub fn sleep_us(&mut self, caller: ThreadId, us: u32) -> Result<NextThread, KernError> {
        let t = time::us_to_ticks(self.clock.hz(), us);
        self.sleep(caller, t)
    }

    /// Allocates from the kernel pool at word alignment.
    pub fn alloc(&mut self, size: u32) -> Result<BlockAddr, KernError> {
        match self.pool.alloc(size) {
            Ok(addr) => Ok(addr),
            Err(e) => {
                self.trace
                    .record(self.clock.now().raw(), Trace::AllocFail { size });
                Err(e)
            }
        }
    }

    /// Allocates from the kernel pool at the requested alignment.
    pub fn alloc_aligned(&mut self, size: u32, align: u32) -> Result<BlockAddr, KernError> {
        match self.pool.alloc_aligned(size, align) {
            Ok(addr) => Ok(addr),
            Err(e) => {
                if e == KernError::OutOfMemory {
                    self.trace
                        .record(self.clock.now().raw(), Trace::AllocFail { size });
                }
                Err(e)
            }
        }
    }

    /// Returns a block to the kernel pool.
    pub fn free(&mut self, addr: BlockAddr) -> Result<(), KernError> {
        self.pool.free(addr)
    }

    /// Snapshot of pool occupancy.
    pub fn mem_stat(&self) -> PoolStat {
        self.pool.stat()
    }

    /// Current kernel time in ticks.
    pub fn now(&self) -> Ticks {
        self.clock.now()
    }

    /// Whole seconds since boot.
    pub fn uptime_secs(&self) -> u64 {
        self.clock.uptime_secs()
    }

    /// Wall-clock seconds: the last value given to
    /// [`Kernel::set_sys_time`] advanced by uptime since then.
    pub fn sys_time(&self) -> u64 {
        self.clock.sys_time()
    }

    /// Sets the wall clock.
    pub fn set_sys_time(&mut self, secs: u64) {
        self.clock.set_sys_time(secs);
        self.trace
            .record(self.clock.now().raw(), Trace::TimeSet { secs });
    }

    /// Looks up a thread by id, for the scheduler to inspect state and wait
    /// results.
    pub fn thread(&self, id: ThreadId) -> Result<&Thread, KernError> {
        self.threads.get(id.index()).ok_or(KernError::BadThread)
    }

    /// The whole thread table, for schedulers that scan.
    pub fn threads(&self) -> &[Thread] {
        self.threads
    }

    /// Read access to the trace ring.
    pub fn trace(&self) -> &KernelTrace {
        &self.trace
    }

    pub(crate) fn caller_index(&self, caller: ThreadId) -> Result<usize, KernError> {
        let idx = caller.index();
        if idx >= self.threads.len() {
            return Err(KernError::BadThread);
        }
        Ok(idx)
    }
}

/// Derives a wait-queue membership tag from a pool offset.
///
/// All waiter lists share the thread table, so tags must be nonzero (the
/// unlinked marker) and should differ between live objects. The high bit
/// keeps them out of the way of small fixed tags like the pool's free
/// chain. Objects 2^17 bytes apart can collide, which weakens misuse
/// *detection* only; membership is always cross-checked against the
/// thread's own blocked state before a queue is touched.
pub(crate) fn waiter_tag(addr: BlockAddr) -> u16 {
    0x8000 | ((addr.offset() >> 2) as u16 & 0x7fff)
}
