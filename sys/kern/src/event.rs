// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Manual-reset event flags.
//!
//! An event flag is the broadcast counterpart to the semaphore: where a
//! signal wakes exactly one waiter, setting an event wakes *all* of them,
//! and a set event stays set (latched) until somebody clears it, so waits
//! that arrive late complete immediately without consuming anything.
//!
//! `pulse` is the non-latching variant: it wakes everything currently
//! queued but leaves the flag clear, for "something happened" notifications
//! where only threads already waiting should care.
//!
//! Storage and handle discipline are exactly as for semaphores: the state
//! lives in a pool block behind a magic word, and every operation
//! revalidates the handle. The magic differs from the semaphore magic, so a
//! handle of one kind aimed at a block of the other fails validation
//! instead of reinterpreting it.

use core::mem;

use crate::kernel::{waiter_tag, Kernel};
use crate::mem::Pool;
use crate::thread::{NextThread, SchedState};
use crate::time::{self, MAX_TIMEOUT_TICKS};
use crate::trace::Trace;
use crate::uassert;
use abi::{EventHandle, KernError, ThreadId, Timeout, WaitResult};
use ilist::List;
use zerocopy::FromBytes;

/// First word of every live event block.
const EVENT_MAGIC: u32 = 0x8d42_e6b1;

/// Flag states. Anything else in the `state` word means corruption.
const CLEAR: u32 = 0;
const SET: u32 = 1;

pub(crate) const EVENT_SIZE: u32 = mem::size_of::<RawEvent>() as u32;
pub(crate) const EVENT_ALIGN: u32 = mem::align_of::<RawEvent>() as u32;

/// Pool-resident event state.
#[derive(
    Debug,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::KnownLayout,
    zerocopy_derive::Immutable,
)]
#[repr(C)]
pub(crate) struct RawEvent {
    magic: u32,
    state: u32,
    pub(crate) waiters: List,
    reserved: u16,
}

/// Revalidates `event` and projects the pool block as a [`RawEvent`].
pub(crate) fn event_view<'p>(
    pool: &'p mut Pool<'_>,
    event: EventHandle,
) -> Result<&'p mut RawEvent, KernError> {
    let bytes = pool
        .block_bytes_mut(event.addr())
        .map_err(|_| KernError::BadHandle)?;
    let raw = RawEvent::mut_from_bytes(bytes).map_err(|_| KernError::BadHandle)?;
    if raw.magic != EVENT_MAGIC {
        return Err(KernError::BadHandle);
    }
    Ok(raw)
}

impl Kernel<'_> {
    /// Creates an event flag, initially set or clear per `set`.
    pub fn event_create(&mut self, set: bool) -> Result<EventHandle, KernError> {
        let now = self.clock.now();
        let addr = match self.pool.alloc_aligned(EVENT_SIZE, EVENT_ALIGN) {
            Ok(addr) => addr,
            Err(e) => {
                self.trace
                    .record(now.raw(), Trace::AllocFail { size: EVENT_SIZE });
                return Err(e);
            }
        };
        let bytes = self.pool.block_bytes_mut(addr)?;
        let raw = RawEvent::mut_from_bytes(bytes).map_err(|_| KernError::BadHandle)?;
        *raw = RawEvent {
            magic: EVENT_MAGIC,
            state: if set { SET } else { CLEAR },
            waiters: List::new(waiter_tag(addr)),
            reserved: 0,
        };
        self.trace
            .record(now.raw(), Trace::EventCreate { event: addr.offset() });
        Ok(EventHandle::from_addr(addr))
    }

    /// Destroys an event flag; refused with `Busy` while threads wait on it.
    pub fn event_destroy(&mut self, event: EventHandle) -> Result<(), KernError> {
        let now = self.clock.now();
        let raw = event_view(&mut self.pool, event)?;
        if !raw.waiters.is_empty() {
            return Err(KernError::Busy);
        }
        raw.magic = 0;
        let r = self.pool.free(event.addr());
        uassert!(r.is_ok());
        self.trace.record(
            now.raw(),
            Trace::EventDestroy {
                event: event.addr().offset(),
            },
        );
        Ok(())
    }

    /// Sets the flag and wakes every queued waiter.
    ///
    /// The flag latches: threads that wait after this complete immediately
    /// until someone calls [`Kernel::event_clear`]. Idempotent when already
    /// set.
    pub fn event_set(&mut self, event: EventHandle) -> Result<NextThread, KernError> {
        let now = self.clock.now();
        let raw = event_view(&mut self.pool, event)?;
        raw.state = SET;
        self.trace.record(
            now.raw(),
            Trace::EventSet {
                event: event.addr().offset(),
            },
        );
        let mut next = NextThread::Same;
        while let Some(tid) = raw.waiters.pop_head(&mut *self.threads) {
            let t = &mut self.threads[usize::from(tid)];
            uassert!(t.state() == SchedState::InEventWait(event));
            t.wake(WaitResult::Acquired);
            self.trace.record(
                now.raw(),
                Trace::EventWake {
                    event: event.addr().offset(),
                    thread: tid,
                },
            );
            next = next.combine(NextThread::Specific(ThreadId::new(tid)));
        }
        Ok(next)
    }

    /// Wakes every queued waiter without latching the flag.
    ///
    /// A thread that was not already waiting sees nothing; the next wait on
    /// a clear flag blocks as usual.
    pub fn event_pulse(&mut self, event: EventHandle) -> Result<NextThread, KernError> {
        let now = self.clock.now();
        let raw = event_view(&mut self.pool, event)?;
        self.trace.record(
            now.raw(),
            Trace::EventPulse {
                event: event.addr().offset(),
            },
        );
        let mut next = NextThread::Same;
        while let Some(tid) = raw.waiters.pop_head(&mut *self.threads) {
            let t = &mut self.threads[usize::from(tid)];
            uassert!(t.state() == SchedState::InEventWait(event));
            t.wake(WaitResult::Acquired);
            self.trace.record(
                now.raw(),
                Trace::EventWake {
                    event: event.addr().offset(),
                    thread: tid,
                },
            );
            next = next.combine(NextThread::Specific(ThreadId::new(tid)));
        }
        Ok(next)
    }

    /// Clears the flag. Nobody is woken; waits after this block again.
    pub fn event_clear(&mut self, event: EventHandle) -> Result<(), KernError> {
        let now = self.clock.now();
        let raw = event_view(&mut self.pool, event)?;
        raw.state = CLEAR;
        self.trace.record(
            now.raw(),
            Trace::EventClear {
                event: event.addr().offset(),
            },
        );
        Ok(())
    }

    /// Reads the flag without waiting.
    pub fn event_is_set(&mut self, event: EventHandle) -> Result<bool, KernError> {
        let raw = event_view(&mut self.pool, event)?;
        Ok(raw.state != CLEAR)
    }

    /// Waits for the flag to be set on behalf of `caller`.
    ///
    /// A set flag completes the wait immediately and is *not* consumed.
    /// Otherwise the caller queues up exactly as for semaphores, including
    /// the `After(0)` poll form and the one-tick timeout padding.
    pub fn event_wait(
        &mut self,
        caller: ThreadId,
        event: EventHandle,
        timeout: Timeout,
    ) -> Result<NextThread, KernError> {
        let idx = self.caller_index(caller)?;
        uassert!(self.threads[idx].is_runnable());
        let now = self.clock.now();
        let raw = event_view(&mut self.pool, event)?;

        if raw.state != CLEAR {
            self.threads[idx].set_result(WaitResult::Acquired);
            self.trace.record(
                now.raw(),
                Trace::EventAcquire {
                    event: event.addr().offset(),
                    thread: caller.raw(),
                },
            );
            return Ok(NextThread::Same);
        }

        let deadline = match timeout {
            Timeout::Forever => None,
            Timeout::After(0) => {
                self.threads[idx].set_result(WaitResult::TimedOut);
                self.trace
                    .record(now.raw(), Trace::Timeout { thread: caller.raw() });
                return Ok(NextThread::Same);
            }
            Timeout::After(n) => Some(now.after(n.min(MAX_TIMEOUT_TICKS) + 1)),
        };

        raw.waiters.push_tail(&mut *self.threads, caller.raw());
        self.threads[idx].block(SchedState::InEventWait(event), deadline);
        self.trace.record(
            now.raw(),
            Trace::EventBlock {
                event: event.addr().offset(),
                thread: caller.raw(),
            },
        );
        Ok(NextThread::Other)
    }

    /// [`Kernel::event_wait`] with the timeout in milliseconds.
    pub fn event_wait_ms(
        &mut self,
        caller: ThreadId,
        event: EventHandle,
        ms: u32,
    ) -> Result<NextThread, KernError> {
        let t = time::ms_to_ticks(self.clock.hz(), ms);
        self.event_wait(caller, event, Timeout::After(t))
    }

    /// [`Kernel::event_wait`] with the timeout in microseconds.
    pub fn event_wait_us(
        &mut self,
        caller: ThreadId,
        event: EventHandle,
        us: u32,
    ) -> Result<NextThread, KernError> {
        let t = time::us_to_ticks(self.clock.hz(), us);
        self.event_wait(caller, event, Timeout::After(t))
    }
}
