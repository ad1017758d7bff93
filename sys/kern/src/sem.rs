// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counting semaphores.
//!
//! A semaphore lives in the kernel pool as a [`RawSemaphore`]: a magic word,
//! a permit count, and a FIFO queue of waiting threads. The handle the
//! embedder holds is just the block's pool offset; every operation
//! revalidates it through the pool registry and the magic word, so handles
//! to destroyed semaphores fail with `BadHandle` instead of poking reused
//! memory.
//!
//! Signal is a *hand-off*: if anyone is waiting, the permit moves directly
//! to the head waiter and the count never ticks up. The count is only ever
//! nonzero while nobody waits, and the queue is only ever nonempty while
//! the count is zero. That rules out the classic race where a signal bumps
//! the count and a late-arriving thread steals the permit ahead of threads
//! that have been queued for ticks.
//!
//! Blocking is cooperative. `sem_wait` does not spin or yield internally;
//! it records the thread as blocked, queues it, and tells the embedding
//! scheduler to run someone else. The thread learns how its wait ended from
//! [`crate::thread::Thread::wait_result`] when it next runs.

use core::mem;

use crate::kernel::{waiter_tag, Kernel};
use crate::mem::Pool;
use crate::thread::{NextThread, SchedState};
use crate::time::{self, MAX_TIMEOUT_TICKS};
use crate::trace::Trace;
use crate::uassert;
use abi::{KernError, SemHandle, ThreadId, Timeout, WaitResult};
use ilist::List;
use zerocopy::FromBytes;

/// First word of every live semaphore block. Cleared on destroy so stale
/// handles stop validating even before the block is reused.
const SEM_MAGIC: u32 = 0x5f3c_9a17;

pub(crate) const SEM_SIZE: u32 = mem::size_of::<RawSemaphore>() as u32;
pub(crate) const SEM_ALIGN: u32 = mem::align_of::<RawSemaphore>() as u32;

/// Pool-resident semaphore state.
///
/// This is a plain-old-data view over the block's bytes, which is why it
/// derives the `zerocopy` traits and carries an explicit `reserved` tail
/// instead of implicit padding.
#[derive(
    Debug,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::KnownLayout,
    zerocopy_derive::Immutable,
)]
#[repr(C)]
pub(crate) struct RawSemaphore {
    magic: u32,
    count: u32,
    pub(crate) waiters: List,
    reserved: u16,
}

/// Revalidates `sem` and projects the pool block as a [`RawSemaphore`].
///
/// Any failure along the way (freed block, wrong offset, dead magic) comes
/// back as `BadHandle`.
pub(crate) fn sem_view<'p>(
    pool: &'p mut Pool<'_>,
    sem: SemHandle,
) -> Result<&'p mut RawSemaphore, KernError> {
    let bytes = pool
        .block_bytes_mut(sem.addr())
        .map_err(|_| KernError::BadHandle)?;
    let raw =
        RawSemaphore::mut_from_bytes(bytes).map_err(|_| KernError::BadHandle)?;
    if raw.magic != SEM_MAGIC {
        return Err(KernError::BadHandle);
    }
    Ok(raw)
}

impl Kernel<'_> {
    /// Creates a semaphore with `initial` permits, allocating its state from
    /// the kernel pool.
    pub fn sem_create(&mut self, initial: u32) -> Result<SemHandle, KernError> {
        let now = self.clock.now();
        let addr = match self.pool.alloc_aligned(SEM_SIZE, SEM_ALIGN) {
            Ok(addr) => addr,
            Err(e) => {
                self.trace.record(now.raw(), Trace::AllocFail { size: SEM_SIZE });
                return Err(e);
            }
        };
        let bytes = self.pool.block_bytes_mut(addr)?;
        let raw =
            RawSemaphore::mut_from_bytes(bytes).map_err(|_| KernError::BadHandle)?;
        *raw = RawSemaphore {
            magic: SEM_MAGIC,
            count: initial,
            waiters: List::new(waiter_tag(addr)),
            reserved: 0,
        };
        self.trace
            .record(now.raw(), Trace::SemCreate { sem: addr.offset() });
        Ok(SemHandle::from_addr(addr))
    }

    /// Destroys a semaphore and returns its block to the pool.
    ///
    /// Refused with `Busy` while anyone is queued on it: waking those
    /// threads with a forged result would hide a live protocol bug, so the
    /// embedder has to drain them first.
    pub fn sem_destroy(&mut self, sem: SemHandle) -> Result<(), KernError> {
        let now = self.clock.now();
        let raw = sem_view(&mut self.pool, sem)?;
        if !raw.waiters.is_empty() {
            return Err(KernError::Busy);
        }
        raw.magic = 0;
        let r = self.pool.free(sem.addr());
        uassert!(r.is_ok());
        self.trace
            .record(now.raw(), Trace::SemDestroy { sem: sem.addr().offset() });
        Ok(())
    }

    /// Releases one permit.
    ///
    /// If a thread is waiting, the permit is handed straight to the queue
    /// head, which becomes runnable; the returned hint names it. Otherwise
    /// the count goes up and nobody's schedule changes.
    pub fn sem_signal(&mut self, sem: SemHandle) -> Result<NextThread, KernError> {
        let now = self.clock.now();
        let raw = sem_view(&mut self.pool, sem)?;
        match raw.waiters.pop_head(&mut *self.threads) {
            Some(tid) => {
                // Queued waiters and a nonzero count cannot coexist.
                uassert!(raw.count == 0);
                let t = &mut self.threads[usize::from(tid)];
                uassert!(t.state() == SchedState::InSemWait(sem));
                t.wake(WaitResult::Acquired);
                self.trace.record(
                    now.raw(),
                    Trace::SemSignalWake {
                        sem: sem.addr().offset(),
                        thread: tid,
                    },
                );
                Ok(NextThread::Specific(ThreadId::new(tid)))
            }
            None => {
                debug_assert!(raw.count < u32::MAX);
                raw.count = raw.count.saturating_add(1);
                self.trace.record(
                    now.raw(),
                    Trace::SemSignalCount {
                        sem: sem.addr().offset(),
                    },
                );
                Ok(NextThread::Same)
            }
        }
    }

    /// Acquires one permit on behalf of `caller`, blocking it if none is
    /// available.
    ///
    /// With a permit in hand this returns `Same` and the caller keeps
    /// running; its [`wait_result`](crate::thread::Thread::wait_result) says
    /// `Acquired`. Otherwise the caller is queued FIFO and the scheduler is
    /// told to run someone else. `Timeout::After(0)` is a poll: on an empty
    /// semaphore the wait result is `TimedOut` immediately and the caller
    /// never blocks. Nonzero timeouts are in ticks and padded by one so the
    /// wait lasts *at least* that long regardless of tick phase.
    pub fn sem_wait(
        &mut self,
        caller: ThreadId,
        sem: SemHandle,
        timeout: Timeout,
    ) -> Result<NextThread, KernError> {
        let idx = self.caller_index(caller)?;
        uassert!(self.threads[idx].is_runnable());
        let now = self.clock.now();
        let raw = sem_view(&mut self.pool, sem)?;

        if raw.count > 0 {
            raw.count -= 1;
            self.threads[idx].set_result(WaitResult::Acquired);
            self.trace.record(
                now.raw(),
                Trace::SemAcquire {
                    sem: sem.addr().offset(),
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
        self.threads[idx].block(SchedState::InSemWait(sem), deadline);
        self.trace.record(
            now.raw(),
            Trace::SemBlock {
                sem: sem.addr().offset(),
                thread: caller.raw(),
            },
        );
        Ok(NextThread::Other)
    }

    /// [`Kernel::sem_wait`] with the timeout in milliseconds, converted at
    /// the configured tick rate (rounding up, so short nonzero timeouts
    /// still wait).
    pub fn sem_wait_ms(
        &mut self,
        caller: ThreadId,
        sem: SemHandle,
        ms: u32,
    ) -> Result<NextThread, KernError> {
        let t = time::ms_to_ticks(self.clock.hz(), ms);
        self.sem_wait(caller, sem, Timeout::After(t))
    }

    /// [`Kernel::sem_wait`] with the timeout in microseconds.
    pub fn sem_wait_us(
        &mut self,
        caller: ThreadId,
        sem: SemHandle,
        us: u32,
    ) -> Result<NextThread, KernError> {
        let t = time::us_to_ticks(self.clock.hz(), us);
        self.sem_wait(caller, sem, Timeout::After(t))
    }
}
