// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end scenarios driving the kernel the way an embedding scheduler
//! would: blocking operations interleaved with ticks, with the scheduler's
//! side played by the test.

use abi::{KernError, ThreadFlags, ThreadId, Timeout, WaitResult};
use kern::kernel::{Kernel, KernelConfig};
use kern::mem::Entry;
use kern::thread::{NextThread, Thread};
use kern::time::Ticks;

const T0: ThreadId = ThreadId::new(0);
const T1: ThreadId = ThreadId::new(1);
const T2: ThreadId = ThreadId::new(2);
const T3: ThreadId = ThreadId::new(3);

fn boot_threads(n: usize) -> Vec<Thread> {
    (0..n)
        .map(|_| Thread::new(ThreadFlags::START_AT_BOOT))
        .collect()
}

/// Delivers `n` ticks, combining whatever wake hints come back.
fn run_ticks(k: &mut Kernel<'_>, n: u32) -> NextThread {
    let mut hint = NextThread::Same;
    for _ in 0..n {
        hint = hint.combine(k.tick());
    }
    hint
}

fn result_of(k: &Kernel<'_>, t: ThreadId) -> WaitResult {
    k.thread(t).unwrap().wait_result()
}

/// Two consumers block on an empty semaphore; a producer signals twice.
/// Each signal hands its permit to exactly one waiter, in arrival order,
/// and the count never becomes observable to a third party.
#[test]
fn producer_hands_permits_to_queued_consumers() {
    let mut th = boot_threads(3);
    let mut arena = [0u8; 512];
    let mut ents = [Entry::default(); 16];
    let mut k = Kernel::new(&mut th, &mut arena, &mut ents, KernelConfig::default());

    let s = k.sem_create(0).unwrap();
    assert_eq!(k.sem_wait(T0, s, Timeout::Forever), Ok(NextThread::Other));
    assert_eq!(k.sem_wait(T1, s, Timeout::Forever), Ok(NextThread::Other));

    assert_eq!(k.sem_signal(s), Ok(NextThread::Specific(T0)));
    assert_eq!(result_of(&k, T0), WaitResult::Acquired);
    assert!(!k.thread(T1).unwrap().is_runnable(), "only the head waiter wakes");

    assert_eq!(k.sem_signal(s), Ok(NextThread::Specific(T1)));
    assert_eq!(result_of(&k, T1), WaitResult::Acquired);

    // Both signals were handed off, so a poll finds nothing banked.
    assert_eq!(k.sem_wait(T2, s, Timeout::After(0)), Ok(NextThread::Same));
    assert_eq!(result_of(&k, T2), WaitResult::TimedOut);

    // The whole exchange left a visible trace.
    assert!(!k.trace().is_empty());
}

/// A waiter in the middle of the queue times out; later signals skip the
/// departed thread and keep FIFO order among the survivors.
#[test]
fn timed_out_waiter_leaves_the_queue_cleanly() {
    let mut th = boot_threads(3);
    let mut arena = [0u8; 512];
    let mut ents = [Entry::default(); 16];
    let mut k = Kernel::new(&mut th, &mut arena, &mut ents, KernelConfig::default());

    let s = k.sem_create(0).unwrap();
    assert_eq!(k.sem_wait(T0, s, Timeout::Forever), Ok(NextThread::Other));
    assert_eq!(k.sem_wait(T1, s, Timeout::After(30)), Ok(NextThread::Other));
    assert_eq!(k.sem_wait(T2, s, Timeout::Forever), Ok(NextThread::Other));

    // 30 ticks plus the phase pad: T1 gives up, T0 and T2 stay.
    assert_eq!(run_ticks(&mut k, 30), NextThread::Same);
    assert_eq!(k.tick(), NextThread::Specific(T1));
    assert_eq!(result_of(&k, T1), WaitResult::TimedOut);

    assert_eq!(k.sem_signal(s), Ok(NextThread::Specific(T0)));
    assert_eq!(k.sem_signal(s), Ok(NextThread::Specific(T2)));
    assert_eq!(result_of(&k, T0), WaitResult::Acquired);
    assert_eq!(result_of(&k, T2), WaitResult::Acquired);
}

/// A 50 ms timeout converts at the configured tick rate, waits at least
/// that long, and expiry removes the waiter from the queue for good.
#[test]
fn millisecond_timeout_expires_and_removes_the_waiter() {
    let mut th = boot_threads(2);
    let mut arena = [0u8; 512];
    let mut ents = [Entry::default(); 16];
    let mut k = Kernel::new(&mut th, &mut arena, &mut ents, KernelConfig::default());

    let s = k.sem_create(0).unwrap();
    // 50 ms at the default 1 kHz is 50 ticks (+1 pad).
    assert_eq!(k.sem_wait_ms(T0, s, 50), Ok(NextThread::Other));
    assert_eq!(run_ticks(&mut k, 50), NextThread::Same);
    assert_eq!(k.tick(), NextThread::Specific(T0));
    assert_eq!(result_of(&k, T0), WaitResult::TimedOut);

    // The waiter is gone from the queue: this signal banks its permit
    // instead of re-waking T0.
    assert_eq!(k.sem_signal(s), Ok(NextThread::Same));

    // Second round: the signal wins the race this time, and the disarmed
    // timer must not fire later and re-deliver.
    assert_eq!(k.sem_wait_ms(T1, s, 50), Ok(NextThread::Same));
    assert_eq!(result_of(&k, T1), WaitResult::Acquired);
    assert_eq!(k.sem_wait_ms(T1, s, 50), Ok(NextThread::Other));
    assert_eq!(run_ticks(&mut k, 10), NextThread::Same);
    assert_eq!(k.sem_signal(s), Ok(NextThread::Specific(T1)));
    assert_eq!(result_of(&k, T1), WaitResult::Acquired);
    assert_eq!(run_ticks(&mut k, 60), NextThread::Same);
}

/// Polling never jumps the queue: a poll while others wait reports
/// `TimedOut` and the queued thread still gets the next permit.
#[test]
fn poll_does_not_jump_the_queue() {
    let mut th = boot_threads(2);
    let mut arena = [0u8; 512];
    let mut ents = [Entry::default(); 16];
    let mut k = Kernel::new(&mut th, &mut arena, &mut ents, KernelConfig::default());

    let s = k.sem_create(0).unwrap();
    assert_eq!(k.sem_wait(T0, s, Timeout::Forever), Ok(NextThread::Other));

    assert_eq!(k.sem_wait(T1, s, Timeout::After(0)), Ok(NextThread::Same));
    assert_eq!(result_of(&k, T1), WaitResult::TimedOut);

    assert_eq!(k.sem_signal(s), Ok(NextThread::Specific(T0)));
}

/// Destroying a semaphore with a queued waiter is refused; once the waiter
/// departs by timeout, destruction succeeds and the handle goes dead.
#[test]
fn destroy_waits_for_the_queue_to_drain() {
    let mut th = boot_threads(1);
    let mut arena = [0u8; 512];
    let mut ents = [Entry::default(); 16];
    let mut k = Kernel::new(&mut th, &mut arena, &mut ents, KernelConfig::default());

    let s = k.sem_create(0).unwrap();
    assert_eq!(k.sem_wait(T0, s, Timeout::After(5)), Ok(NextThread::Other));
    assert_eq!(k.sem_destroy(s), Err(KernError::Busy));

    assert_eq!(run_ticks(&mut k, 5), NextThread::Same);
    assert_eq!(k.tick(), NextThread::Specific(T0));
    assert_eq!(result_of(&k, T0), WaitResult::TimedOut);

    assert_eq!(k.sem_destroy(s), Ok(()));
    assert_eq!(k.sem_signal(s), Err(KernError::BadHandle));
}

/// Sleep deadlines armed just before the 32-bit tick counter wraps fire on
/// time and in order on the far side of the wrap.
#[test]
fn sleeps_expire_in_order_across_wraparound() {
    let mut th = boot_threads(2);
    let mut arena = [0u8; 512];
    let mut ents = [Entry::default(); 16];
    let cfg = KernelConfig {
        start_tick: Ticks::new(u32::MAX - 2),
        ..KernelConfig::default()
    };
    let mut k = Kernel::new(&mut th, &mut arena, &mut ents, cfg);

    assert_eq!(k.sleep(T0, 2), Ok(NextThread::Other));
    assert_eq!(k.sleep(T1, 5), Ok(NextThread::Other));

    // T0's padded deadline lands exactly on the wrap (tick 0).
    assert_eq!(run_ticks(&mut k, 2), NextThread::Same);
    assert_eq!(k.tick(), NextThread::Specific(T0));
    assert_eq!(k.now().raw(), 0);
    assert!(!k.thread(T1).unwrap().is_runnable());

    assert_eq!(run_ticks(&mut k, 2), NextThread::Same);
    assert_eq!(k.tick(), NextThread::Specific(T1));
    assert_eq!(k.now().raw(), 3);
}

/// Event flags broadcast: set wakes every waiter and latches; pulse wakes
/// current waiters only and leaves the flag clear.
#[test]
fn event_set_broadcasts_and_pulse_does_not_latch() {
    let mut th = boot_threads(3);
    let mut arena = [0u8; 512];
    let mut ents = [Entry::default(); 16];
    let mut k = Kernel::new(&mut th, &mut arena, &mut ents, KernelConfig::default());

    let e = k.event_create(false).unwrap();
    assert_eq!(k.event_wait(T0, e, Timeout::Forever), Ok(NextThread::Other));
    assert_eq!(k.event_wait(T1, e, Timeout::Forever), Ok(NextThread::Other));
    assert_eq!(k.event_wait(T2, e, Timeout::After(10)), Ok(NextThread::Other));

    assert_eq!(k.event_set(e), Ok(NextThread::Other));
    for t in [T0, T1, T2] {
        assert!(k.thread(t).unwrap().is_runnable());
        assert_eq!(result_of(&k, t), WaitResult::Acquired);
    }
    // T2's timer was disarmed by the wake; its deadline must not fire.
    assert_eq!(run_ticks(&mut k, 15), NextThread::Same);

    // Latched: late arrivals complete in place.
    assert_eq!(k.event_wait(T0, e, Timeout::After(0)), Ok(NextThread::Same));
    assert_eq!(result_of(&k, T0), WaitResult::Acquired);

    k.event_clear(e).unwrap();
    assert_eq!(k.event_wait(T0, e, Timeout::Forever), Ok(NextThread::Other));
    assert_eq!(k.event_pulse(e), Ok(NextThread::Specific(T0)));
    assert!(!k.event_is_set(e).unwrap());

    // Nobody was waiting at pulse time, so this one blocks.
    assert_eq!(k.event_wait(T1, e, Timeout::After(0)), Ok(NextThread::Same));
    assert_eq!(result_of(&k, T1), WaitResult::TimedOut);
}

/// Every signal produces exactly one successful acquisition, whether it was
/// banked in the count or handed to a waiter, and timeouts produce none.
#[test]
fn permits_are_conserved() {
    let mut th = boot_threads(4);
    let mut arena = [0u8; 512];
    let mut ents = [Entry::default(); 16];
    let mut k = Kernel::new(&mut th, &mut arena, &mut ents, KernelConfig::default());

    let s = k.sem_create(0).unwrap();

    assert_eq!(k.sem_wait(T0, s, Timeout::Forever), Ok(NextThread::Other));
    assert_eq!(k.sem_signal(s), Ok(NextThread::Specific(T0))); // hand-off
    assert_eq!(k.sem_signal(s), Ok(NextThread::Same)); // banked

    // T1 consumes the banked permit without blocking.
    assert_eq!(k.sem_wait(T1, s, Timeout::Forever), Ok(NextThread::Same));

    assert_eq!(k.sem_wait(T2, s, Timeout::Forever), Ok(NextThread::Other));
    assert_eq!(k.sem_wait(T3, s, Timeout::After(2)), Ok(NextThread::Other));

    // T3 gives up; its departure must not create or destroy permits.
    assert_eq!(run_ticks(&mut k, 2), NextThread::Same);
    assert_eq!(k.tick(), NextThread::Specific(T3));

    assert_eq!(k.sem_signal(s), Ok(NextThread::Specific(T2)));

    // Three signals, three acquisitions, one timeout.
    for t in [T0, T1, T2] {
        assert_eq!(result_of(&k, t), WaitResult::Acquired);
    }
    assert_eq!(result_of(&k, T3), WaitResult::TimedOut);
}

/// A sleeper and a semaphore waiter with the same deadline expire on the
/// same tick; the hint degrades to `Other` and both see `TimedOut`.
#[test]
fn sleepers_and_waiters_share_the_tick() {
    let mut th = boot_threads(2);
    let mut arena = [0u8; 512];
    let mut ents = [Entry::default(); 16];
    let mut k = Kernel::new(&mut th, &mut arena, &mut ents, KernelConfig::default());

    let s = k.sem_create(0).unwrap();
    assert_eq!(k.sleep(T0, 3), Ok(NextThread::Other));
    assert_eq!(k.sem_wait(T1, s, Timeout::After(3)), Ok(NextThread::Other));

    assert_eq!(run_ticks(&mut k, 3), NextThread::Same);
    assert_eq!(k.tick(), NextThread::Other);
    assert_eq!(result_of(&k, T0), WaitResult::TimedOut);
    assert_eq!(result_of(&k, T1), WaitResult::TimedOut);

    // The queue really is empty now.
    assert_eq!(k.sem_destroy(s), Ok(()));
}

/// Kernel objects and raw allocations share the pool; destroying and
/// freeing everything coalesces it back to a single block.
#[test]
fn pool_returns_to_one_block_after_full_teardown() {
    let mut th = boot_threads(1);
    let mut arena = [0u8; 512];
    let mut ents = [Entry::default(); 16];
    let mut k = Kernel::new(&mut th, &mut arena, &mut ents, KernelConfig::default());

    let baseline = k.mem_stat();
    assert_eq!(baseline.free_blocks, 1);

    let s = k.sem_create(3).unwrap();
    let buf = k.alloc(64).unwrap();
    let e = k.event_create(true).unwrap();
    assert_eq!(k.mem_stat().used_blocks, 3);

    k.sem_destroy(s).unwrap();
    k.free(buf).unwrap();
    k.event_destroy(e).unwrap();

    let end = k.mem_stat();
    assert_eq!(end.used_blocks, 0);
    assert_eq!(end.free_blocks, 1);
    assert_eq!(end.free_bytes, baseline.free_bytes);
    assert_eq!(end.largest_free, baseline.largest_free);
}
