// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Optional kernel installation seam.
//!
//! Nothing in this crate needs global state: a [`Kernel`] is an ordinary
//! value and most embedders should just own one. But an embedder whose tick
//! source is an interrupt handler needs *some* way to reach the kernel from
//! a context that can't be handed a `&mut`, and this module is that way:
//! [`install`] parks a `Kernel<'static>` in a private static exactly once,
//! and [`with_kernel`] lends it out with runtime uniqueness enforcement.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::kernel::Kernel;

/// True whenever a `&mut` to the installed kernel is outstanding, so no
/// second one can be produced. Effectively a one-bit lock around the
/// kernel.
///
/// It starts out `true`, which makes `with_kernel` unusable until
/// [`install`] flips it to `false` as its last act.
static KERNEL_IN_USE: AtomicBool = AtomicBool::new(true);

/// One-shot latch for [`install`].
static KERNEL_INSTALLED: AtomicBool = AtomicBool::new(false);

struct KernelCell(UnsafeCell<MaybeUninit<Kernel<'static>>>);

// Safety: access to the cell's contents is serialized by KERNEL_IN_USE;
// a reference is only ever produced between a successful swap to true and
// the matching store of false.
unsafe impl Sync for KernelCell {}

static KERNEL_SPACE: KernelCell = KernelCell(UnsafeCell::new(MaybeUninit::uninit()));

/// Installs `kernel` as the process-wide kernel instance.
///
/// May be called at most once; a second call panics. After this returns,
/// [`with_kernel`] is usable from anywhere the embedder has serialized
/// against itself (for interrupt-driven embedders, that means masking the
/// tick source around non-interrupt uses).
pub fn install(kernel: Kernel<'static>) {
    if KERNEL_INSTALLED.swap(true, Ordering::Acquire) {
        panic!(); // second kernel install
    }
    // Safety: winning the one-shot swap above makes this the only writer the
    // cell will ever have, and KERNEL_IN_USE is still true, so no reader can
    // hold a reference into it yet.
    unsafe {
        (*KERNEL_SPACE.0.get()).write(kernel);
    }
    KERNEL_IN_USE.store(false, Ordering::Release);
}

/// Runs `body` with exclusive access to the installed kernel.
///
/// Only one such borrow may exist at a time, so a call from inside `body`
/// panics instead of aliasing the outer `&mut`; so does a call before
/// [`install`] has provided anything to borrow.
pub fn with_kernel<R>(body: impl FnOnce(&mut Kernel<'static>) -> R) -> R {
    if KERNEL_IN_USE.swap(true, Ordering::Acquire) {
        panic!(); // recursive or pre-install use of with_kernel
    }
    // Safety: the swap found the flag false. Only install's final store
    // clears the flag, so the cell is initialized; and the swap set it back
    // to true, so no other reference is live and none can be produced until
    // the store below.
    let kernel = unsafe { (*KERNEL_SPACE.0.get()).assume_init_mut() };

    let r = body(kernel);

    KERNEL_IN_USE.store(false, Ordering::Release);

    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelConfig;
    use crate::mem::Entry;
    use crate::thread::{NextThread, Thread};
    use abi::{ThreadFlags, Timeout, WaitResult};
    use std::panic::catch_unwind;

    fn leaked_kernel() -> Kernel<'static> {
        let threads = vec![
            Thread::new(ThreadFlags::START_AT_BOOT),
            Thread::new(ThreadFlags::START_AT_BOOT),
        ]
        .leak();
        let arena = vec![0u8; 256].leak();
        let entries = vec![Entry::default(); 8].leak();
        Kernel::new(threads, arena, entries, KernelConfig::default())
    }

    // One test covers the whole lifecycle: the statics are process-wide, so
    // splitting this up would make the pieces order-dependent.
    #[test]
    fn install_once_and_share() {
        install(leaked_kernel());

        // The installed kernel is fully operational through the seam.
        let s = with_kernel(|k| k.sem_create(1)).unwrap();
        let hint =
            with_kernel(|k| k.sem_wait(abi::ThreadId::new(0), s, Timeout::Forever)).unwrap();
        assert_eq!(hint, NextThread::Same);
        with_kernel(|k| {
            assert_eq!(
                k.thread(abi::ThreadId::new(0)).unwrap().wait_result(),
                WaitResult::Acquired
            );

            // Re-entry is refused without disturbing the outer borrow.
            assert!(catch_unwind(|| with_kernel(|_| ())).is_err());
        });

        // Still usable after the refused re-entry.
        with_kernel(|k| k.sem_destroy(s)).unwrap();

        // A second install is refused.
        assert!(catch_unwind(|| install(leaked_kernel())).is_err());
    }
}
