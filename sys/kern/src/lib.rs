// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Plinth kernel primitives.
//!
//! This is the scheduler-independent portion of a small cooperative RTOS:
//! counting semaphores, manual-reset event flags, timed suspension, and the
//! pool allocator the kernel objects live in. It owns every reason a thread
//! can be *unable* to run; deciding who *does* run, switching contexts, and
//! driving the periodic tick belong to the embedding scheduler, which talks
//! to this crate through [`kernel::Kernel`] and the [`thread::NextThread`]
//! hints that come back from blocking operations.
//!
//! # Design principles
//!
//! A few ideas recur throughout the crate.
//!
//! 1. Explicit context. All kernel state lives in one [`kernel::Kernel`]
//!    value that is passed around, never reached through globals; the
//!    `startup` seam exists for embedders that need a static, but nothing
//!    in here uses it.
//! 2. Borrowed storage. The thread table, pool arena, and block registry
//!    are supplied by the embedder at boot and merely borrowed; the kernel
//!    allocates nothing of its own.
//! 3. Safe code wherever practical. The lists are index-based instead of
//!    pointer-based mostly for this reason.
//! 4. Validation over trust. Handles revalidate against the pool registry
//!    and a magic word on every use; the pool refuses frees it didn't hand
//!    out; invariant violations panic rather than limp.
//!
//! Time is a wrapping 32-bit tick counter, so deadline comparisons go
//! through [`time::Ticks::reached_by`] and nothing in this crate compares
//! raw tick values with `<`.

#![cfg_attr(not(test), no_std)]

/// Kernel invariant check. These stay on in release builds: continuing past
/// a broken kernel invariant trades a clean panic for memory corruption.
macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}
pub(crate) use uassert;

pub mod event;
pub mod kernel;
pub mod mem;
pub mod sem;
pub mod startup;
pub mod thread;
pub mod time;
pub mod trace;
