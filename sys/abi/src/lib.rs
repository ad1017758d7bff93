// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common types shared between the plinth kernel crate and the scheduler
//! that embeds it.
//!
//! This crate is the vocabulary of that boundary: thread ids, kernel object
//! handles, timeout and completion values, and the error taxonomy. It
//! deliberately contains no behavior beyond accessors, so an embedder can
//! depend on it without pulling in the kernel itself.

#![no_std]

use bitflags::bitflags;

/// Index of a thread's control block in the embedder-supplied thread table.
///
/// Thread ids are dense small integers, not capabilities: the embedder owns
/// the table and already knows which ids are live. The kernel checks ids
/// against the table bounds and rejects out-of-range ones with
/// [`KernError::BadThread`], but it cannot tell one live thread from
/// another; that is the scheduler's job.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::KnownLayout,
    zerocopy_derive::Immutable,
)]
#[repr(transparent)]
pub struct ThreadId(u16);

impl ThreadId {
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    /// Extracts the thread-table index.
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn raw(self) -> u16 {
        self.0
    }
}

impl From<u16> for ThreadId {
    fn from(x: u16) -> Self {
        Self(x)
    }
}

/// Offset of an allocated block's payload within the kernel pool arena.
///
/// This is what the pool allocator hands out and takes back; kernel object
/// handles wrap one. An offset is only meaningful to the pool that produced
/// it, and the pool checks every incoming address against its block
/// registry, so a stale or fabricated value is refused
/// ([`KernError::InvalidPointer`]) rather than obeyed.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::KnownLayout,
    zerocopy_derive::Immutable,
)]
#[repr(transparent)]
pub struct BlockAddr(u32);

impl BlockAddr {
    pub const fn new(offset: u32) -> Self {
        Self(offset)
    }

    pub const fn offset(self) -> u32 {
        self.0
    }
}

/// Opaque reference to a semaphore living in the kernel pool.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::KnownLayout,
    zerocopy_derive::Immutable,
)]
#[repr(transparent)]
pub struct SemHandle(BlockAddr);

impl SemHandle {
    pub const fn from_addr(addr: BlockAddr) -> Self {
        Self(addr)
    }

    pub const fn addr(self) -> BlockAddr {
        self.0
    }
}

/// Opaque reference to an event flag living in the kernel pool.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::KnownLayout,
    zerocopy_derive::Immutable,
)]
#[repr(transparent)]
pub struct EventHandle(BlockAddr);

impl EventHandle {
    pub const fn from_addr(addr: BlockAddr) -> Self {
        Self(addr)
    }

    pub const fn addr(self) -> BlockAddr {
        self.0
    }
}

/// Bound on a blocking operation, in kernel ticks.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Timeout {
    /// Block until woken, however long that takes.
    Forever,
    /// Give up after this many ticks. `After(0)` is a poll: the operation
    /// never blocks, and completes as `TimedOut` if it would have.
    After(u32),
}

/// How a suspension ended. This is a completion value, not an error:
/// running out the clock on a bounded wait is an expected outcome.
///
/// For a plain sleep, `TimedOut` is the normal result; the deadline
/// arriving is the point of the exercise.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitResult {
    /// The resource was handed to this thread.
    Acquired,
    /// The deadline passed first.
    TimedOut,
}

bitflags! {
    /// Flags used when setting up a thread control block.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct ThreadFlags: u32 {
        /// Thread comes up runnable instead of stopped.
        const START_AT_BOOT = 1 << 0;
    }
}

/// Errors returned by kernel primitive operations.
///
/// Timeouts are deliberately absent: a timeout is reported through
/// [`WaitResult`], not here.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KernError {
    /// The pool cannot satisfy the allocation. Recoverable; no state was
    /// changed.
    OutOfMemory,
    /// Requested alignment is not a power of two.
    InvalidAlignment,
    /// The address does not name a live allocation: never allocated, already
    /// freed, or not the payload start the pool handed out.
    InvalidPointer,
    /// The handle does not refer to a live object of the expected kind.
    BadHandle,
    /// The object still has blocked threads and cannot be destroyed.
    Busy,
    /// The thread id is outside the thread table.
    BadThread,
}
