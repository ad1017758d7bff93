// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thread control blocks.
//!
//! The kernel does not create threads; the embedding scheduler supplies a
//! pre-sized table of `Thread` records and refers to them by index
//! ([`abi::ThreadId`]). What lives here is exactly the state the primitives
//! need: the scheduling state, the one-shot timeout timer, the wait-queue
//! link, and the slot where a wait's outcome is left for the thread to pick
//! up when it next runs.

use crate::time::Ticks;
use abi::{EventHandle, SemHandle, ThreadFlags, ThreadId, WaitResult};
use ilist::{Link, Node};

/// A thread's control block, from the primitives' point of view.
///
/// Everything else a real thread carries (stack, context, priority, name) is
/// the embedder's business and lives on their side of the fence.
#[derive(Debug, Default)]
pub struct Thread {
    /// Current scheduling state.
    state: SchedState,
    /// One-shot timeout timer.
    timer: TimerState,
    /// Wait-queue membership. A thread is on at most one queue at a time,
    /// which is what lets the link live in the control block.
    link: Link,
    /// Outcome of the most recent wait or sleep.
    save: SavedState,
}

impl Thread {
    pub fn new(flags: ThreadFlags) -> Self {
        let state = if flags.contains(ThreadFlags::START_AT_BOOT) {
            SchedState::Runnable
        } else {
            SchedState::Stopped
        };
        Self {
            state,
            timer: TimerState::default(),
            link: Link::new(),
            save: SavedState::default(),
        }
    }

    pub fn state(&self) -> SchedState {
        self.state
    }

    /// Checks whether the scheduler may run this thread.
    pub fn is_runnable(&self) -> bool {
        self.state == SchedState::Runnable
    }

    /// Outcome of this thread's most recent wait or sleep. Meaningful only
    /// after the thread has been woken from one.
    pub fn wait_result(&self) -> WaitResult {
        self.save.wait
    }

    pub(crate) fn deadline(&self) -> Option<Ticks> {
        self.timer.deadline
    }

    /// Records the wait outcome without touching the rest of the state;
    /// used for operations that complete without blocking.
    pub(crate) fn set_result(&mut self, r: WaitResult) {
        self.save.wait = r;
    }

    /// Suspends this thread: records the blocked state and arms the timeout
    /// timer (`None` waits forever).
    pub(crate) fn block(&mut self, state: SchedState, deadline: Option<Ticks>) {
        debug_assert!(matches!(
            state,
            SchedState::InSemWait(_) | SchedState::InEventWait(_) | SchedState::InSleep
        ));
        self.state = state;
        self.timer.deadline = deadline;
    }

    /// Wakes this thread: disarms the timer, deposits the wait outcome, and
    /// makes it runnable again.
    pub(crate) fn wake(&mut self, r: WaitResult) {
        self.timer.deadline = None;
        self.save.wait = r;
        self.state = SchedState::Runnable;
    }
}

impl Node for Thread {
    fn link(&self) -> &Link {
        &self.link
    }
    fn link_mut(&mut self) -> &mut Link {
        &mut self.link
    }
}

/// Scheduling states a thread can occupy, as far as the primitives care.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SchedState {
    /// Not eligible to run and not waiting on anything. The kernel never
    /// moves a thread out of this state on its own.
    Stopped,
    /// Eligible to run whenever the scheduler feels like it.
    Runnable,
    /// Blocked acquiring the named semaphore.
    InSemWait(SemHandle),
    /// Blocked on the named event flag.
    InEventWait(EventHandle),
    /// Blocked in a timed sleep.
    InSleep,
}

impl Default for SchedState {
    fn default() -> Self {
        SchedState::Stopped
    }
}

/// State for a thread's one-shot timeout timer.
#[derive(Debug, Default)]
struct TimerState {
    /// Deadline, in kernel time, at which the timer fires. `None` means
    /// disarmed.
    deadline: Option<Ticks>,
}

/// Where a wait's outcome is parked until the thread runs again.
///
/// A blocked thread cannot receive a return value, so whoever ends the wait
/// (a signal, or the timer sweep) deposits the result here; the embedder
/// reads it back when it resumes the thread.
#[derive(Debug)]
struct SavedState {
    wait: WaitResult,
}

impl Default for SavedState {
    fn default() -> Self {
        Self {
            wait: WaitResult::Acquired,
        }
    }
}

/// Return value for operations that can have scheduling implications. This
/// is marked `must_use` because dropping it silently would mean forgetting
/// to tell the scheduler something it needed to hear.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextThread {
    /// Fine to keep running the current thread.
    Same,
    /// Someone should be switched to, but this routine doesn't know who; the
    /// scheduler gets to pick.
    Other,
    /// A particular thread became runnable and is the obvious candidate.
    Specific(ThreadId),
}

impl NextThread {
    pub fn combine(self, other: Self) -> Self {
        use NextThread::*;

        match (self, other) {
            (x, y) if x == y => x,
            // Ambiguity is sticky: once the candidate is unclear, a later
            // single wake must not restore a name, or folding a multi-wake
            // drain would report whichever thread happened to wake last.
            (Other, _) | (_, Other) => Other,
            // Two distinct named candidates: no single answer exists, let
            // the scheduler choose.
            (Specific(_), Specific(_)) => Other,
            // One named candidate beats no opinion.
            (Specific(x), Same) | (Same, Specific(x)) => Specific(x),
            (Same, Same) => Same,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_state_follows_flags() {
        assert_eq!(
            Thread::new(ThreadFlags::empty()).state(),
            SchedState::Stopped
        );
        assert_eq!(
            Thread::new(ThreadFlags::START_AT_BOOT).state(),
            SchedState::Runnable
        );
    }

    #[test]
    fn block_and_wake_round_trip() {
        let mut t = Thread::new(ThreadFlags::START_AT_BOOT);
        let h = SemHandle::from_addr(abi::BlockAddr::new(64));

        t.block(SchedState::InSemWait(h), Some(Ticks::new(100)));
        assert_eq!(t.state(), SchedState::InSemWait(h));
        assert_eq!(t.deadline(), Some(Ticks::new(100)));
        assert!(!t.is_runnable());

        t.wake(WaitResult::Acquired);
        assert!(t.is_runnable());
        assert_eq!(t.deadline(), None);
        assert_eq!(t.wait_result(), WaitResult::Acquired);
    }

    #[test]
    fn combine_prefers_the_stronger_hint() {
        use NextThread::*;
        let a = ThreadId::new(1);
        let b = ThreadId::new(2);

        assert_eq!(Same.combine(Same), Same);
        assert_eq!(Same.combine(Other), Other);
        assert_eq!(Specific(a).combine(Same), Specific(a));
        assert_eq!(Specific(a).combine(Specific(a)), Specific(a));
        // Two different specific suggestions cancel down to Other.
        assert_eq!(Specific(a).combine(Specific(b)), Other);
        // And Other never sharpens back into a name, in either position.
        assert_eq!(Other.combine(Specific(a)), Other);
        assert_eq!(Specific(a).combine(Other), Other);
    }

    #[test]
    fn folding_many_wakes_stays_ambiguous() {
        use NextThread::*;
        // Folding a drain of three named wakes, the way event_set and the
        // timer sweep do, must end at Other, not at the last-woken thread.
        let folded = [0u16, 1, 2]
            .into_iter()
            .fold(Same, |h, i| h.combine(Specific(ThreadId::new(i))));
        assert_eq!(folded, Other);
    }
}
