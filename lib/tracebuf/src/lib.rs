// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-capacity trace ring for instrumenting kernel-ish code.
//!
//! A `Tracebuf` records a bounded history of `Copy` payloads, each stamped
//! with a caller-supplied timestamp. When an entry is recorded with a
//! payload identical to the most recent one, its repeat count is bumped
//! instead of consuming a new slot, so a tight loop reporting the same event
//! doesn't wipe out the interesting history around it. Each slot carries a
//! generation counter that increments every time the slot is overwritten,
//! which lets a reader detect how often the ring has lapped.
//!
//! Unlike a `static` debugger-read ring, a `Tracebuf` is an owned value: it
//! lives inside whatever context produces the events and is read back
//! through [`Tracebuf::entries`]. That keeps the producing code free of
//! global state and lets tests assert on exactly what was recorded.
//!
//! The payload type must be `Copy + PartialEq` (for coalescing) and
//! `Default` (for the empty slots of a fresh ring).

#![cfg_attr(not(test), no_std)]

/// One slot of a [`Tracebuf`].
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Entry<T> {
    /// Timestamp supplied with the first recording of this payload run.
    pub at: u32,
    /// Number of times the slot's overwrite cycle has come around.
    pub generation: u16,
    /// How many consecutive times this payload was recorded. Zero means the
    /// slot has never been written.
    pub count: u32,
    /// The recorded payload.
    pub payload: T,
}

/// Bounded event history with coalescing of consecutive repeats.
#[derive(Debug)]
pub struct Tracebuf<T, const N: usize> {
    last: Option<usize>,
    buffer: [Entry<T>; N],
}

impl<T: Copy + PartialEq + Default, const N: usize> Tracebuf<T, N> {
    pub fn new() -> Self {
        Self {
            last: None,
            buffer: [Entry::default(); N],
        }
    }

    /// Records `payload` at time `at`.
    ///
    /// If `payload` equals the most recently recorded payload, its repeat
    /// count is incremented (saturating at the count width) and `at` is
    /// discarded; the entry keeps the timestamp of the first repeat.
    pub fn record(&mut self, at: u32, payload: T) {
        // Treat a never-written ring as having an out-of-range last index, so
        // the slot reuse check below falls through and the first entry lands
        // in slot 0.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.payload == payload {
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
                // Count pegged; fall through and start a fresh run.
            }
        }

        // wrapping_add turns the usize::MAX starting condition into slot 0
        // without a special case.
        let next = last.wrapping_add(1);
        let ndx = if next >= self.buffer.len() { 0 } else { next };

        let ent = &mut self.buffer[ndx];
        *ent = Entry {
            at,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };
        self.last = Some(ndx);
    }

    /// Returns the most recently written entry, if anything has been
    /// recorded.
    pub fn last(&self) -> Option<&Entry<T>> {
        self.buffer.get(self.last?)
    }

    /// Iterates recorded entries from oldest to newest.
    ///
    /// Slots that have never been written (count 0) are skipped, so on a
    /// ring that hasn't lapped yet this yields exactly the recorded history.
    pub fn entries(&self) -> impl Iterator<Item = &Entry<T>> {
        let start = match self.last {
            // Oldest entry is the one after the most recently written slot.
            Some(last) => last + 1,
            None => 0,
        };
        (0..self.buffer.len())
            .map(move |i| {
                let ndx = if start + i >= self.buffer.len() {
                    start + i - self.buffer.len()
                } else {
                    start + i
                };
                &self.buffer[ndx]
            })
            .filter(|ent| ent.count != 0)
    }

    /// Number of populated slots.
    pub fn len(&self) -> usize {
        self.entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_none()
    }
}

impl<T: Copy + PartialEq + Default, const N: usize> Default for Tracebuf<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorded<const N: usize>(tb: &Tracebuf<u32, N>) -> Vec<(u32, u32, u32)> {
        tb.entries().map(|e| (e.at, e.count, e.payload)).collect()
    }

    #[test]
    fn base_state() {
        let tb = Tracebuf::<u32, 4>::new();
        assert!(tb.is_empty());
        assert_eq!(tb.len(), 0);
        assert!(tb.last().is_none());
        assert_eq!(tb.entries().count(), 0);
    }

    #[test]
    fn records_in_order() {
        let mut tb = Tracebuf::<u32, 4>::new();
        tb.record(10, 100);
        tb.record(11, 200);
        tb.record(12, 300);

        assert_eq!(
            recorded(&tb),
            vec![(10, 1, 100), (11, 1, 200), (12, 1, 300)]
        );
        assert_eq!(tb.last().unwrap().payload, 300);
    }

    #[test]
    fn coalesces_repeats() {
        let mut tb = Tracebuf::<u32, 4>::new();
        tb.record(1, 7);
        tb.record(2, 7);
        tb.record(3, 7);
        tb.record(4, 8);
        tb.record(5, 7);

        // The repeats collapse into one entry that keeps the first
        // timestamp; the later 7 is a separate run.
        assert_eq!(recorded(&tb), vec![(1, 3, 7), (4, 1, 8), (5, 1, 7)]);
    }

    #[test]
    fn wraps_and_bumps_generation() {
        let mut tb = Tracebuf::<u32, 3>::new();
        for i in 0..7u32 {
            tb.record(i, 1000 + i);
        }

        // Capacity 3: only the newest three survive, oldest first.
        assert_eq!(recorded(&tb), vec![(4, 1, 1004), (5, 1, 1005), (6, 1, 1006)]);

        // Slot 0 has been written at entries 0, 3 and 6.
        let gens: Vec<u16> = tb.entries().map(|e| e.generation).collect();
        assert_eq!(gens, vec![2, 2, 3]);
    }

    #[test]
    fn repeats_do_not_consume_slots() {
        let mut tb = Tracebuf::<u32, 3>::new();
        tb.record(0, 1);
        for i in 0..1000 {
            tb.record(1 + i, 2);
        }
        tb.record(2000, 3);

        // A thousand repeats took one slot, so the surrounding history is
        // intact in a three-slot ring.
        assert_eq!(recorded(&tb), vec![(0, 1, 1), (1, 1000, 2), (2000, 1, 3)]);
    }
}
