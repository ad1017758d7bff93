// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel pool: a first-fit, alignment-aware block allocator over a
//! borrowed byte arena.
//!
//! Blocks are described out-of-band in a caller-supplied table of [`Entry`]
//! records, never by headers embedded in the arena itself. This buys three
//! things at once: the arena holds only payload (and optional guard words),
//! every `free` is validated against the table (stale, doubled, and
//! fabricated addresses are refused instead of corrupting the heap), and the
//! table is the allocation registry a debugger wants to look at anyway.
//!
//! Free blocks are chained through their entries' links in address order,
//! using the same intrusive list the wait queues use. Address order makes
//! coalescing a local operation: after inserting a freed block, its chain
//! neighbors are the only merge candidates, and offset arithmetic says
//! whether they actually touch.
//!
//! Allocation walks the free chain first-fit and splits the chosen block
//! when the leftover is worth keeping and a spare table slot exists. When no
//! slot is spare the block simply stays whole; the slack returns at free
//! time. Both paths are bounded by the table size, so alloc and free run in
//! bounded time.
//!
//! Addresses handed out are arena offsets wrapped in [`BlockAddr`]. The
//! arena base is trimmed to word alignment at construction, so offset
//! alignment and machine-address alignment agree for anything the kernel
//! stores in the pool.

use crate::uassert;
use abi::{BlockAddr, KernError};
use bitflags::bitflags;
use byteorder::{ByteOrder, NativeEndian};
use ilist::{Link, List, Node};

/// Word size; block layout is done in multiples of this.
const WORD: u32 = 4;

/// Leftovers smaller than this aren't worth a table slot.
const MIN_FRAGMENT: u32 = 16;

/// Guard word written immediately before a block's payload when
/// [`PoolFlags::RANGE_CHECK`] is on.
const GUARD_HEAD: u32 = 0xa55a_c3d2;

/// Guard word written immediately after a block's payload when
/// [`PoolFlags::RANGE_CHECK`] is on.
const GUARD_TAIL: u32 = 0x3cc3_7e81;

/// Fill byte for [`PoolFlags::POISON`].
const POISON_BYTE: u8 = 0xc5;

/// Membership tag of the free chain.
const FREE_TAG: u16 = 1;

bitflags! {
    /// Debugging aids that cost arena bytes or fill time, off by default.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct PoolFlags: u32 {
        /// Bracket each live block's payload with guard words and verify
        /// them on free. An overrun of the payload trips a kernel assert
        /// instead of silently chewing up the neighbor.
        const RANGE_CHECK = 1 << 0;
        /// Fill payloads with a known byte on alloc and again on free, so
        /// reads of never-written or stale memory are recognizable.
        const POISON = 1 << 1;
    }
}

/// Lifecycle of one entry slot.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
enum BlockState {
    /// Slot describes no block.
    #[default]
    Unused,
    /// Block is on the free chain.
    Free,
    /// Block is allocated out.
    Used,
}

/// One slot of the block registry.
///
/// The embedder supplies a slice of these (all default) alongside the arena;
/// the table size bounds how many blocks can exist at once.
#[derive(Copy, Clone, Debug, Default)]
pub struct Entry {
    /// Free-chain membership.
    link: Link,
    /// Block start offset.
    base: u32,
    /// Payload offset handed to the caller. Equal to `base` while free.
    data: u32,
    /// Payload length in bytes (word-rounded). Zero while free.
    len: u32,
    /// Total bytes of arena owned by this block, `[base, base + span)`.
    span: u32,
    state: BlockState,
}

impl Node for Entry {
    fn link(&self) -> &Link {
        &self.link
    }
    fn link_mut(&mut self) -> &mut Link {
        &mut self.link
    }
}

/// Point-in-time pool accounting, in whole-block terms.
///
/// Byte figures count block spans, so per-block overhead (guards, alignment
/// padding, split slack) shows up as used bytes, which is the honest number
/// when asking "how close to full is the pool".
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PoolStat {
    pub free_blocks: u32,
    pub used_blocks: u32,
    pub free_bytes: u32,
    pub used_bytes: u32,
    pub largest_free: u32,
}

/// The allocator.
pub struct Pool<'s> {
    arena: &'s mut [u8],
    entries: &'s mut [Entry],
    free: List,
    flags: PoolFlags,
}

impl<'s> Pool<'s> {
    /// Builds a pool over `arena` with block bookkeeping in `entries`.
    ///
    /// The arena front is trimmed to word alignment and the tail to a word
    /// multiple. Asserts (rather than returning an error) on a hopeless
    /// configuration, such as an arena too small to allocate from or an
    /// empty or oversized entry table; those are boot-time mistakes, not
    /// runtime conditions.
    pub fn new(arena: &'s mut [u8], entries: &'s mut [Entry], flags: PoolFlags) -> Self {
        // Trim to word alignment so offset alignment implies address
        // alignment.
        let misalign = (arena.as_ptr() as usize) % WORD as usize;
        let lead = if misalign == 0 {
            0
        } else {
            WORD as usize - misalign
        };
        uassert!(arena.len() >= lead);
        let (_, arena) = arena.split_at_mut(lead);
        let usable = arena.len() - arena.len() % WORD as usize;
        let (arena, _) = arena.split_at_mut(usable);

        uassert!(arena.len() >= MIN_FRAGMENT as usize);
        uassert!(arena.len() <= u32::MAX as usize);
        uassert!(!entries.is_empty());
        uassert!(entries.len() < usize::from(u16::MAX));

        if flags.contains(PoolFlags::POISON) {
            arena.fill(POISON_BYTE);
        }

        for e in entries.iter_mut() {
            *e = Entry::default();
        }
        entries[0] = Entry {
            link: Link::new(),
            base: 0,
            data: 0,
            len: 0,
            span: arena.len() as u32,
            state: BlockState::Free,
        };
        let mut free = List::new(FREE_TAG);
        free.add_head(entries, 0);

        Self {
            arena,
            entries,
            free,
            flags,
        }
    }

    /// Allocates `size` bytes at default (word) alignment.
    pub fn alloc(&mut self, size: u32) -> Result<BlockAddr, KernError> {
        self.alloc_aligned(size, WORD)
    }

    /// Allocates `size` bytes whose address is a multiple of `align`.
    ///
    /// `align` must be a power of two; 1 means "don't care" (the result is
    /// still word-aligned, because block layout is). A zero `size` is
    /// rounded up to one word, so even an empty allocation has a distinct
    /// address to free.
    pub fn alloc_aligned(&mut self, size: u32, align: u32) -> Result<BlockAddr, KernError> {
        if align == 0 || !align.is_power_of_two() {
            return Err(KernError::InvalidAlignment);
        }
        // Word-rounding a size this close to the u32 limit would wrap to
        // zero and "succeed"; no arena can hold it anyway.
        if size > u32::MAX - (WORD - 1) {
            return Err(KernError::OutOfMemory);
        }
        let len = round_word(size.max(1));
        let guard = self.guard_len();

        // First fit: walk the free chain, tracking the predecessor so the
        // winner can be detached with remove_head/remove_after.
        let mut prev: Option<u16> = None;
        let mut found: Option<(u16, u32)> = None;
        let mut cur = self.free.head();
        while let Some(c) = cur {
            let e = &self.entries[usize::from(c)];
            let data = align_up(
                u64::from(e.base) + u64::from(guard),
                u64::from(align.max(1)),
            );
            let end = data + u64::from(len) + u64::from(guard);
            if end <= u64::from(e.base) + u64::from(e.span) {
                found = Some((c, data as u32));
                break;
            }
            prev = Some(c);
            cur = self.free.next_of(&self.entries, c);
        }
        let Some((id, data)) = found else {
            return Err(KernError::OutOfMemory);
        };

        let r = match prev {
            None => self.free.remove_head(&mut self.entries),
            Some(p) => self.free.remove_after(&mut self.entries, p),
        };
        uassert!(r == Ok(id));

        // Split off the tail when it's worth a slot and a slot exists;
        // otherwise the block keeps its slack.
        let used_end = data + len + guard;
        let block_end;
        {
            let e = &self.entries[usize::from(id)];
            block_end = e.base + e.span;
        }
        debug_assert_eq!(used_end % WORD, 0);
        if block_end - used_end >= MIN_FRAGMENT {
            if let Some(slot) = self.unused_slot() {
                self.entries[usize::from(slot)] = Entry {
                    link: Link::new(),
                    base: used_end,
                    data: used_end,
                    len: 0,
                    span: block_end - used_end,
                    state: BlockState::Free,
                };
                self.entries[usize::from(id)].span = used_end - self.entries[usize::from(id)].base;
                self.free_insert(slot);
            }
        }

        if self.flags.contains(PoolFlags::RANGE_CHECK) {
            self.write_word(data - WORD, GUARD_HEAD);
            self.write_word(data + len, GUARD_TAIL);
        }
        if self.flags.contains(PoolFlags::POISON) {
            self.arena[data as usize..(data + len) as usize].fill(POISON_BYTE);
        }

        let e = &mut self.entries[usize::from(id)];
        e.state = BlockState::Used;
        e.data = data;
        e.len = len;
        Ok(BlockAddr::new(data))
    }

    /// Releases a block previously handed out by this pool.
    ///
    /// The address must be exactly what alloc returned; anything else,
    /// including an address freed once already, is refused with
    /// `InvalidPointer` and the pool is left untouched.
    pub fn free(&mut self, addr: BlockAddr) -> Result<(), KernError> {
        let id = self.lookup(addr).ok_or(KernError::InvalidPointer)?;

        let (data, len) = {
            let e = &self.entries[usize::from(id)];
            (e.data, e.len)
        };
        if self.flags.contains(PoolFlags::RANGE_CHECK) {
            // A dead guard word means some live code scribbled outside its
            // block; continuing would just move the crash somewhere
            // stranger.
            uassert!(self.read_word(data - WORD) == GUARD_HEAD);
            uassert!(self.read_word(data + len) == GUARD_TAIL);
        }
        if self.flags.contains(PoolFlags::POISON) {
            self.arena[data as usize..(data + len) as usize].fill(POISON_BYTE);
        }

        {
            let e = &mut self.entries[usize::from(id)];
            e.state = BlockState::Free;
            e.data = e.base;
            e.len = 0;
        }
        let prev = self.free_insert(id);

        // Coalesce with the chain successor, then the predecessor. Address
        // order means those are the only candidates; offset math says if
        // they actually touch.
        if let Some(next) = self.free.next_of(&self.entries, id) {
            let (e_base, e_span) = self.base_span(id);
            let (n_base, n_span) = self.base_span(next);
            if e_base + e_span == n_base {
                self.entries[usize::from(id)].span = e_span + n_span;
                let r = self.free.remove_after(&mut self.entries, id);
                uassert!(r == Ok(next));
                self.entries[usize::from(next)] = Entry::default();
            }
        }
        if let Some(p) = prev {
            let (p_base, p_span) = self.base_span(p);
            let (e_base, e_span) = self.base_span(id);
            if p_base + p_span == e_base {
                self.entries[usize::from(p)].span = p_span + e_span;
                let r = self.free.remove_after(&mut self.entries, p);
                uassert!(r == Ok(id));
                self.entries[usize::from(id)] = Entry::default();
            }
        }
        Ok(())
    }

    /// Borrows the payload of a live block.
    ///
    /// This is how pool-resident kernel objects are reached: the handle
    /// revalidates against the registry on every access, so a destroyed
    /// object's handle goes dead instead of aliasing whatever reused the
    /// space.
    pub fn block_bytes_mut(&mut self, addr: BlockAddr) -> Result<&mut [u8], KernError> {
        let id = self.lookup(addr).ok_or(KernError::InvalidPointer)?;
        let e = &self.entries[usize::from(id)];
        Ok(&mut self.arena[e.data as usize..(e.data + e.len) as usize])
    }

    /// Takes a snapshot of pool occupancy.
    pub fn stat(&self) -> PoolStat {
        let mut s = PoolStat::default();
        for e in self.entries.iter() {
            match e.state {
                BlockState::Unused => {}
                BlockState::Free => {
                    s.free_blocks += 1;
                    s.free_bytes += e.span;
                    s.largest_free = s.largest_free.max(e.span);
                }
                BlockState::Used => {
                    s.used_blocks += 1;
                    s.used_bytes += e.span;
                }
            }
        }
        s
    }

    fn guard_len(&self) -> u32 {
        if self.flags.contains(PoolFlags::RANGE_CHECK) {
            WORD
        } else {
            0
        }
    }

    fn lookup(&self, addr: BlockAddr) -> Option<u16> {
        let off = addr.offset();
        self.entries
            .iter()
            .position(|e| e.state == BlockState::Used && e.data == off)
            .map(|i| i as u16)
    }

    fn unused_slot(&self) -> Option<u16> {
        self.entries
            .iter()
            .position(|e| e.state == BlockState::Unused)
            .map(|i| i as u16)
    }

    fn base_span(&self, id: u16) -> (u32, u32) {
        let e = &self.entries[usize::from(id)];
        (e.base, e.span)
    }

    /// Inserts `id` into the free chain keeping address order, returning its
    /// new predecessor.
    fn free_insert(&mut self, id: u16) -> Option<u16> {
        let key = self.entries[usize::from(id)].base;
        let mut prev: Option<u16> = None;
        let mut cur = self.free.head();
        while let Some(c) = cur {
            if self.entries[usize::from(c)].base > key {
                break;
            }
            prev = Some(c);
            cur = self.free.next_of(&self.entries, c);
        }
        match prev {
            None => self.free.add_head(&mut self.entries, id),
            Some(p) => {
                let r = self.free.add_after(&mut self.entries, p, id);
                uassert!(r.is_ok());
            }
        }
        prev
    }

    fn read_word(&self, off: u32) -> u32 {
        NativeEndian::read_u32(&self.arena[off as usize..(off + WORD) as usize])
    }

    fn write_word(&mut self, off: u32, w: u32) {
        NativeEndian::write_u32(&mut self.arena[off as usize..(off + WORD) as usize], w);
    }

    #[cfg(test)]
    fn arena_mut(&mut self) -> &mut [u8] {
        self.arena
    }
}

fn round_word(x: u32) -> u32 {
    align_up(u64::from(x), u64::from(WORD)) as u32
}

fn align_up(x: u64, align: u64) -> u64 {
    (x + align - 1) & !(align - 1)
}
