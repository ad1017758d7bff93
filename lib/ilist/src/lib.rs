// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Intrusive singly-linked list over slice indices.
//!
//! A `List` chains together elements of a caller-owned slice by storing
//! 16-bit indices in a [`Link`] embedded in each element, rather than
//! pointers. The list itself allocates nothing and holds no reference to the
//! slice; every operation borrows the slice for its duration. This is the
//! classic intrusive wait-queue / free-chain structure, expressed so that it
//! can be checked by the borrow checker instead of fought with it.
//!
//! # Design goals
//!
//! 1. `no_std`, no allocation, no unsafe.
//! 2. Element storage belongs to the caller (a task table, a block table),
//!    so a node is "in a list" without being owned by it.
//! 3. A `List` header is plain old data and can itself live inside a larger
//!    byte-addressed structure (it derives the `zerocopy` marker traits).
//! 4. Misuse is detected, not silently tolerated: each list carries a
//!    nonzero tag, each linked node records the tag of the list holding it,
//!    and anchor-based operations check the tag before touching links.
//!
//! Non-goals:
//!
//! - Concurrent access. Mutating operations take the element slice by
//!   `&mut`; external serialization is the caller's problem and is assumed.
//! - Doubly-linked O(1) arbitrary removal. Removal from the middle walks
//!   from the head, which is fine for the short queues this is built for.

#![cfg_attr(not(test), no_std)]

/// Sentinel index meaning "no element".
const RAW_NONE: u16 = u16::MAX;

/// Tag value of a node that is not currently on any list.
const TAG_NONE: u16 = 0;

/// Errors reported by list operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ListError {
    /// `remove_head` was called on an empty list.
    Empty,
    /// `remove_after` found nothing following the anchor (the anchor is the
    /// last element, or the list is empty).
    NoSuccessor,
    /// The named anchor element is not currently a member of this list.
    InvalidAnchor,
}

/// Link fields embedded in every element that can go on a list.
///
/// A fresh link is unlinked. Links are managed entirely by [`List`]; the
/// embedding type only has to store one and hand out references via
/// [`Node`].
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::KnownLayout,
    zerocopy_derive::Immutable,
)]
#[repr(C)]
pub struct Link {
    next: u16,
    owner: u16,
}

impl Link {
    /// Returns an unlinked link.
    pub const fn new() -> Self {
        Self {
            next: RAW_NONE,
            owner: TAG_NONE,
        }
    }

    /// Checks whether this node is currently on some list.
    pub fn is_linked(&self) -> bool {
        self.owner != TAG_NONE
    }

    fn clear(&mut self) {
        *self = Self::new();
    }
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}

/// Access to the [`Link`] embedded in a list element.
pub trait Node {
    fn link(&self) -> &Link;
    fn link_mut(&mut self) -> &mut Link;
}

/// List header: indices of the first and last element, plus the tag stamped
/// into every member's link.
///
/// The tag must be nonzero and should be unique among lists whose elements
/// share a slice; it is what lets anchor checks distinguish "member of this
/// list" from "member of some other list" in O(1).
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::KnownLayout,
    zerocopy_derive::Immutable,
)]
#[repr(C)]
pub struct List {
    head: u16,
    tail: u16,
    tag: u16,
}

impl List {
    /// Creates an empty list with the given membership tag.
    pub fn new(tag: u16) -> Self {
        debug_assert!(tag != TAG_NONE);
        Self {
            head: RAW_NONE,
            tail: RAW_NONE,
            tag,
        }
    }

    /// Checks whether the list has no elements.
    pub fn is_empty(&self) -> bool {
        self.head == RAW_NONE
    }

    /// Returns the index of the first element, if any.
    pub fn head(&self) -> Option<u16> {
        opt(self.head)
    }

    /// Returns the index of the last element, if any.
    pub fn tail(&self) -> Option<u16> {
        opt(self.tail)
    }

    /// Checks whether element `id` is currently a member of this list.
    pub fn contains<N: Node>(&self, nodes: &[N], id: u16) -> bool {
        nodes[usize::from(id)].link().owner == self.tag
    }

    /// Returns the element following `id`, if `id` has a successor.
    ///
    /// `id` must be a member; this is the read-only walking primitive used
    /// by callers that track their own anchor while scanning.
    pub fn next_of<N: Node>(&self, nodes: &[N], id: u16) -> Option<u16> {
        debug_assert!(self.contains(nodes, id));
        opt(nodes[usize::from(id)].link().next)
    }

    /// Inserts `id` as the new first element. O(1).
    ///
    /// `id` must not currently be on any list.
    pub fn add_head<N: Node>(&mut self, nodes: &mut [N], id: u16) {
        debug_assert!(!nodes[usize::from(id)].link().is_linked());
        let old_head = self.head;
        {
            let link = nodes[usize::from(id)].link_mut();
            link.next = old_head;
            link.owner = self.tag;
        }
        if old_head == RAW_NONE {
            self.tail = id;
        }
        self.head = id;
    }

    /// Inserts `id` immediately after `anchor`. O(1).
    ///
    /// Fails with `InvalidAnchor` if `anchor` is not a member of this list.
    /// `id` must not currently be on any list.
    pub fn add_after<N: Node>(
        &mut self,
        nodes: &mut [N],
        anchor: u16,
        id: u16,
    ) -> Result<(), ListError> {
        if !self.contains(nodes, anchor) {
            return Err(ListError::InvalidAnchor);
        }
        debug_assert!(!nodes[usize::from(id)].link().is_linked());
        let after = nodes[usize::from(anchor)].link().next;
        {
            let link = nodes[usize::from(id)].link_mut();
            link.next = after;
            link.owner = self.tag;
        }
        nodes[usize::from(anchor)].link_mut().next = id;
        if self.tail == anchor {
            self.tail = id;
        }
        Ok(())
    }

    /// Detaches and returns the first element, or `Empty` if there is none.
    pub fn remove_head<N: Node>(&mut self, nodes: &mut [N]) -> Result<u16, ListError> {
        if self.head == RAW_NONE {
            return Err(ListError::Empty);
        }
        let id = self.head;
        self.head = nodes[usize::from(id)].link().next;
        if self.head == RAW_NONE {
            self.tail = RAW_NONE;
        }
        nodes[usize::from(id)].link_mut().clear();
        Ok(id)
    }

    /// Detaches and returns the element following `anchor`.
    ///
    /// Fails with `InvalidAnchor` if `anchor` is not a member, and with
    /// `NoSuccessor` if `anchor` is the last element.
    pub fn remove_after<N: Node>(
        &mut self,
        nodes: &mut [N],
        anchor: u16,
    ) -> Result<u16, ListError> {
        if !self.contains(nodes, anchor) {
            return Err(ListError::InvalidAnchor);
        }
        let id = nodes[usize::from(anchor)].link().next;
        if id == RAW_NONE {
            return Err(ListError::NoSuccessor);
        }
        let after = nodes[usize::from(id)].link().next;
        nodes[usize::from(anchor)].link_mut().next = after;
        if self.tail == id {
            self.tail = anchor;
        }
        nodes[usize::from(id)].link_mut().clear();
        Ok(id)
    }

    /// Appends `id` as the new last element. O(1).
    ///
    /// This is the FIFO enqueue operation: elements pushed here come back
    /// out of [`Self::pop_head`] in arrival order.
    pub fn push_tail<N: Node>(&mut self, nodes: &mut [N], id: u16) {
        match self.tail() {
            None => self.add_head(nodes, id),
            Some(t) => {
                // The tail is a member by construction, so the anchor check
                // cannot fail.
                let r = self.add_after(nodes, t, id);
                debug_assert!(r.is_ok());
            }
        }
    }

    /// Detaches and returns the first element, if any.
    pub fn pop_head<N: Node>(&mut self, nodes: &mut [N]) -> Option<u16> {
        self.remove_head(nodes).ok()
    }

    /// Detaches `id` from wherever it sits in the list.
    ///
    /// Fails with `InvalidAnchor` if `id` is not a member. Walks from the
    /// head, so this is O(length); it exists for the timeout path, where
    /// the element to unlink is rarely the head.
    pub fn remove<N: Node>(&mut self, nodes: &mut [N], id: u16) -> Result<(), ListError> {
        if !self.contains(nodes, id) {
            return Err(ListError::InvalidAnchor);
        }
        if self.head == id {
            return self.remove_head(nodes).map(|_| ());
        }
        let mut anchor = self.head;
        // Bounded by the slice length; a longer walk means the chain is
        // corrupt.
        for _ in 0..nodes.len() {
            if anchor == RAW_NONE {
                break;
            }
            if nodes[usize::from(anchor)].link().next == id {
                return self.remove_after(nodes, anchor).map(|_| ());
            }
            anchor = nodes[usize::from(anchor)].link().next;
        }
        debug_assert!(false, "tagged node missing from chain");
        Err(ListError::InvalidAnchor)
    }

    /// Iterates element indices from head to tail.
    pub fn iter<'a, N: Node>(&self, nodes: &'a [N]) -> Iter<'a, N> {
        Iter {
            nodes,
            cur: self.head,
            // Fuel bounds the walk even if the chain is corrupt.
            fuel: nodes.len(),
        }
    }

    /// Counts the elements in the list.
    pub fn len<N: Node>(&self, nodes: &[N]) -> usize {
        self.iter(nodes).count()
    }
}

/// Iterator over element indices of one list.
pub struct Iter<'a, N> {
    nodes: &'a [N],
    cur: u16,
    fuel: usize,
}

impl<N: Node> Iterator for Iter<'_, N> {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        if self.cur == RAW_NONE || self.fuel == 0 {
            return None;
        }
        let id = self.cur;
        self.cur = self.nodes[usize::from(id)].link().next;
        self.fuel -= 1;
        Some(id)
    }
}

fn opt(raw: u16) -> Option<u16> {
    if raw == RAW_NONE {
        None
    } else {
        Some(raw)
    }
}
