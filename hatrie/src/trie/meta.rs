/*
 * Created on Thu Feb 15 2024
 *
 * This file is a part of Hatrie
 * Hatrie is a free and open-source concurrent hash trie map keyed by raw
 * byte strings, designed for offset-based placement in custom memory
 * arenas and for deferred, staged reclamation.
 *
 * Copyright (c) 2024, the Hatrie developers
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

use {
    crate::sync::{Backoff, ORD_ACQ, ORD_REL, ORD_RLX},
    std::sync::atomic::{AtomicU32, AtomicUsize},
};

pub const HASHVAL_BITS: u32 = u32::BITS;
/// fanout of the root directory: 64 slots, sliced from the top of the hash
pub const ROOT_BITS: u32 = 6;
pub const ROOT_SIZE: usize = 1 << ROOT_BITS;
/// fanout of every level below the root: 16 slots per inode
pub const LEVEL_BITS: u32 = 4;
pub const LEVEL_SIZE: usize = 1 << LEVEL_BITS;
pub const LEVEL_MASK: u32 = (LEVEL_SIZE - 1) as u32;
/// deep levels carved out of one 32-bit hash value before reseeding
pub const LEVELS_PER_HASH: usize = (HASHVAL_BITS / LEVEL_BITS) as usize;

pub const ROOT_LEN: usize = ROOT_SIZE * std::mem::size_of::<usize>();
pub const INODE_LEN: usize = std::mem::size_of::<Inode>();
pub const LEAF_LEN: usize = std::mem::size_of::<Leaf>();

flags! {
    /// low-bit tag of a slot word; a whole-word zero is an empty slot
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct NodeTag: usize {
        LEAF = 0b01,
        INODE = 0b10,
    }
}

flags! {
    /// map creation options
    pub struct MapFlag: u32 {
        /// reference caller-owned key bytes instead of copying them into
        /// the leaf; the caller keeps them alive until the leaf has been
        /// reclaimed
        NOCOPY = 0x01,
    }
}

pub const TAG_MASK: usize = 0b11;

#[inline(always)]
pub const fn tag_of(word: usize) -> usize {
    word & TAG_MASK
}

#[inline(always)]
pub const fn ref_of(word: usize) -> usize {
    word & !TAG_MASK
}

#[inline(always)]
pub const fn tagged(handle: usize, tag: NodeTag) -> usize {
    handle | tag.d()
}

/// Seed for hash epoch `e` (epoch = how many full hash values the descent
/// has already consumed). Epoch 0 hashes with seed 0; later epochs walk a
/// fixed multiplicative schedule. Only observable behavior is contractual:
/// the schedule must be deterministic and vary per epoch.
#[inline(always)]
pub const fn seed_of(epoch: usize) -> u32 {
    (epoch as u32).wrapping_mul(0x9e3779b9)
}

/// Root directory index: the top [`ROOT_BITS`] of the epoch-0 hash
#[inline(always)]
pub const fn root_index(h0: u32) -> usize {
    (h0 >> (HASHVAL_BITS - ROOT_BITS)) as usize
}

/// Slot index at deep level `level`, given the hash value of the epoch the
/// level belongs to
#[inline(always)]
pub const fn slice_at(hv: u32, level: usize) -> usize {
    ((hv >> ((level % LEVELS_PER_HASH) as u32 * LEVEL_BITS)) & LEVEL_MASK) as usize
}

/*
    inode state word
    ---
    A single word carries the writer spin lock, the deletion-pending bit and
    the occupancy count. Folding the count into the same word as the pending
    bit is what makes the collapse decision a single atomic observation: a
    writer that sees DELETED while trying to lock restarts its descent, and
    the collapsing thread owns the node from the moment it sets the bit.
*/
pub const STATE_LOCKED: u32 = 1 << 31;
pub const STATE_DELETED: u32 = 1 << 30;
pub const STATE_COUNT: u32 = STATE_DELETED - 1;

/// An internal node: a 16-way branch. `parent` is a non-owning back
/// reference used only by collapse; it is written before the node is
/// published and never changes. Ownership flows strictly root → children.
#[repr(C)]
pub struct Inode {
    state: AtomicU32,
    level: u32,
    parent: usize,
    slots: [AtomicUsize; LEVEL_SIZE],
}

impl Inode {
    const NULL_SLOT: AtomicUsize = AtomicUsize::new(0);
    pub fn fresh(level: u32, parent: usize) -> Self {
        Self {
            state: AtomicU32::new(0),
            level,
            parent,
            slots: [Self::NULL_SLOT; LEVEL_SIZE],
        }
    }
    #[inline(always)]
    pub fn level(&self) -> u32 {
        self.level
    }
    #[inline(always)]
    pub fn parent(&self) -> usize {
        self.parent
    }
    #[inline(always)]
    pub fn slot(&self, i: usize) -> &AtomicUsize {
        &self.slots[i]
    }
    /// Take the writer lock, spinning with bounded backoff. Fails iff the
    /// node has its deletion-pending bit set, in which case the caller must
    /// restart from the root.
    pub fn lock(&self) -> bool {
        let bo = Backoff::new();
        loop {
            let s = self.state.load(ORD_RLX);
            if s & STATE_DELETED != 0 {
                return false;
            }
            if s & STATE_LOCKED == 0
                && self
                    .state
                    .compare_exchange_weak(s, s | STATE_LOCKED, ORD_ACQ, ORD_RLX)
                    .is_ok()
            {
                return true;
            }
            bo.spin();
        }
    }
    #[inline(always)]
    pub fn unlock(&self) {
        debug_assert!(self.state.load(ORD_RLX) & STATE_LOCKED != 0);
        self.state.fetch_and(!STATE_LOCKED, ORD_REL);
    }
    /// Mark the node as going away. Only ever called by the lock holder;
    /// the bit is never cleared, so the node is dead from here on.
    #[inline(always)]
    pub fn mark_deleted(&self) {
        debug_assert!(self.state.load(ORD_RLX) & STATE_LOCKED != 0);
        self.state.fetch_or(STATE_DELETED, ORD_REL);
    }
    #[inline(always)]
    pub fn is_deleted(&self) -> bool {
        self.state.load(ORD_ACQ) & STATE_DELETED != 0
    }
    #[inline(always)]
    pub fn count(&self) -> u32 {
        self.state.load(ORD_RLX) & STATE_COUNT
    }
    /// Unlocked probe of (deleted, count) in one shot
    #[inline(always)]
    pub fn probe(&self) -> (bool, u32) {
        let s = self.state.load(ORD_ACQ);
        (s & STATE_DELETED != 0, s & STATE_COUNT)
    }
    #[inline(always)]
    pub fn incr(&self) {
        self.state.fetch_add(1, ORD_RLX);
    }
    #[inline(always)]
    pub fn decr(&self) {
        debug_assert_ne!(self.count(), 0);
        self.state.fetch_sub(1, ORD_RLX);
    }
    /// Initialize the count of a node that has not been published yet
    #[inline(always)]
    pub fn set_count(&self, n: u32) {
        debug_assert!(n <= LEVEL_SIZE as u32);
        self.state.store(n, ORD_RLX);
    }
    /// The only live child of a single-occupancy node. Caller holds the lock.
    pub fn lone_child(&self) -> Option<usize> {
        debug_assert_eq!(self.count(), 1);
        self.slots.iter().map(|s| s.load(ORD_RLX)).find(|w| *w != 0)
    }
}

/// A key/value binding. Immutable once published, except for the value
/// word, which is atomically replaced when the same key is put again. In
/// copy mode `key` is a backend handle to an owned copy of the bytes; in
/// NOCOPY mode it is the caller's own buffer address.
#[repr(C)]
pub struct Leaf {
    key: usize,
    len: usize,
    val: AtomicUsize,
}

impl Leaf {
    pub fn fresh(key: usize, len: usize, val: usize) -> Self {
        Self {
            key,
            len,
            val: AtomicUsize::new(val),
        }
    }
    #[inline(always)]
    pub fn key_ref(&self) -> usize {
        self.key
    }
    #[inline(always)]
    pub fn key_len(&self) -> usize {
        self.len
    }
    #[inline(always)]
    pub fn val(&self) -> &AtomicUsize {
        &self.val
    }
}
