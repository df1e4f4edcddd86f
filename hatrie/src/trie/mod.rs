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

mod gc;
pub mod meta;
#[cfg(test)]
mod tests;

use {
    self::{
        gc::GcList,
        meta::{
            ref_of, root_index, seed_of, slice_at, tag_of, tagged, Inode, Leaf, MapFlag, NodeTag,
            INODE_LEN, LEAF_LEN, LEVELS_PER_HASH, LEVEL_SIZE, ROOT_LEN, ROOT_SIZE, TAG_MASK,
        },
    },
    crate::{
        hash::{Murmur3, SeedHash},
        mem::{HeapMem, MemBackend},
        sync::{ORD_ACQ, ORD_ACR, ORD_REL, ORD_RLX},
    },
    std::{alloc::Layout, marker::PhantomData, ptr, slice, sync::atomic::AtomicUsize},
};

pub use self::gc::GcToken;

/*
    concurrent hash trie
    ---
    A hash-array-mapped trie over raw byte keys, sliced along a seeded
    32-bit hash: 6 bits into a 64-way root directory, then 4 bits per
    16-way level. When a hash value runs out (8 deep levels), descent
    reseeds and keeps going, so two keys colliding on a full 32-bit value
    simply grow a deeper spine until they diverge. The design borrows from
    the published work on hash trees and non-blocking tries by Bagwell and
    by Prokopec, Bronson, Bagwell and Odersky [1][2], restricted to the
    operations this map actually needs: no snapshots, no iteration.

    Readers are wait-free along a single descent: acquire-load the slot
    word, decode the two-bit tag, recurse or compare. Writers take a
    per-inode spin lock for the one structural mutation they make (publish
    into an empty slot, split a colliding leaf into a subtree, remove a
    leaf, collapse an emptied node) and hold it for nothing else. A node
    being collapsed carries a deletion-pending bit that makes every later
    reader and writer restart from the root, which is what keeps a retired
    subtree from being resurrected by a racing insert.

    All node references are `base + handle` offsets handed out by the
    allocation backend, so an instance can live entirely inside a shared
    memory segment. Nothing is freed in place: retired nodes are staged on
    a lock-free list and handed back to the caller in generations
    (`stage_gc`/`gc`), and the caller decides when past readers have
    drained.

    ---
    References:
    [1]: https://lampwww.epfl.ch/papers/idealhashtrees.pdf
    [2]: Aleksandar Prokopec, Nathan Grasso Bronson, Phil Bagwell, and
    Martin Odersky. 2012. Concurrent tries with efficient non-blocking
    snapshots. SIGPLAN Not. 47, 8 (August 2012), 151-160.
    https://doi.org/10.1145/2370036.2145836
*/

#[cfg(debug_assertions)]
pub(crate) struct TrieMetrics {
    split: AtomicUsize,
    collapse: AtomicUsize,
}

#[cfg(debug_assertions)]
impl TrieMetrics {
    const fn new() -> Self {
        Self {
            split: AtomicUsize::new(0),
            collapse: AtomicUsize::new(0),
        }
    }
    fn hit_split(&self) {
        self.split.fetch_add(1, ORD_RLX);
    }
    fn hit_collapse(&self) {
        self.collapse.fetch_add(1, ORD_RLX);
    }
    #[cfg(test)]
    pub(crate) fn splits(&self) -> usize {
        self.split.load(ORD_RLX)
    }
    #[cfg(test)]
    pub(crate) fn collapses(&self) -> usize {
        self.collapse.load(ORD_RLX)
    }
}

/// A concurrent hash trie map from byte strings to machine-word values.
///
/// Values are opaque words with one constraint: their two low bits must be
/// zero (i.e. 4-byte aligned), because slot words reuse the low bits for
/// type tags. This is asserted in debug builds only.
///
/// `get` is wait-free, `put`/`del` lock exactly the inode they mutate.
/// Removal never frees memory directly; retired nodes accumulate until the
/// caller runs a `stage_gc`/`gc` cycle around its own quiescence
/// mechanism.
pub struct Hatrie<H = Murmur3, A: MemBackend = HeapMem> {
    base: usize,
    root: usize,
    flags: u32,
    mem: A,
    gc: GcList,
    #[cfg(debug_assertions)]
    metrics: TrieMetrics,
    _h: PhantomData<H>,
}

// SAFETY: every shared word inside the trie is accessed atomically and the
// structural protocol (per-inode locks + deletion-pending restarts) keeps
// node publication race-free; the map is as thread-safe as its backend
unsafe impl<H, A: MemBackend + Send> Send for Hatrie<H, A> {}
unsafe impl<H, A: MemBackend + Sync> Sync for Hatrie<H, A> {}

impl Hatrie {
    /// A heap-backed map that owns copies of its keys
    pub fn new() -> Self {
        match unsafe {
            // SAFETY: heap mode with base 0; no caller contracts involved
            Self::try_create(0, HeapMem, 0)
        } {
            Some(map) => map,
            None => std::alloc::handle_alloc_error(Layout::new::<[usize; ROOT_SIZE]>()),
        }
    }
}

impl Default for Hatrie {
    fn default() -> Self {
        Self::new()
    }
}

// construction, node addressing, reclamation: nothing here hashes
impl<H, A: MemBackend> Hatrie<H, A> {
    /// Create a map over a custom allocation backend. `base` is the
    /// address the backend's handles are relative to: 0 for heap-style
    /// backends that return raw addresses, the arena origin for offset
    /// backends. Returns `None` if the backend cannot produce the root
    /// directory.
    ///
    /// # Safety
    ///
    /// - `base + handle` must be valid, word-aligned memory of the length
    ///   requested, for every handle the backend returns, for as long as
    ///   the map (or any staged generation) lives.
    /// - With [`MapFlag::NOCOPY`], every key passed to `put` must stay
    ///   valid and unchanged until the leaf referencing it has been
    ///   retired *and* reclaimed through a `stage_gc`/`gc` cycle (or the
    ///   map dropped).
    pub unsafe fn try_create(base: usize, mem: A, flags: u32) -> Option<Self> {
        let root = mem.alloc(ROOT_LEN)?;
        debug_assert_eq!(root & TAG_MASK, 0, "misaligned backend handle");
        ptr::write_bytes((base + root) as *mut u8, 0, ROOT_LEN);
        log::trace!(
            "created map: base={:#x} root handle={:#x} flags={:#x}",
            base,
            root,
            flags
        );
        Some(Self {
            base,
            root,
            flags,
            mem,
            gc: GcList::new(),
            #[cfg(debug_assertions)]
            metrics: TrieMetrics::new(),
            _h: PhantomData,
        })
    }
    #[inline(always)]
    fn nocopy(&self) -> bool {
        self.flags & MapFlag::NOCOPY.d() != 0
    }
    #[inline(always)]
    fn addr(&self, handle: usize) -> *mut u8 {
        (self.base + handle) as *mut u8
    }
    #[inline(always)]
    unsafe fn inode(&self, handle: usize) -> &Inode {
        &*(self.addr(handle) as *const Inode)
    }
    #[inline(always)]
    unsafe fn leaf(&self, handle: usize) -> &Leaf {
        &*(self.addr(handle) as *const Leaf)
    }
    #[inline(always)]
    fn root_slot(&self, i: usize) -> &AtomicUsize {
        debug_assert!(i < ROOT_SIZE);
        unsafe {
            // SAFETY: the root directory is allocated at creation and only
            // freed on drop
            &*(self.addr(self.root) as *const AtomicUsize).add(i)
        }
    }
    unsafe fn leaf_key(&self, l: &Leaf) -> &[u8] {
        if l.key_len() == 0 {
            return &[];
        }
        let p = if self.nocopy() {
            l.key_ref() as *const u8
        } else {
            self.addr(l.key_ref()) as *const u8
        };
        slice::from_raw_parts(p, l.key_len())
    }
    #[inline(always)]
    fn key_eq(&self, l: &Leaf, key: &[u8]) -> bool {
        l.key_len() == key.len()
            && unsafe {
                // SAFETY: the leaf is reachable, so its key bytes are live
                self.leaf_key(l)
            } == key
    }
    fn alloc_inode(&self, level: u32, parent: usize) -> Option<usize> {
        let h = self.mem.alloc(INODE_LEN)?;
        debug_assert_eq!(h & TAG_MASK, 0, "misaligned backend handle");
        unsafe {
            // SAFETY: fresh allocation of INODE_LEN bytes
            (self.addr(h) as *mut Inode).write(Inode::fresh(level, parent))
        }
        Some(h)
    }
    fn alloc_leaf(&self, key: &[u8], val: usize) -> Option<usize> {
        let kref = if self.nocopy() {
            key.as_ptr() as usize
        } else if key.is_empty() {
            // the empty key owns no buffer
            0
        } else {
            let kh = self.mem.alloc(key.len())?;
            unsafe {
                // SAFETY: fresh allocation of key.len() bytes
                ptr::copy_nonoverlapping(key.as_ptr(), self.addr(kh), key.len())
            }
            kh
        };
        match self.mem.alloc(LEAF_LEN) {
            Some(h) => {
                debug_assert_eq!(h & TAG_MASK, 0, "misaligned backend handle");
                unsafe {
                    // SAFETY: fresh allocation of LEAF_LEN bytes
                    (self.addr(h) as *mut Leaf).write(Leaf::fresh(kref, key.len(), val))
                }
                Some(h)
            }
            None => {
                if !self.nocopy() && !key.is_empty() {
                    self.mem.free(kref, key.len());
                }
                None
            }
        }
    }
    /// Free a leaf (and its owned key copy) directly. Only legal for
    /// leaves that were never published or that are unreachable by every
    /// thread (drop path).
    fn free_leaf(&self, h: usize) {
        let l = unsafe {
            // SAFETY: caller guarantees exclusivity
            self.leaf(h)
        };
        if !self.nocopy() && l.key_len() != 0 {
            self.mem.free(l.key_ref(), l.key_len());
        }
        self.mem.free(h, LEAF_LEN);
    }
    /// Stage a logically removed leaf (and its owned key copy) for
    /// deferred reclamation
    fn stage_leaf(&self, h: usize) {
        let l = unsafe {
            // SAFETY: the leaf stays valid until the generation is freed
            self.leaf(h)
        };
        if !self.nocopy() && l.key_len() != 0 {
            self.gc.stage(l.key_ref(), l.key_len());
        }
        self.gc.stage(h, LEAF_LEN);
    }

    /*
        collapse
        ---
        Walk back up from a node that just lost a leaf, retiring nodes that
        no longer pay for themselves: an empty node unhooks to null, and a
        deep node whose lone remaining child is a leaf promotes that leaf
        into its parent's slot. A lone child that is itself an internal
        node is left alone: its slot positions encode hash slices of its
        own level, so promoting it would misindex the whole subtree; such
        spines drain bottom-up instead as their leaves go away.

        The node being retired gets its deletion-pending bit set (under its
        own lock) before the parent slot is rewritten. From that moment
        every reader or writer that lands on it restarts from the root, so
        the retired subtree cannot have new children published into it. The
        parent lock is taken second; the child→parent order is globally
        consistent, which is what rules out deadlock.

        Level-0 nodes hang off the lock-less root directory and are only
        retired once empty (the directory holds no leaves, so there is
        nothing to promote into it).
    */
    fn collapse(&self, ri: usize, mut nh: usize) {
        loop {
            let node = unsafe {
                // SAFETY: handles passed here are reachable, and a retired
                // node is staged (never freed) while the cascade holds it
                self.inode(nh)
            };
            let (dead, cnt) = node.probe();
            if dead || cnt >= 2 {
                return;
            }
            if node.level() == 0 {
                if cnt != 0 || !node.lock() {
                    return;
                }
                if node.count() != 0 {
                    // refilled while we were looking
                    node.unlock();
                    return;
                }
                node.mark_deleted();
                let r = self.root_slot(ri).compare_exchange(
                    tagged(nh, NodeTag::INODE),
                    0,
                    ORD_REL,
                    ORD_RLX,
                );
                debug_assert!(r.is_ok(), "root slot changed under a live child");
                self.gc.stage(nh, INODE_LEN);
                #[cfg(debug_assertions)]
                self.metrics.hit_collapse();
                return;
            }
            if !node.lock() {
                return;
            }
            let cnt = node.count();
            let replacement = if cnt == 0 {
                0
            } else if cnt == 1 {
                match node.lone_child() {
                    Some(w) if tag_of(w) == NodeTag::LEAF.d() => w,
                    _ => {
                        node.unlock();
                        return;
                    }
                }
            } else {
                node.unlock();
                return;
            };
            node.mark_deleted();
            let ph = node.parent();
            let parent = unsafe {
                // SAFETY: a parent outlives its children: it cannot be
                // retired while nh still occupies one of its slots
                self.inode(ph)
            };
            if !parent.lock() {
                debug_assert!(false, "parent retired under a live child");
                return;
            }
            let me = tagged(nh, NodeTag::INODE);
            let mut unhooked = false;
            for i in 0..LEVEL_SIZE {
                if parent.slot(i).load(ORD_RLX) == me {
                    parent.slot(i).store(replacement, ORD_REL);
                    unhooked = true;
                    break;
                }
            }
            debug_assert!(unhooked, "child vanished from parent");
            if replacement == 0 {
                parent.decr();
            }
            parent.unlock();
            self.gc.stage(nh, INODE_LEN);
            #[cfg(debug_assertions)]
            self.metrics.hit_collapse();
            // the parent may itself have dropped to a lone leaf or to
            // nothing; keep walking up
            nh = ph;
        }
    }

    /// Detach everything staged so far as one reclamation generation.
    /// Nothing that starts after this call can observe a node on the
    /// returned generation; the caller still has to wait out operations
    /// already in flight (its quiescence mechanism, not ours) before
    /// handing the token to [`Self::gc`].
    pub fn stage_gc(&self) -> Option<GcToken> {
        let head = self.gc.detach();
        if head.is_null() {
            None
        } else {
            log::trace!("staged a reclamation generation");
            Some(GcToken { head })
        }
    }

    /// Free every node on a staged generation
    pub fn gc(&self, mut token: GcToken) {
        let mut cur = token.head;
        token.head = ptr::null_mut();
        let mut n = 0_usize;
        while !cur.is_null() {
            let rec = unsafe {
                // SAFETY: the chain is exclusively owned via the token
                Box::from_raw(cur)
            };
            self.mem.free(rec.handle, rec.len);
            cur = rec.next;
            n += 1;
        }
        log::trace!("gc: freed {} retired allocations", n);
    }

    // drop path: single-threaded by &mut, frees everything in place
    fn free_subtree(&self, w: usize) {
        match tag_of(w) {
            t if t == NodeTag::LEAF.d() => self.free_leaf(ref_of(w)),
            t if t == NodeTag::INODE.d() => {
                let h = ref_of(w);
                for i in 0..LEVEL_SIZE {
                    let c = unsafe {
                        // SAFETY: drop path, no concurrent access
                        self.inode(h)
                    }
                    .slot(i)
                    .load(ORD_RLX);
                    if c != 0 {
                        self.free_subtree(c);
                    }
                }
                self.mem.free(h, INODE_LEN);
            }
            _ => unreachable!("tagged null in live slot"),
        }
    }
}

impl<H: SeedHash, A: MemBackend> Hatrie<H, A> {
    /// Slice of `key`'s hash at deep level `level`, rehashing with the
    /// level's seed epoch as needed
    #[inline]
    fn key_slice(key: &[u8], level: usize) -> usize {
        slice_at(H::hash(key, seed_of(level / LEVELS_PER_HASH)), level)
    }

    /// Look the key up. Wait-free along a single descent; only a collapse
    /// racing with us (deletion-pending) sends us back to the root.
    pub fn get(&self, key: &[u8]) -> Option<usize> {
        'restart: loop {
            let mut hv = H::hash(key, seed_of(0));
            let mut epoch = 0;
            let w = self.root_slot(root_index(hv)).load(ORD_ACQ);
            if w == 0 {
                return None;
            }
            debug_assert_eq!(tag_of(w), NodeTag::INODE.d());
            let mut node = unsafe {
                // SAFETY: tag-checked reachable handle
                self.inode(ref_of(w))
            };
            let mut level = 0_usize;
            loop {
                if node.is_deleted() {
                    continue 'restart;
                }
                let e = level / LEVELS_PER_HASH;
                if e != epoch {
                    epoch = e;
                    hv = H::hash(key, seed_of(e));
                }
                let sw = node.slot(slice_at(hv, level)).load(ORD_ACQ);
                match tag_of(sw) {
                    t if t == NodeTag::INODE.d() => {
                        node = unsafe {
                            // SAFETY: tag-checked reachable handle
                            self.inode(ref_of(sw))
                        };
                        level += 1;
                    }
                    t if t == NodeTag::LEAF.d() => {
                        let l = unsafe {
                            // SAFETY: tag-checked reachable handle
                            self.leaf(ref_of(sw))
                        };
                        return if self.key_eq(l, key) {
                            Some(l.val().load(ORD_ACQ))
                        } else {
                            None
                        };
                    }
                    _ => return None,
                }
            }
        }
    }

    /// Insert or replace. Returns the value that was passed in, or `None`
    /// when the backend is exhausted (in which case the map is unchanged).
    /// The value's two low bits must be zero.
    pub fn put(&self, key: &[u8], val: usize) -> Option<usize> {
        debug_assert_eq!(val & TAG_MASK, 0, "values must be 4-byte aligned");
        let new = self.alloc_leaf(key, val)?;
        'restart: loop {
            let mut hv = H::hash(key, seed_of(0));
            let mut epoch = 0;
            let ri = root_index(hv);
            let mut w = self.root_slot(ri).load(ORD_ACQ);
            while w == 0 {
                // empty root slot: the directory only ever references
                // internal nodes, so grow a level-0 node around the leaf
                // and publish the pair with one CAS
                let ih = match self.alloc_inode(0, 0) {
                    Some(ih) => ih,
                    None => {
                        self.free_leaf(new);
                        return None;
                    }
                };
                unsafe {
                    // SAFETY: unpublished node, we are the only writer
                    let n = self.inode(ih);
                    n.slot(slice_at(hv, 0))
                        .store(tagged(new, NodeTag::LEAF), ORD_RLX);
                    n.set_count(1);
                }
                match self.root_slot(ri).compare_exchange(
                    0,
                    tagged(ih, NodeTag::INODE),
                    ORD_REL,
                    ORD_ACQ,
                ) {
                    Ok(_) => return Some(val),
                    Err(cur) => {
                        // lost the race; the leaf is still ours
                        self.mem.free(ih, INODE_LEN);
                        w = cur;
                    }
                }
            }
            debug_assert_eq!(tag_of(w), NodeTag::INODE.d());
            let mut nh = ref_of(w);
            let mut node = unsafe {
                // SAFETY: tag-checked reachable handle
                self.inode(nh)
            };
            let mut level = 0_usize;
            'descend: loop {
                if node.is_deleted() {
                    continue 'restart;
                }
                let e = level / LEVELS_PER_HASH;
                if e != epoch {
                    epoch = e;
                    hv = H::hash(key, seed_of(e));
                }
                let idx = slice_at(hv, level);
                let sw = node.slot(idx).load(ORD_ACQ);
                match tag_of(sw) {
                    t if t == NodeTag::INODE.d() => {
                        nh = ref_of(sw);
                        node = unsafe {
                            // SAFETY: tag-checked reachable handle
                            self.inode(nh)
                        };
                        level += 1;
                    }
                    t if t == NodeTag::LEAF.d() => {
                        let old = ref_of(sw);
                        if self.key_eq(unsafe { self.leaf(old) }, key) {
                            // same key: swap the value word in place. Done
                            // under the node lock so the exchange cannot
                            // race with this leaf's removal.
                            if !node.lock() {
                                continue 'restart;
                            }
                            if node.slot(idx).load(ORD_RLX) != sw {
                                node.unlock();
                                continue 'descend;
                            }
                            unsafe {
                                // SAFETY: slot rechecked under the lock
                                self.leaf(old)
                            }
                            .val()
                            .swap(val, ORD_ACR);
                            node.unlock();
                            self.free_leaf(new);
                            return Some(val);
                        }
                        // a different key shares the path: split the slot
                        // into a fresh subtree holding both leaves
                        if !node.lock() {
                            continue 'restart;
                        }
                        if node.slot(idx).load(ORD_RLX) != sw {
                            node.unlock();
                            continue 'descend;
                        }
                        let ok = self.split(nh, node, idx, old, new, key, level);
                        node.unlock();
                        if !ok {
                            self.free_leaf(new);
                            return None;
                        }
                        return Some(val);
                    }
                    _ => {
                        // empty slot: publish the leaf
                        if !node.lock() {
                            continue 'restart;
                        }
                        if node.slot(idx).load(ORD_RLX) != 0 {
                            node.unlock();
                            continue 'descend;
                        }
                        node.slot(idx).store(tagged(new, NodeTag::LEAF), ORD_REL);
                        node.incr();
                        node.unlock();
                        return Some(val);
                    }
                }
            }
        }
    }

    /// Replace the leaf at `node.slot(idx)` (which holds `old`) with a
    /// chain of internal nodes deep enough for `old` and `new` to part
    /// ways. Called with `node` locked; the chain is fully built before
    /// the single publishing store, so a failure midway leaves the slot
    /// untouched.
    fn split(
        &self,
        nh: usize,
        node: &Inode,
        idx: usize,
        old: usize,
        new: usize,
        key: &[u8],
        level: usize,
    ) -> bool {
        let old_key = unsafe {
            // SAFETY: reachable leaf, bytes live until retirement
            self.leaf_key(self.leaf(old))
        };
        let mut lvl = level + 1;
        let first = match self.alloc_inode(lvl as u32, nh) {
            Some(h) => h,
            None => return false,
        };
        let mut cur = first;
        loop {
            let io = Self::key_slice(old_key, lvl);
            let in_ = Self::key_slice(key, lvl);
            let cnode = unsafe {
                // SAFETY: unpublished chain node
                self.inode(cur)
            };
            if io != in_ {
                cnode.slot(io).store(tagged(old, NodeTag::LEAF), ORD_RLX);
                cnode.slot(in_).store(tagged(new, NodeTag::LEAF), ORD_RLX);
                cnode.set_count(2);
                break;
            }
            // both keys still collide on this slice; push one level deeper
            // (reseeding happens inside the slice computation)
            match self.alloc_inode((lvl + 1) as u32, cur) {
                Some(next) => {
                    cnode.slot(io).store(tagged(next, NodeTag::INODE), ORD_RLX);
                    cnode.set_count(1);
                    cur = next;
                    lvl += 1;
                }
                None => {
                    self.unwind_chain(first);
                    return false;
                }
            }
        }
        node.slot(idx).store(tagged(first, NodeTag::INODE), ORD_REL);
        #[cfg(debug_assertions)]
        self.metrics.hit_split();
        true
    }
    /// Free a never-published split chain after an allocation failure. The
    /// chain holds no leaves at this point (leaves are only placed into
    /// the final, diverging node).
    fn unwind_chain(&self, first: usize) {
        let mut cur = first;
        loop {
            let mut next = 0;
            {
                let node = unsafe {
                    // SAFETY: unpublished chain node, exclusively ours
                    self.inode(cur)
                };
                for i in 0..LEVEL_SIZE {
                    let w = node.slot(i).load(ORD_RLX);
                    if tag_of(w) == NodeTag::INODE.d() {
                        next = ref_of(w);
                        break;
                    }
                }
            }
            self.mem.free(cur, INODE_LEN);
            if next == 0 {
                break;
            }
            cur = next;
        }
    }

    /// Remove the key, returning the value it held. The leaf (and any
    /// emptied ancestors) are staged, not freed.
    pub fn del(&self, key: &[u8]) -> Option<usize> {
        'restart: loop {
            let mut hv = H::hash(key, seed_of(0));
            let mut epoch = 0;
            let ri = root_index(hv);
            let w = self.root_slot(ri).load(ORD_ACQ);
            if w == 0 {
                return None;
            }
            debug_assert_eq!(tag_of(w), NodeTag::INODE.d());
            let mut nh = ref_of(w);
            let mut node = unsafe {
                // SAFETY: tag-checked reachable handle
                self.inode(nh)
            };
            let mut level = 0_usize;
            'descend: loop {
                if node.is_deleted() {
                    continue 'restart;
                }
                let e = level / LEVELS_PER_HASH;
                if e != epoch {
                    epoch = e;
                    hv = H::hash(key, seed_of(e));
                }
                let idx = slice_at(hv, level);
                let sw = node.slot(idx).load(ORD_ACQ);
                match tag_of(sw) {
                    t if t == NodeTag::INODE.d() => {
                        nh = ref_of(sw);
                        node = unsafe {
                            // SAFETY: tag-checked reachable handle
                            self.inode(nh)
                        };
                        level += 1;
                    }
                    t if t == NodeTag::LEAF.d() => {
                        let lh = ref_of(sw);
                        if !self.key_eq(unsafe { self.leaf(lh) }, key) {
                            return None;
                        }
                        if !node.lock() {
                            continue 'restart;
                        }
                        if node.slot(idx).load(ORD_RLX) != sw {
                            node.unlock();
                            continue 'descend;
                        }
                        node.slot(idx).store(0, ORD_REL);
                        node.decr();
                        let val = unsafe {
                            // SAFETY: slot rechecked under the lock; no
                            // concurrent value swap can happen now
                            self.leaf(lh)
                        }
                        .val()
                        .load(ORD_ACQ);
                        self.stage_leaf(lh);
                        node.unlock();
                        self.collapse(ri, nh);
                        return Some(val);
                    }
                    _ => return None,
                }
            }
        }
    }
}

impl<H, A: MemBackend> Drop for Hatrie<H, A> {
    fn drop(&mut self) {
        // a staged-but-unreclaimed generation is still freed here; what
        // drop cannot substitute for is reader quiescence
        let mut cur = self.gc.detach();
        while !cur.is_null() {
            let rec = unsafe {
                // SAFETY: sole live owner
                Box::from_raw(cur)
            };
            self.mem.free(rec.handle, rec.len);
            cur = rec.next;
        }
        for i in 0..ROOT_SIZE {
            let w = self.root_slot(i).load(ORD_RLX);
            if w != 0 {
                self.free_subtree(w);
            }
        }
        self.mem.free(self.root, ROOT_LEN);
        log::trace!("destroyed map: base={:#x}", self.base);
    }
}
