/*
 * Created on Wed Feb 14 2024
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

use std::alloc::{self, Layout};

/// Node allocations are word aligned; that keeps the two low bits of every
/// handle free for the slot tags
pub const WORD_ALIGN: usize = std::mem::align_of::<usize>();

/// The allocation backend for the map. Handles are opaque integers: the map
/// dereferences `base + handle`, where `base` is supplied at map creation.
/// Heap backends return raw addresses and run with `base = 0`; arena
/// backends return offsets into the arena and set `base` to the arena
/// origin, which is what lets the whole structure live inside a shared
/// memory region.
///
/// Contract: `base + handle` must be valid for at least `len` bytes and
/// aligned to [`WORD_ALIGN`]; `free` is always passed the exact `len` given
/// to `alloc`. Both operations must be safe to call from many threads.
pub trait MemBackend {
    /// Allocate `len` bytes, returning the handle or `None` when exhausted
    fn alloc(&self, len: usize) -> Option<usize>;
    /// Release an allocation of exactly `len` bytes
    fn free(&self, handle: usize, len: usize);
}

/// The default backend: the process heap, `base = 0`, handles are raw
/// addresses
pub struct HeapMem;

impl HeapMem {
    #[inline(always)]
    fn layout(len: usize) -> Layout {
        debug_assert_ne!(len, 0, "zero-sized node allocation");
        // len/align are always in range here (len is a node or key size)
        unsafe { Layout::from_size_align_unchecked(len, WORD_ALIGN) }
    }
}

impl MemBackend for HeapMem {
    fn alloc(&self, len: usize) -> Option<usize> {
        let p = unsafe {
            // SAFETY: layout is never zero-sized
            alloc::alloc(Self::layout(len))
        };
        if p.is_null() {
            None
        } else {
            Some(p as usize)
        }
    }
    fn free(&self, handle: usize, len: usize) {
        unsafe {
            // SAFETY: the caller returns the exact size it was handed out,
            // so the layout round-trips
            alloc::dealloc(handle as *mut u8, Self::layout(len))
        }
    }
}

impl<B: MemBackend> MemBackend for std::sync::Arc<B> {
    fn alloc(&self, len: usize) -> Option<usize> {
        (**self).alloc(len)
    }
    fn free(&self, handle: usize, len: usize) {
        (**self).free(handle, len)
    }
}
