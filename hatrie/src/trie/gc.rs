/*
 * Created on Fri Feb 16 2024
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
    crate::sync::{ORD_ACR, ORD_REL, ORD_RLX},
    std::{ptr, sync::atomic::AtomicPtr},
};

/// One retired allocation: the backend handle and the exact length it was
/// allocated with. Records live on the normal process heap so that retired
/// nodes themselves are never written to while stale readers may still be
/// looking at them.
pub(super) struct Retired {
    pub(super) handle: usize,
    pub(super) len: usize,
    pub(super) next: *mut Retired,
}

/// The staging list: a lock-free intrusive stack of [`Retired`] records.
/// Writers push at retirement time; [`GcList::detach`] snips the whole list
/// off in one exchange.
pub(super) struct GcList {
    head: AtomicPtr<Retired>,
}

impl GcList {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }
    pub fn stage(&self, handle: usize, len: usize) {
        let rec = Box::into_raw(Box::new(Retired {
            handle,
            len,
            next: ptr::null_mut(),
        }));
        let mut head = self.head.load(ORD_RLX);
        loop {
            unsafe {
                // SAFETY: rec is unpublished until the exchange below lands
                (*rec).next = head;
            }
            match self.head.compare_exchange_weak(head, rec, ORD_REL, ORD_RLX) {
                Ok(_) => break,
                Err(cur) => head = cur,
            }
        }
    }
    /// Atomically detach the current list. The release/acquire pair here is
    /// the fence the staging contract promises: no operation starting after
    /// the detach can observe anything on the returned chain.
    pub fn detach(&self) -> *mut Retired {
        self.head.swap(ptr::null_mut(), ORD_ACR)
    }
}

/// An opaque reclamation generation, returned by `stage_gc` and consumed by
/// `gc`. The token is move-only, so a generation cannot be freed twice and
/// a token cannot be conjured up from nothing. Dropping a token without
/// passing it to `gc` leaks that generation (the map cannot know whether
/// the caller still intends to free it); debug builds assert against it.
pub struct GcToken {
    pub(super) head: *mut Retired,
}

// SAFETY: the token is just a list of (handle, len) pairs; the thread that
// drains past-readers and calls `gc` need not be the one that staged
unsafe impl Send for GcToken {}

impl Drop for GcToken {
    fn drop(&mut self) {
        debug_assert!(self.head.is_null(), "staged token dropped without gc");
        // free the records themselves; the node memory is out of reach
        let mut cur = self.head;
        while !cur.is_null() {
            let rec = unsafe {
                // SAFETY: records come out of Box::into_raw and the token
                // has exclusive ownership of the chain
                Box::from_raw(cur)
            };
            cur = rec.next;
        }
    }
}
