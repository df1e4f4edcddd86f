/*
 * Created on Tue Feb 13 2024
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

use std::{cell::Cell, hint::spin_loop, sync::atomic::Ordering};

pub(crate) const ORD_RLX: Ordering = Ordering::Relaxed;
pub(crate) const ORD_ACQ: Ordering = Ordering::Acquire;
pub(crate) const ORD_REL: Ordering = Ordering::Release;
pub(crate) const ORD_ACR: Ordering = Ordering::AcqRel;

/// Type to perform bounded exponential backoff on the writer spin paths.
/// Readers never spin, so this is only ever constructed while trying to
/// take an inode lock.
pub struct Backoff {
    cur: Cell<u32>,
}

impl Backoff {
    const SPIN_MIN: u32 = 4;
    const SPIN_MAX: u32 = 128;
    pub const fn new() -> Self {
        Self {
            cur: Cell::new(Self::SPIN_MIN),
        }
    }
    /// Spin for the current number of pause iterations, then double the
    /// step up to the cap
    pub fn spin(&self) {
        for _ in 0..self.cur.get() {
            spin_loop();
        }
        if self.cur.get() < Self::SPIN_MAX {
            self.cur.set(self.cur.get() << 1);
        }
    }
}
