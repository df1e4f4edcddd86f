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

//! # Hatrie
//!
//! A concurrent hash-array-mapped trie from raw byte keys to machine-word
//! values: wait-free lookups, per-node locking for writers, offset-based
//! node addressing over a pluggable allocation backend, and two-phase
//! staged reclamation.
//!
//! ```
//! use hatrie::Hatrie;
//!
//! let map = Hatrie::new();
//! assert_eq!(map.put(b"alpha", 0x54), Some(0x54));
//! assert_eq!(map.get(b"alpha"), Some(0x54));
//! assert_eq!(map.del(b"alpha"), Some(0x54));
//! if let Some(generation) = map.stage_gc() {
//!     // in real use: wait for in-flight readers to drain first
//!     map.gc(generation);
//! }
//! ```
//!
//! Two constraints worth knowing up front:
//!
//! - **Values are 4-byte aligned words.** Slot words carry two low tag
//!   bits, so stored values must have their two low bits zero. Debug
//!   builds assert this; release builds do not check.
//! - **Nothing is freed behind a reader's back.** `del` only stages
//!   memory; reclaiming it is a [`Hatrie::stage_gc`]/[`Hatrie::gc`]
//!   handshake around a quiescence mechanism the caller brings (epochs,
//!   hazard pointers, a simple rwlock barrier — your call).

#![deny(unreachable_patterns)]

#[macro_use]
mod macros;

mod hash;
mod mem;
mod sync;
mod trie;

pub use {
    hash::{Murmur3, SeedHash},
    mem::{HeapMem, MemBackend, WORD_ALIGN},
    trie::{meta::MapFlag, GcToken, Hatrie},
};
