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

/// A seedable 32-bit hash over raw bytes. The trie descends through
/// successive slices of this value and reseeds once a value is exhausted,
/// so the only hard requirement on an implementation is that two distinct
/// byte strings eventually diverge under some seed. Non-cryptographic,
/// fast and well-distributed is what you want here.
pub trait SeedHash: 'static {
    fn hash(key: &[u8], seed: u32) -> u32;
}

/// The default hash: murmurhash3 (x86, 32-bit variant), from the public
/// domain reference by Austin Appleby.
///
/// References:
/// - https://github.com/aappleby/smhasher/
pub enum Murmur3 {}

impl Murmur3 {
    const C1: u32 = 0xcc9e2d51;
    const C2: u32 = 0x1b873593;
    #[inline(always)]
    fn mix(mut k: u32) -> u32 {
        k = k.wrapping_mul(Self::C1);
        k = k.rotate_left(15);
        k.wrapping_mul(Self::C2)
    }
}

impl SeedHash for Murmur3 {
    fn hash(key: &[u8], seed: u32) -> u32 {
        let mut h = seed;
        let mut blocks = key.chunks_exact(4);
        for block in &mut blocks {
            let k = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
            h ^= Self::mix(k);
            h = h.rotate_left(13);
            h = h.wrapping_mul(5).wrapping_add(0xe6546b64);
        }
        let tail = blocks.remainder();
        if !tail.is_empty() {
            let mut k = 0u32;
            for (i, b) in tail.iter().enumerate() {
                k ^= (*b as u32) << (i * 8);
            }
            h ^= Self::mix(k);
        }
        // finalisation mix: force all bits of the block to avalanche
        h ^= key.len() as u32;
        h ^= h >> 16;
        h = h.wrapping_mul(0x85ebca6b);
        h ^= h >> 13;
        h = h.wrapping_mul(0xc2b2ae35);
        h ^ (h >> 16)
    }
}
