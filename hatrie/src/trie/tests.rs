/*
 * Created on Sat Feb 17 2024
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
    super::{meta::MapFlag, Hatrie},
    crate::{
        hash::SeedHash,
        mem::{HeapMem, MemBackend},
    },
    parking_lot::RwLock,
    rand::{rngs::SmallRng, Rng, SeedableRng},
    std::{
        alloc::{self, Layout},
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Barrier,
        },
        thread::{self, JoinHandle},
    },
};

type Map = Hatrie;

fn workers() -> usize {
    thread::available_parallelism().map_or(4, |n| n.get()) + 1
}

/// Heap passthrough that counts allocations; used to pin down the exact
/// node counts of the collision paths
#[derive(Default)]
struct CountingHeap {
    allocs: AtomicUsize,
    live: AtomicUsize,
}

impl CountingHeap {
    fn allocs(&self) -> usize {
        self.allocs.load(Ordering::Relaxed)
    }
    fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

impl MemBackend for CountingHeap {
    fn alloc(&self, len: usize) -> Option<usize> {
        self.allocs.fetch_add(1, Ordering::Relaxed);
        self.live.fetch_add(1, Ordering::Relaxed);
        HeapMem.alloc(len)
    }
    fn free(&self, handle: usize, len: usize) {
        self.live.fetch_sub(1, Ordering::Relaxed);
        HeapMem.free(handle, len)
    }
}

const fn round_word(n: usize) -> usize {
    (n + 7) & !7
}

/// A bump arena handing out offsets instead of addresses; never reuses
/// space, only tracks occupancy, which is all the conservation test needs
struct Arena {
    buf: *mut u8,
    cap: usize,
    bump: AtomicUsize,
    used: AtomicUsize,
}

// SAFETY: the buffer is only ever carved up through atomic bump offsets
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    fn new(cap: usize) -> Self {
        let buf = unsafe { alloc::alloc_zeroed(Layout::from_size_align(cap, 8).unwrap()) };
        assert!(!buf.is_null());
        Self {
            buf,
            cap,
            bump: AtomicUsize::new(0),
            used: AtomicUsize::new(0),
        }
    }
    fn base(&self) -> usize {
        self.buf as usize
    }
    fn occupancy(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.buf, Layout::from_size_align(self.cap, 8).unwrap()) }
    }
}

impl MemBackend for Arena {
    fn alloc(&self, len: usize) -> Option<usize> {
        let len = round_word(len);
        let off = self.bump.fetch_add(len, Ordering::Relaxed);
        if off + len > self.cap {
            return None;
        }
        self.used.fetch_add(len, Ordering::Relaxed);
        Some(off)
    }
    fn free(&self, _handle: usize, len: usize) {
        self.used.fetch_sub(round_word(len), Ordering::Relaxed);
    }
}

/// Pins every key to one root slot; deeper slices come straight from the
/// first key byte, so `[x]` and `[y]` part ways at the level whose nibble
/// differs
enum RootClash {}

impl SeedHash for RootClash {
    fn hash(key: &[u8], _seed: u32) -> u32 {
        (0b101010 << 26) | key[0] as u32
    }
}

/// Full 32-bit collision under the epoch-0 seed; any later seed separates
/// keys by their first byte
enum FullClash {}

impl SeedHash for FullClash {
    fn hash(key: &[u8], seed: u32) -> u32 {
        if seed == 0 {
            0xdeadbeef
        } else {
            key[0] as u32
        }
    }
}

// single-threaded semantics

#[test]
fn drop_empty() {
    drop(Map::new());
}

#[test]
fn get_empty() {
    assert_eq!(Map::new().get(b"missing"), None);
}

#[test]
fn del_empty() {
    assert_eq!(Map::new().del(b"missing"), None);
}

#[test]
fn basic() {
    let map = Map::new();
    assert_eq!(map.get(b"test"), None);
    assert_eq!(map.put(b"test", 0x54), Some(0x54));
    // replace: the new binding wins and put echoes its own value back
    assert_eq!(map.put(b"test", 0x04), Some(0x04));
    assert_eq!(map.get(b"test"), Some(0x04));
    assert_eq!(map.del(b"test"), Some(0x04));
    assert_eq!(map.get(b"test"), None);
    assert_eq!(map.del(b"test"), None);
}

#[test]
fn empty_key_is_a_key() {
    let map = Map::new();
    assert_eq!(map.put(b"", 0x10), Some(0x10));
    assert_eq!(map.get(b""), Some(0x10));
    assert_eq!(map.put(b"x", 0x20), Some(0x20));
    assert_eq!(map.get(b""), Some(0x10));
    assert_eq!(map.del(b""), Some(0x10));
    assert_eq!(map.get(b""), None);
    assert_eq!(map.get(b"x"), Some(0x20));
}

#[test]
fn prefix_keys_are_distinct() {
    let map = Map::new();
    let keys: [&[u8]; 4] = [b"a", b"ab", b"abc", b"abcd"];
    for (i, k) in keys.iter().enumerate() {
        assert_eq!(map.put(k, i << 2), Some(i << 2));
    }
    for (i, k) in keys.iter().enumerate() {
        assert_eq!(map.get(k), Some(i << 2));
    }
    assert_eq!(map.del(b"ab"), Some(1 << 2));
    assert_eq!(map.get(b"a"), Some(0));
    assert_eq!(map.get(b"abc"), Some(2 << 2));
}

#[test]
fn long_keys_differ_by_length_only() {
    let map = Map::new();
    let buf = vec![0x11u8; 32 * 1024];
    for i in 1..32_usize {
        assert_eq!(map.put(&buf[..i * 1024], i << 2), Some(i << 2));
    }
    for i in 1..32_usize {
        assert_eq!(map.get(&buf[..i * 1024]), Some(i << 2));
    }
    for i in 1..32_usize {
        assert_eq!(map.del(&buf[..i * 1024]), Some(i << 2));
    }
    assert_eq!(map.get(&buf[..1024]), None);
}

#[test]
fn bulk() {
    const N: u32 = 1024 * 1024;
    let map = Map::new();
    for i in 0..N {
        let v = (i as usize) << 2;
        assert_eq!(map.put(&i.to_le_bytes(), v), Some(v));
        assert_eq!(map.get(&i.to_le_bytes()), Some(v));
    }
    for i in 0..N {
        assert_eq!(map.get(&i.to_le_bytes()), Some((i as usize) << 2));
    }
    for i in 0..N {
        assert_eq!(map.del(&i.to_le_bytes()), Some((i as usize) << 2));
        assert_eq!(map.get(&i.to_le_bytes()), None);
    }
}

#[test]
fn delete_one_verify_rest() {
    const N: usize = 300;
    let map = Map::new();
    let mut rng = SmallRng::seed_from_u64(1);
    let keys: Vec<u64> = (0..N).map(|_| rng.gen::<u64>() | 1).collect();
    for (i, k) in keys.iter().enumerate() {
        assert_eq!(map.put(&k.to_le_bytes(), i << 2), Some(i << 2));
    }
    for i in 0..N {
        assert_eq!(map.del(&keys[i].to_le_bytes()), Some(i << 2));
        // every survivor must still be reachable through whatever
        // collapsing the removal triggered
        for (j, k) in keys.iter().enumerate().skip(i + 1) {
            assert_eq!(map.get(&k.to_le_bytes()), Some(j << 2));
        }
        // single-threaded: nothing is in flight, reclaim immediately
        if let Some(generation) = map.stage_gc() {
            map.gc(generation);
        }
    }
}

#[test]
fn randomized_against_model() {
    const SLOTS: usize = 300;
    const OPS: usize = 100_000;
    let map = Map::new();
    let mut model: HashMap<Vec<u8>, usize> = HashMap::new();
    let mut rng = SmallRng::seed_from_u64(0xc0ffee);
    for _ in 0..OPS {
        let slot = rng.gen_range(0..SLOTS) as u32;
        let mut key = vec![0u8; 4 + (slot % 29) as usize];
        key[..4].copy_from_slice(&slot.to_le_bytes());
        match rng.gen_range(0..3) {
            0 => {
                let v = rng.gen::<usize>() << 2;
                assert_eq!(map.put(&key, v), Some(v));
                model.insert(key, v);
            }
            1 => {
                assert_eq!(map.get(&key), model.get(&key).copied());
            }
            _ => {
                assert_eq!(map.del(&key), model.remove(&key));
            }
        }
    }
    for (key, v) in &model {
        assert_eq!(map.get(key), Some(*v));
    }
}

// collision paths, observed through allocation counts (NOCOPY, so only
// nodes allocate)

#[test]
fn root_collision_allocates_one_branch() {
    let k1 = [0x01u8];
    let k2 = [0x02u8];
    let heap = Arc::new(CountingHeap::default());
    let map = unsafe {
        // SAFETY: heap handles, keys outlive the map (declared before it)
        Hatrie::<RootClash, _>::try_create(0, heap.clone(), MapFlag::NOCOPY.d()).unwrap()
    };
    let base = heap.allocs();
    assert_eq!(map.put(&k1, 0x54), Some(0x54));
    // first insert through an empty root slot: leaf + the level-0 branch
    assert_eq!(heap.allocs() - base, 2);
    assert_eq!(map.put(&k2, 0x58), Some(0x58));
    // same root slot, different level-0 nibble: just the leaf
    assert_eq!(heap.allocs() - base, 3);
    assert_eq!(map.get(&k1), Some(0x54));
    assert_eq!(map.get(&k2), Some(0x58));
    assert_eq!(map.del(&k1), Some(0x54));
    assert_eq!(map.get(&k2), Some(0x58));
    drop(map);
    assert_eq!(heap.live(), 0);
}

#[test]
fn level0_collision_splits_once() {
    // same root slot, same level-0 nibble, divergence at level 1
    let k1 = [0x11u8];
    let k2 = [0x21u8];
    let heap = Arc::new(CountingHeap::default());
    let map = unsafe {
        // SAFETY: heap handles, keys outlive the map
        Hatrie::<RootClash, _>::try_create(0, heap.clone(), MapFlag::NOCOPY.d()).unwrap()
    };
    assert_eq!(map.put(&k1, 0x54), Some(0x54));
    let base = heap.allocs();
    assert_eq!(map.put(&k2, 0x58), Some(0x58));
    // leaf + one internal node
    assert_eq!(heap.allocs() - base, 2);
    assert_eq!(map.get(&k1), Some(0x54));
    assert_eq!(map.get(&k2), Some(0x58));
    drop(map);
    assert_eq!(heap.live(), 0);
}

#[test]
fn full_hash_collision_reseeds() {
    let k1 = [0x01u8];
    let k2 = [0x02u8];
    let heap = Arc::new(CountingHeap::default());
    let map = unsafe {
        // SAFETY: heap handles, keys outlive the map
        Hatrie::<FullClash, _>::try_create(0, heap.clone(), MapFlag::NOCOPY.d()).unwrap()
    };
    assert_eq!(map.put(&k1, 0x54), Some(0x54));
    let base = heap.allocs();
    assert_eq!(map.put(&k2, 0x58), Some(0x58));
    // the 32-bit hash is identical, so the split runs the spine down to
    // the reseed level: a leaf plus eight internal nodes
    assert_eq!(heap.allocs() - base, 1 + 8);
    // both keys stay independently retrievable
    assert_eq!(map.get(&k1), Some(0x54));
    assert_eq!(map.get(&k2), Some(0x58));
    // removing one leaf collapses the whole spine, promoting the survivor
    assert_eq!(map.del(&k2), Some(0x58));
    assert_eq!(map.get(&k1), Some(0x54));
    assert_eq!(map.get(&k2), None);
    #[cfg(debug_assertions)]
    {
        assert_eq!(map.metrics.splits(), 1);
        assert!(map.metrics.collapses() >= 8);
    }
    assert_eq!(map.del(&k1), Some(0x54));
    if let Some(generation) = map.stage_gc() {
        map.gc(generation);
    }
    drop(map);
    assert_eq!(heap.live(), 0);
}

#[test]
fn nocopy_references_caller_keys() {
    let keys: Vec<Vec<u8>> = (0..64u32).map(|i| i.to_le_bytes().to_vec()).collect();
    let map = unsafe {
        // SAFETY: `keys` is declared before `map`, so it outlives it
        Hatrie::<crate::hash::Murmur3, _>::try_create(0, HeapMem, MapFlag::NOCOPY.d()).unwrap()
    };
    for (i, k) in keys.iter().enumerate() {
        assert_eq!(map.put(k, i << 2), Some(i << 2));
    }
    for (i, k) in keys.iter().enumerate() {
        assert_eq!(map.get(k), Some(i << 2));
    }
    for (i, k) in keys.iter().enumerate() {
        assert_eq!(map.del(k), Some(i << 2));
    }
}

#[test]
fn arena_occupancy_returns_to_zero() {
    const N: u32 = 512;
    let arena = Arc::new(Arena::new(2 * 1024 * 1024));
    let map = unsafe {
        // SAFETY: offsets into a buffer that outlives the map
        Hatrie::<crate::hash::Murmur3, _>::try_create(arena.base(), arena.clone(), 0).unwrap()
    };
    for i in 0..N {
        assert_eq!(map.put(&i.to_le_bytes(), (i as usize) << 2), Some((i as usize) << 2));
    }
    for i in 0..N {
        assert_eq!(map.get(&i.to_le_bytes()), Some((i as usize) << 2));
    }
    assert!(arena.occupancy() > 0);
    for i in 0..N {
        assert_eq!(map.del(&i.to_le_bytes()), Some((i as usize) << 2));
    }
    if let Some(generation) = map.stage_gc() {
        map.gc(generation);
    }
    drop(map);
    assert_eq!(arena.occupancy(), 0);
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "values must be 4-byte aligned")]
fn misaligned_value_is_rejected() {
    let _ = Map::new().put(b"k", 0x2);
}

// concurrency

#[test]
fn concurrent_fuzz() {
    const UNIVERSE: usize = 512;
    const OPS: usize = 250_000;
    let map = Arc::new(Map::new());
    let gate = Arc::new(Barrier::new(workers()));
    let threads: Vec<JoinHandle<_>> = (0..workers())
        .map(|tid| {
            let map = map.clone();
            let gate = gate.clone();
            thread::Builder::new()
                .name(tid.to_string())
                .spawn(move || {
                    let mut rng = SmallRng::seed_from_u64(5381 + tid as u64);
                    gate.wait();
                    for _ in 0..OPS {
                        let k = rng.gen_range(0..UNIVERSE);
                        let key = (k as u64).to_le_bytes();
                        let v = k << 2;
                        match rng.gen_range(0..4) {
                            // ~50% lookups
                            0 | 1 => {
                                let got = map.get(&key);
                                assert!(got.is_none() || got == Some(v));
                            }
                            2 => assert_eq!(map.put(&key, v), Some(v)),
                            _ => {
                                let got = map.del(&key);
                                assert!(got.is_none() || got == Some(v));
                            }
                        }
                    }
                })
                .unwrap()
        })
        .collect();
    threads.into_iter().for_each(|t| t.join().unwrap());
    // drain the universe; nothing is in flight anymore
    for k in 0..UNIVERSE {
        let got = map.del(&(k as u64).to_le_bytes());
        assert!(got.is_none() || got == Some(k << 2));
        assert_eq!(map.get(&(k as u64).to_le_bytes()), None);
    }
    if let Some(generation) = map.stage_gc() {
        map.gc(generation);
    }
}

#[test]
fn concurrent_collision_churn() {
    // a two-key universe with a fully colliding hash: every put/del cycle
    // grows and collapses the eight-deep reseed spine under contention
    const OPS: usize = 50_000;
    let map = Arc::new(unsafe {
        // SAFETY: heap handles, copy mode
        Hatrie::<FullClash, _>::try_create(0, HeapMem, 0).unwrap()
    });
    let gate = Arc::new(Barrier::new(workers()));
    let threads: Vec<JoinHandle<_>> = (0..workers())
        .map(|tid| {
            let map = map.clone();
            let gate = gate.clone();
            thread::spawn(move || {
                let mut rng = SmallRng::seed_from_u64(tid as u64);
                gate.wait();
                for _ in 0..OPS {
                    let k = [1 + rng.gen_range(0..2u8)];
                    let v = (k[0] as usize) << 2;
                    match rng.gen_range(0..4) {
                        0 | 1 => {
                            let got = map.get(&k);
                            assert!(got.is_none() || got == Some(v));
                        }
                        2 => assert_eq!(map.put(&k, v), Some(v)),
                        _ => {
                            let got = map.del(&k);
                            assert!(got.is_none() || got == Some(v));
                        }
                    }
                }
            })
        })
        .collect();
    threads.into_iter().for_each(|t| t.join().unwrap());
    for k in [[1u8], [2u8]] {
        let _ = map.del(&k);
        assert_eq!(map.get(&k), None);
    }
}

#[test]
fn concurrent_staged_gc_under_quiescence() {
    // readers hold the shared side of an rwlock while they touch the map;
    // the reclaimer detaches a generation under the exclusive side, which
    // is exactly the "wait until past readers drain" contract
    const ROUNDS: usize = 64;
    const BATCH: usize = 512;
    const UNIVERSE: usize = 128;
    let map = Arc::new(Map::new());
    let quiesce = Arc::new(RwLock::new(()));
    let stop = Arc::new(AtomicUsize::new(0));
    let threads: Vec<JoinHandle<_>> = (0..workers().max(3) - 1)
        .map(|tid| {
            let map = map.clone();
            let quiesce = quiesce.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut rng = SmallRng::seed_from_u64(0xbeef + tid as u64);
                while stop.load(Ordering::Acquire) == 0 {
                    let _in_flight = quiesce.read();
                    for _ in 0..BATCH {
                        let k = rng.gen_range(0..UNIVERSE);
                        let key = (k as u32).to_le_bytes();
                        let v = k << 2;
                        match rng.gen_range(0..3) {
                            0 => {
                                let got = map.get(&key);
                                assert!(got.is_none() || got == Some(v));
                            }
                            1 => assert_eq!(map.put(&key, v), Some(v)),
                            _ => {
                                let got = map.del(&key);
                                assert!(got.is_none() || got == Some(v));
                            }
                        }
                    }
                }
            })
        })
        .collect();
    for _ in 0..ROUNDS {
        let generation = {
            let _barrier = quiesce.write();
            // every op that might still reference a staged node has left
            map.stage_gc()
        };
        if let Some(generation) = generation {
            map.gc(generation);
        }
        thread::yield_now();
    }
    stop.store(1, Ordering::Release);
    threads.into_iter().for_each(|t| t.join().unwrap());
    for k in 0..UNIVERSE {
        let _ = map.del(&(k as u32).to_le_bytes());
    }
    if let Some(generation) = map.stage_gc() {
        map.gc(generation);
    }
}
