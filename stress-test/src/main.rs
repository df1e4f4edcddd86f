/*
 * Created on Sun Feb 18 2024
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

#![deny(unused_crate_dependencies)]
#![deny(unused_imports)]

use {
    hatrie::{Hatrie, SeedHash},
    log::{info, warn},
    parking_lot::RwLock,
    rand::{rngs::SmallRng, Rng, SeedableRng},
    std::{
        env,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Barrier,
        },
        thread,
        time::Instant,
    },
};

const OPS_PER_WORKER: usize = 1_000_000;

macro_rules! logstress {
    ($stressid:expr, $extra:expr) => {
        log::info!("Stress ({}): {}", $stressid, $extra);
    };
}

/// Full 32-bit collision under the epoch-0 seed: every key shares one
/// spine all the way down to the reseed level, which is the worst case for
/// contended split/collapse cycles
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

fn main() {
    env_logger::Builder::new()
        .parse_filters(&env::var("HATRIE_LOG").unwrap_or_else(|_| "info".to_owned()))
        .init();
    warn!("The stress test checks correctness under load and DOES NOT show the true throughput");
    let workers = num_cpus::get() + 1;
    info!(
        "This host has {} logical cores. Running every round with {} workers x {} ops",
        num_cpus::get(),
        workers,
        OPS_PER_WORKER
    );
    stress_multi(workers, 0x7f);
    stress_multi(workers, 0x1ff);
    stress_collision(workers);
    stress_staged_gc(workers);
    info!("SUCCESS. Stress test complete!");
}

fn mixed_op(map: &Hatrie, rng: &mut SmallRng, key: &[u8], v: usize) {
    match rng.gen_range(0..4) {
        // ~50% lookups
        0 | 1 => {
            let got = map.get(key);
            assert!(got.is_none() || got == Some(v), "foreign value for key");
        }
        2 => assert_eq!(map.put(key, v), Some(v)),
        _ => {
            let got = map.del(key);
            assert!(got.is_none() || got == Some(v), "foreign value for key");
        }
    }
}

/// Mixed get/put/del over a small key range; 0x7f keeps the churn within
/// two levels, 0x1ff forces multiple levels
fn stress_multi(workers: usize, mask: u64) {
    logstress!(
        format!("multi/{}", mask + 1),
        "mixed fuzz over a small key universe"
    );
    let map = Arc::new(Hatrie::new());
    let gate = Arc::new(Barrier::new(workers));
    let start = Instant::now();
    let threads: Vec<_> = (0..workers)
        .map(|tid| {
            let map = map.clone();
            let gate = gate.clone();
            thread::spawn(move || {
                let mut rng = SmallRng::seed_from_u64(5381 + tid as u64);
                gate.wait();
                for _ in 0..OPS_PER_WORKER {
                    let k = rng.gen::<u64>() & mask;
                    mixed_op(&map, &mut rng, &k.to_le_bytes(), (k as usize) << 2);
                }
            })
        })
        .collect();
    threads.into_iter().for_each(|t| t.join().unwrap());
    for k in 0..=mask {
        let got = map.del(&k.to_le_bytes());
        assert!(got.is_none() || got == Some((k as usize) << 2));
        assert_eq!(map.get(&k.to_le_bytes()), None);
    }
    if let Some(generation) = map.stage_gc() {
        map.gc(generation);
    }
    info!("multi/{}: done in {:.2?}", mask + 1, start.elapsed());
}

/// A four-key universe whose hashes fully collide: the deep reseed spine
/// is built and torn down constantly, racing readers against promotion
fn stress_collision(workers: usize) {
    logstress!("collision", "contended split/collapse over colliding keys");
    let map = Arc::new(unsafe {
        // SAFETY: heap mode, keys copied
        Hatrie::<FullClash, _>::try_create(0, hatrie::HeapMem, 0).unwrap()
    });
    let gate = Arc::new(Barrier::new(workers));
    let start = Instant::now();
    let threads: Vec<_> = (0..workers)
        .map(|tid| {
            let map = map.clone();
            let gate = gate.clone();
            thread::spawn(move || {
                let mut rng = SmallRng::seed_from_u64(tid as u64);
                gate.wait();
                for _ in 0..OPS_PER_WORKER {
                    let k = [1 + rng.gen_range(0..4u8)];
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
    for b in 1..=4u8 {
        let _ = map.del(&[b]);
        assert_eq!(map.get(&[b]), None);
    }
    info!("collision: done in {:.2?}", start.elapsed());
}

/// Staged reclamation running concurrently with the workload. Workers hold
/// the shared side of an rwlock while operating; the reclaimer takes the
/// exclusive side as its drain barrier before freeing a generation.
fn stress_staged_gc(workers: usize) {
    logstress!("staged-gc", "concurrent reclamation behind an rwlock barrier");
    const BATCH: usize = 1024;
    let map = Arc::new(Hatrie::new());
    let quiesce = Arc::new(RwLock::new(()));
    let done = Arc::new(AtomicBool::new(false));
    let start = Instant::now();
    let threads: Vec<_> = (0..workers.max(2) - 1)
        .map(|tid| {
            let map = map.clone();
            let quiesce = quiesce.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut rng = SmallRng::seed_from_u64(0xbeef + tid as u64);
                let mut left = OPS_PER_WORKER;
                while left > 0 {
                    let _in_flight = quiesce.read();
                    for _ in 0..BATCH.min(left) {
                        let k = rng.gen::<u64>() & 0xff;
                        mixed_op(&map, &mut rng, &k.to_le_bytes(), (k as usize) << 2);
                    }
                    left = left.saturating_sub(BATCH);
                }
                done.store(true, Ordering::Release);
            })
        })
        .collect();
    let mut generations = 0_usize;
    while !done.load(Ordering::Acquire) {
        let generation = {
            let _barrier = quiesce.write();
            map.stage_gc()
        };
        if let Some(generation) = generation {
            map.gc(generation);
            generations += 1;
        }
        thread::yield_now();
    }
    threads.into_iter().for_each(|t| t.join().unwrap());
    for k in 0..=0xff_u64 {
        let _ = map.del(&k.to_le_bytes());
    }
    if let Some(generation) = map.stage_gc() {
        map.gc(generation);
    }
    info!(
        "staged-gc: done in {:.2?} ({} generations reclaimed)",
        start.elapsed(),
        generations
    );
}
