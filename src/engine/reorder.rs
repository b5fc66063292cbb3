// Qubit-role reordering
use bitvec::prelude::*;
use log::{debug, warn};
use num_complex::Complex64;
use rayon::prelude::*;
use std::cmp::Reverse;
use std::sync::{Mutex, PoisonError};

use crate::engine::circuit::AccessWindow;
use crate::engine::error::{Result, SimError};
use crate::engine::kernels::{insert_zero_bits, pattern_bits};
use crate::engine::memory::{release_all, ChunkStore};
use crate::engine::partition::{QubitPartition, Role};
use crate::engine::pool::WorkPool;

/// Logical clock of the last gate that touched each qubit.
#[derive(Debug, Clone)]
pub struct UsageClock {
    last: Vec<u64>,
    tick: u64,
}

impl UsageClock {
    pub fn new(num_qubits: usize) -> Self {
        Self {
            last: vec![0; num_qubits],
            tick: 0,
        }
    }

    pub fn touch(&mut self, qubits: &[usize]) {
        self.tick += 1;
        for &q in qubits {
            self.last[q] = self.tick;
        }
    }

    /// 0 means never used
    pub fn last_used(&self, qubit: usize) -> u64 {
        self.last[qubit]
    }
}

/// Data-movement counters; the cost the scheduler tries to keep low.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReorderStats {
    /// Passes over the chunk store
    pub passes: u64,
    /// Primary/local role exchanges
    pub swaps: u64,
    /// Amplitudes that changed chunk
    pub amplitudes_moved: u64,
}

/// Sole mutator of the role assignment. Every role change is paired with
/// the block transpose that keeps the logical state intact.
pub struct ReorderEngine {
    max_batch: usize,
    usage: UsageClock,
    stats: ReorderStats,
}

impl ReorderEngine {
    pub fn new(num_qubits: usize, max_batch: usize) -> Self {
        Self {
            max_batch: max_batch.max(1),
            usage: UsageClock::new(num_qubits),
            stats: ReorderStats::default(),
        }
    }

    pub fn stats(&self) -> ReorderStats {
        self.stats
    }

    pub fn usage(&self) -> &UsageClock {
        &self.usage
    }

    /// Record that a gate on `qubits` just ran.
    pub fn touch(&mut self, qubits: &[usize]) {
        self.usage.touch(qubits);
    }

    /// Promote one local qubit, demoting the least recently used primary.
    /// Returns the demoted qubit.
    pub fn promote(
        &mut self,
        store: &ChunkStore,
        partition: &mut QubitPartition,
        pool: &WorkPool,
        local_qubit: usize,
    ) -> Result<usize> {
        if partition.role_of(local_qubit)?.role != Role::Local {
            return Err(SimError::partition(format!(
                "qubit {local_qubit} is already primary"
            )));
        }
        let pinned = bitvec![0; partition.num_qubits()];
        let victims = self.choose_victims(partition, &pinned, &[], 1);
        let victim = *victims
            .first()
            .ok_or_else(|| SimError::partition("no primary qubit to demote"))?;
        self.swap_batch(store, partition, pool, &[(victim, local_qubit)])?;
        Ok(victim)
    }

    /// Make every qubit of the window's working set primary, demoting the
    /// primaries outside it whose next use is furthest away (least recently
    /// used on ties). Returns the number of swaps performed.
    pub fn promote_window(
        &mut self,
        store: &ChunkStore,
        partition: &mut QubitPartition,
        pool: &WorkPool,
        window: &AccessWindow,
    ) -> Result<usize> {
        let promote: Vec<usize> = window
            .by_first_use()
            .into_iter()
            .filter(|&q| !partition.is_primary(q))
            .collect();
        if promote.is_empty() {
            return Ok(0);
        }
        let victims =
            self.choose_victims(partition, &window.working_set, &window.first_use, promote.len());
        if victims.len() < promote.len() {
            return Err(SimError::partition(format!(
                "working set of {} qubits does not fit in {} primary slots",
                window.working_set.count_ones(),
                partition.num_primary()
            )));
        }
        let pairs: Vec<(usize, usize)> = victims.into_iter().zip(promote).collect();
        for batch in pairs.chunks(self.max_batch) {
            self.swap_batch(store, partition, pool, batch)?;
        }
        Ok(pairs.len())
    }

    /// Primary qubits outside `pinned`, best demotion candidates first.
    fn choose_victims(
        &self,
        partition: &QubitPartition,
        pinned: &BitSlice,
        next_use: &[Option<usize>],
        count: usize,
    ) -> Vec<usize> {
        let mut candidates: Vec<usize> = partition
            .primary_qubits()
            .iter()
            .copied()
            .filter(|&q| !pinned[q])
            .collect();
        candidates.sort_by_key(|&q| {
            let next = next_use.get(q).copied().flatten().unwrap_or(usize::MAX);
            (Reverse(next), self.usage.last_used(q), q)
        });
        candidates.truncate(count);
        candidates
    }

    /// Exchange roles for every `(primary, local)` pair in one pass.
    ///
    /// Chunks are visited in groups of `2^k` whose ids differ only in the
    /// demoted primary positions; the element at (member `a`, offset pattern
    /// `b`) trades places with (member `b`, offset pattern `a`). The role
    /// change is committed only after every group has moved.
    pub fn swap_batch(
        &mut self,
        store: &ChunkStore,
        partition: &mut QubitPartition,
        pool: &WorkPool,
        pairs: &[(usize, usize)],
    ) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut primary_pos = Vec::with_capacity(pairs.len());
        let mut local_pos = Vec::with_capacity(pairs.len());
        for &(p, l) in pairs {
            let (ps, ls) = (partition.role_of(p)?, partition.role_of(l)?);
            if ps.role != Role::Primary || ls.role != Role::Local {
                return Err(SimError::partition(format!(
                    "swap pair ({p}, {l}) is not (primary, local)"
                )));
            }
            if primary_pos.contains(&ps.position) || local_pos.contains(&ls.position) {
                return Err(SimError::partition(format!(
                    "qubit {p} or {l} appears twice in one batch"
                )));
            }
            primary_pos.push(ps.position);
            local_pos.push(ls.position);
        }

        let k = pairs.len();
        let groups = store.total_chunks() >> k;
        let parallel = pool.is_parallel();
        let finished = Mutex::new(bitvec![0; groups]);

        let outcome = pool.sum(groups, |group| -> Result<u64> {
            let moved = exchange_group(store, group, &primary_pos, &local_pos, parallel)?;
            finished
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .set(group, true);
            Ok(moved)
        });
        let moved = match outcome {
            Ok(moved) => moved,
            Err(err) => {
                // The transpose is its own inverse; redo finished groups
                // so chunk contents match the uncommitted roles again.
                let finished: Vec<usize> = finished
                    .into_inner()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter_ones()
                    .collect();
                let rollback = pool.for_each(finished.len(), |i| {
                    exchange_group(store, finished[i], &primary_pos, &local_pos, parallel)
                        .map(|_| ())
                });
                if let Err(undo_err) = rollback {
                    warn!(
                        target: "qp_chunk_sim::reorder",
                        "Rollback of {:?} after '{}' failed, store is inconsistent: {}",
                        pairs,
                        err,
                        undo_err
                    );
                }
                return Err(err);
            }
        };

        for &(p, l) in pairs {
            partition.swap(p, l)?;
        }
        self.stats.passes += 1;
        self.stats.swaps += k as u64;
        self.stats.amplitudes_moved += moved;
        debug!(
            target: "qp_chunk_sim::reorder",
            "Swapped {:?} in one pass, moved {} amplitudes (epoch {})",
            pairs,
            moved,
            partition.epoch()
        );
        Ok(())
    }
}

/// Acquire one group of `2^k` chunks differing in `primary_pos` and
/// transpose it against the offset bits at `local_pos`.
fn exchange_group(
    store: &ChunkStore,
    group: usize,
    primary_pos: &[usize],
    local_pos: &[usize],
    parallel: bool,
) -> Result<u64> {
    let mut sorted_primary = primary_pos.to_vec();
    sorted_primary.sort_unstable();
    let base = insert_zero_bits(group, &sorted_primary);
    let ids: Vec<usize> = (0..1usize << primary_pos.len())
        .map(|m| base | pattern_bits(m, primary_pos))
        .collect();
    let mut guards = store.acquire_group(&ids)?;
    let moved = {
        let mut views: Vec<&mut [Complex64]> = guards.iter_mut().map(|g| &mut **g).collect();
        transpose_group(&mut views, local_pos, parallel)
    };
    release_all(guards)?;
    Ok(moved)
}

/// In-place block transpose between group member index and the offset bits
/// at `local_pos`. Returns how many amplitudes changed chunk.
fn transpose_group(chunks: &mut [&mut [Complex64]], local_pos: &[usize], parallel: bool) -> u64 {
    if let ([lower, upper], [position]) = (&mut *chunks, local_pos) {
        // Single swap: upper half of each 2*stride block in `lower` trades
        // with the lower half of the matching block in `upper`.
        let stride = 1usize << *position;
        let block = stride * 2;
        let exchange = |(b0, b1): (&mut [Complex64], &mut [Complex64])| {
            b0[stride..].swap_with_slice(&mut b1[..stride]);
        };
        if parallel {
            lower
                .par_chunks_mut(block)
                .zip(upper.par_chunks_mut(block))
                .for_each(exchange);
        } else {
            lower
                .chunks_mut(block)
                .zip(upper.chunks_mut(block))
                .for_each(exchange);
        }
        return lower.len() as u64;
    }

    let k = local_pos.len();
    let members = 1usize << k;
    let mut sorted_local = local_pos.to_vec();
    sorted_local.sort_unstable();
    let rest = chunks.first().map_or(0, |c| c.len()) >> k;
    let mut moved = 0u64;
    for b in 1..members {
        let (low, high) = chunks.split_at_mut(b);
        let chunk_b = &mut high[0];
        for (a, chunk_a) in low.iter_mut().enumerate() {
            let pattern_a = pattern_bits(a, local_pos);
            let pattern_b = pattern_bits(b, local_pos);
            for r in 0..rest {
                let o = insert_zero_bits(r, &sorted_local);
                std::mem::swap(&mut chunk_a[o | pattern_b], &mut chunk_b[o | pattern_a]);
            }
            moved += 2 * rest as u64;
        }
    }
    moved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::{AcquirePolicy, EngineConfig, Parallelism};
    use crate::engine::partition::AmplitudeIndexer;

    /// Store whose amplitude at global index g is g + 1 (unnormalized marker)
    fn marked_store(p: usize, l: usize) -> (ChunkStore, QubitPartition) {
        marked_store_with(&EngineConfig::new(p, l))
    }

    fn marked_store_with(config: &EngineConfig) -> (ChunkStore, QubitPartition) {
        let (p, l) = (config.num_primary, config.num_local);
        let store = ChunkStore::open(config).unwrap();
        let partition = QubitPartition::new(p + l, p, l).unwrap();
        let indexer = AmplitudeIndexer::new(&partition);
        for chunk in 0..store.total_chunks() {
            let mut guard = store.acquire(chunk).unwrap();
            for (offset, amp) in guard.iter_mut().enumerate() {
                *amp = Complex64::new((indexer.global_index(chunk, offset) + 1) as f64, 0.0);
            }
        }
        (store, partition)
    }

    fn assert_logical_state_intact(store: &ChunkStore, partition: &QubitPartition) {
        let indexer = AmplitudeIndexer::new(partition);
        for chunk in 0..store.total_chunks() {
            let guard = store.acquire(chunk).unwrap();
            for (offset, amp) in guard.iter().enumerate() {
                let g = indexer.global_index(chunk, offset);
                assert_eq!(amp.re, (g + 1) as f64, "chunk {chunk} offset {offset}");
            }
        }
    }

    #[test]
    fn single_swap_preserves_logical_state() {
        for pool in [
            WorkPool::sequential(),
            WorkPool::new(Parallelism::Threads(2)).unwrap(),
        ] {
            let (store, mut partition) = marked_store(2, 3);
            let mut engine = ReorderEngine::new(5, 4);
            engine
                .swap_batch(&store, &mut partition, &pool, &[(0, 3)])
                .unwrap();
            assert!(partition.is_primary(3));
            assert!(!partition.is_primary(0));
            assert_logical_state_intact(&store, &partition);
            assert_eq!(engine.stats().amplitudes_moved, 16);
        }
    }

    #[test]
    fn batched_swaps_preserve_logical_state() {
        let (store, mut partition) = marked_store(3, 3);
        let mut engine = ReorderEngine::new(6, 4);
        let pool = WorkPool::sequential();
        engine
            .swap_batch(&store, &mut partition, &pool, &[(2, 3), (0, 5), (1, 4)])
            .unwrap();
        assert_eq!(partition.local_qubits().len(), 3);
        assert!([3, 4, 5].iter().all(|&q| partition.is_primary(q)));
        assert_logical_state_intact(&store, &partition);
        assert_eq!(engine.stats().passes, 1);
        assert_eq!(engine.stats().swaps, 3);
    }

    #[test]
    fn swap_and_swap_back_restores_placement() {
        let (store, mut partition) = marked_store(2, 2);
        let pool = WorkPool::sequential();
        let mut engine = ReorderEngine::new(4, 4);
        let before: Vec<Vec<Complex64>> = (0..4)
            .map(|c| store.acquire(c).unwrap().to_vec())
            .collect();
        engine.swap_batch(&store, &mut partition, &pool, &[(1, 2)]).unwrap();
        engine.swap_batch(&store, &mut partition, &pool, &[(2, 1)]).unwrap();
        let after: Vec<Vec<Complex64>> = (0..4)
            .map(|c| store.acquire(c).unwrap().to_vec())
            .collect();
        assert_eq!(before, after);
        assert_logical_state_intact(&store, &partition);
    }

    #[test]
    fn promote_demotes_least_recently_used() {
        let (store, mut partition) = marked_store(2, 2);
        let pool = WorkPool::sequential();
        let mut engine = ReorderEngine::new(4, 4);
        engine.touch(&[1]);
        engine.touch(&[0]);
        let demoted = engine.promote(&store, &mut partition, &pool, 3).unwrap();
        assert_eq!(demoted, 1);
        assert!(partition.is_primary(3));
        assert_logical_state_intact(&store, &partition);
        assert!(engine.promote(&store, &mut partition, &pool, 3).is_err());
    }

    #[test]
    fn window_promotion_spares_soon_needed_primaries() {
        let (store, mut partition) = marked_store(3, 2);
        let pool = WorkPool::sequential();
        let mut engine = ReorderEngine::new(5, 4);
        // qubit 0 used most recently, but qubit 2 is needed again soon
        engine.touch(&[2]);
        engine.touch(&[1]);
        engine.touch(&[0]);
        let mut first_use = vec![None; 5];
        first_use[4] = Some(0);
        first_use[2] = Some(3);
        let mut working_set = bitvec![0; 5];
        working_set.set(4, true);
        let window = AccessWindow {
            working_set,
            covered: 1,
            first_use,
        };
        let swaps = engine
            .promote_window(&store, &mut partition, &pool, &window)
            .unwrap();
        assert_eq!(swaps, 1);
        // 1 is older than 0 and neither is used in the window
        assert!(!partition.is_primary(1));
        assert!(partition.is_primary(2));
        assert_logical_state_intact(&store, &partition);
    }

    #[test]
    fn failed_pass_restores_chunks_and_roles() {
        let config = EngineConfig::new(2, 2).with_acquire_policy(AcquirePolicy::NonBlocking);
        let (store, mut partition) = marked_store_with(&config);
        let pool = WorkPool::sequential();
        let mut engine = ReorderEngine::new(4, 4);
        let before: Vec<Vec<Complex64>> = (0..4)
            .map(|c| store.acquire(c).unwrap().to_vec())
            .collect();

        // Qubit 1 sits at primary position 0: groups {0, 1} then {2, 3}
        let held = store.acquire(3).unwrap();
        let err = engine
            .swap_batch(&store, &mut partition, &pool, &[(1, 2)])
            .unwrap_err();
        assert!(matches!(err, SimError::ChunkBusy { chunk: 3 }));
        drop(held);

        let after: Vec<Vec<Complex64>> = (0..4)
            .map(|c| store.acquire(c).unwrap().to_vec())
            .collect();
        assert_eq!(before, after);
        assert!(partition.is_primary(1));
        assert!(!partition.is_primary(2));
        assert_eq!(engine.stats(), ReorderStats::default());
        assert_logical_state_intact(&store, &partition);
    }

    #[test]
    fn malformed_pairs_are_rejected() {
        let (store, mut partition) = marked_store(2, 2);
        let pool = WorkPool::sequential();
        let mut engine = ReorderEngine::new(4, 4);
        assert!(engine.swap_batch(&store, &mut partition, &pool, &[(2, 0)]).is_err());
        assert!(engine
            .swap_batch(&store, &mut partition, &pool, &[(0, 2), (0, 3)])
            .is_err());
        assert_eq!(engine.stats(), ReorderStats::default());
    }
}
