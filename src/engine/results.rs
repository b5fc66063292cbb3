// Results readout over the distributed state
use ndarray::Array1;
use num_complex::Complex64;
use rand::Rng;
use std::collections::BTreeMap;

use crate::engine::error::{Result, SimError};
use crate::engine::memory::{release_all, ChunkStore, AMPLITUDE_BYTES};
use crate::engine::observable::Observable;
use crate::engine::partition::AmplitudeIndexer;
use crate::engine::pool::WorkPool;

/// Read access to the final state, chunk by chunk.
///
/// Borrows the store and the indexer of the current role assignment;
/// nothing here changes amplitudes.
pub struct StateReader<'a> {
    store: &'a ChunkStore,
    indexer: &'a AmplitudeIndexer,
    pool: &'a WorkPool,
}

impl<'a> StateReader<'a> {
    pub fn new(store: &'a ChunkStore, indexer: &'a AmplitudeIndexer, pool: &'a WorkPool) -> Self {
        Self {
            store,
            indexer,
            pool,
        }
    }

    pub fn num_amplitudes(&self) -> usize {
        self.store.total_chunks() * self.store.chunk_len()
    }

    pub fn amplitude(&self, global: usize) -> Result<Complex64> {
        if global >= self.num_amplitudes() {
            return Err(SimError::resource(format!(
                "amplitude {global} is outside a {}-amplitude state",
                self.num_amplitudes()
            )));
        }
        let loc = self.indexer.locate(global);
        let guard = self.store.acquire(loc.chunk)?;
        let amp = guard[loc.offset];
        guard.release()?;
        Ok(amp)
    }

    /// Stream every `(global_index, amplitude)` pair, one chunk resident at a time.
    pub fn for_each_amplitude<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(usize, Complex64),
    {
        for chunk in 0..self.store.total_chunks() {
            let guard = self.store.acquire(chunk)?;
            for (offset, &amp) in guard.iter().enumerate() {
                visit(self.indexer.global_index(chunk, offset), amp);
            }
            guard.release()?;
        }
        Ok(())
    }

    /// Materialize the whole vector in global index order.
    pub fn to_state_vector(&self, max_bytes: Option<u64>) -> Result<Array1<Complex64>> {
        let len = self.num_amplitudes();
        let bytes = (len as u64).saturating_mul(AMPLITUDE_BYTES as u64);
        if let Some(limit) = max_bytes {
            if bytes > limit {
                return Err(SimError::resource(format!(
                    "state vector needs {bytes} bytes, limit is {limit}"
                )));
            }
        }
        let mut amplitudes = Vec::new();
        amplitudes.try_reserve_exact(len).map_err(|e| {
            SimError::resource(format!("cannot materialize {len} amplitudes: {e}"))
        })?;
        amplitudes.resize(len, Complex64::new(0.0, 0.0));
        self.for_each_amplitude(|global, amp| amplitudes[global] = amp)?;
        Ok(Array1::from_vec(amplitudes))
    }

    /// Probability mass held by each chunk, in chunk-id order.
    pub fn chunk_probabilities(&self) -> Result<Vec<f64>> {
        self.pool.collect(self.store.total_chunks(), |chunk| {
            let guard = self.store.acquire(chunk)?;
            let mass = guard.iter().map(|a| a.norm_sqr()).sum();
            guard.release()?;
            Ok(mass)
        })
    }

    pub fn norm_sqr(&self) -> Result<f64> {
        self.pool.sum(self.store.total_chunks(), |chunk| {
            let guard = self.store.acquire(chunk)?;
            let mass: f64 = guard.iter().map(|a| a.norm_sqr()).sum();
            guard.release()?;
            Ok(mass)
        })
    }

    /// Draw `shots` basis states from `|amplitude|^2` without materializing
    /// the vector. Each chunk is acquired at most once. Returns counts keyed
    /// by global index; an all-zero state yields no samples.
    pub fn sample<R: Rng + ?Sized>(&self, shots: usize, rng: &mut R) -> Result<BTreeMap<usize, usize>> {
        let mut counts = BTreeMap::new();
        let masses = self.chunk_probabilities()?;
        let total: f64 = masses.iter().sum();
        if shots == 0 || total <= 0.0 {
            return Ok(counts);
        }
        let mut draws: Vec<f64> = (0..shots).map(|_| rng.gen::<f64>() * total).collect();
        draws.sort_by(f64::total_cmp);
        let last_chunk = masses.iter().rposition(|&m| m > 0.0).unwrap_or(0);

        let mut next = 0;
        let mut cumulative = 0.0;
        for (chunk, &mass) in masses.iter().enumerate() {
            if next == draws.len() {
                break;
            }
            let upper = cumulative + mass;
            let mut end = next;
            while end < draws.len() && (draws[end] < upper || chunk == last_chunk) {
                end += 1;
            }
            if end > next && mass > 0.0 {
                let guard = self.store.acquire(chunk)?;
                let mut acc = cumulative;
                let mut last_offset = 0;
                for (offset, amp) in guard.iter().enumerate() {
                    let p = amp.norm_sqr();
                    if p == 0.0 {
                        continue;
                    }
                    acc += p;
                    last_offset = offset;
                    while next < end && draws[next] < acc {
                        *counts
                            .entry(self.indexer.global_index(chunk, offset))
                            .or_insert(0) += 1;
                        next += 1;
                    }
                }
                // Rounding leftovers land on the chunk's last non-zero amplitude
                if next < end {
                    *counts
                        .entry(self.indexer.global_index(chunk, last_offset))
                        .or_insert(0) += end - next;
                    next = end;
                }
                guard.release()?;
            }
            cumulative = upper;
        }
        Ok(counts)
    }

    /// `<psi|O|psi>` accumulated over chunk pairs linked by each term's bit flips.
    pub fn expectation(&self, observable: &Observable) -> Result<f64> {
        let num_qubits = (self.num_amplitudes().trailing_zeros()) as usize;
        let mut total = 0.0;
        for (coefficient, pauli) in observable.terms() {
            if pauli.is_identity() {
                total += coefficient * self.norm_sqr()?;
                continue;
            }
            let masks = pauli.masks(num_qubits)?;
            // The role assignment is a bit permutation, so XOR masks map
            // straight into chunk/offset space.
            let flip = self.indexer.locate(masks.flip);
            let phase = self.indexer.locate(masks.phase);
            let value = self.pool.sum(self.store.total_chunks(), |chunk| {
                let partner = chunk ^ flip.chunk;
                if partner < chunk {
                    return Ok(Complex64::new(0.0, 0.0));
                }
                let sign = |c: usize, o: usize| {
                    if ((c & phase.chunk).count_ones() + (o & phase.offset).count_ones()) % 2 == 0 {
                        1.0
                    } else {
                        -1.0
                    }
                };
                let pair_sum = |here: &[Complex64], there: &[Complex64], c: usize| {
                    here.iter()
                        .enumerate()
                        .map(|(o, amp)| there[o ^ flip.offset].conj() * amp * sign(c, o))
                        .sum::<Complex64>()
                };
                if partner == chunk {
                    let guard = self.store.acquire(chunk)?;
                    let sum = pair_sum(&guard, &guard, chunk);
                    guard.release()?;
                    Ok(sum)
                } else {
                    let guards = self.store.acquire_group(&[chunk, partner])?;
                    let sum = pair_sum(&guards[0], &guards[1], chunk)
                        + pair_sum(&guards[1], &guards[0], partner);
                    release_all(guards)?;
                    Ok(sum)
                }
            })?;
            let phase_factor = Complex64::i().powu(masks.y_count as u32);
            total += coefficient * (phase_factor * value).re;
        }
        Ok(total)
    }
}
