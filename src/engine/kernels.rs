// Computation Kernels
// Direct memory manipulation for gate operations
use ndarray::Array2;
use num_complex::Complex64;
use rayon::prelude::*;

/// Dense unitary flattened for the inner loops.
///
/// Applies either across a group of chunks (targets are primary: one chunk
/// per target bit pattern) or inside one buffer (targets are offset bits).
#[derive(Debug, Clone)]
pub struct GateKernel {
    dim: usize,
    arity: usize,
    /// Row-major entries
    entries: Vec<Complex64>,
}

impl GateKernel {
    pub fn new(matrix: &Array2<Complex64>) -> Self {
        let dim = matrix.nrows();
        Self {
            dim,
            arity: dim.trailing_zeros() as usize,
            entries: matrix.iter().copied().collect(),
        }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Apply across `2^k` equally long chunks, where chunk `m` holds the
    /// amplitudes whose target bits read `m` (first target most significant).
    /// Every offset is an independent `2^k`-vector. Returns the squared norm
    /// of the updated amplitudes.
    pub fn apply_grouped(&self, chunks: &mut [&mut [Complex64]], parallel: bool) -> f64 {
        debug_assert_eq!(chunks.len(), self.dim);
        match chunks {
            [lower, upper] => self.apply_pair(lower, upper, parallel),
            _ => self.apply_dense(chunks),
        }
    }

    fn apply_pair(&self, lower: &mut [Complex64], upper: &mut [Complex64], parallel: bool) -> f64 {
        let [m00, m01, m10, m11] = [
            self.entries[0],
            self.entries[1],
            self.entries[2],
            self.entries[3],
        ];
        // |0'> = U00|0> + U01|1>
        // |1'> = U10|0> + U11|1>
        let update = |(a0, a1): (&mut Complex64, &mut Complex64)| {
            let (amp0, amp1) = (*a0, *a1);
            *a0 = m00 * amp0 + m01 * amp1;
            *a1 = m10 * amp0 + m11 * amp1;
            a0.norm_sqr() + a1.norm_sqr()
        };
        if parallel {
            lower.par_iter_mut().zip(upper.par_iter_mut()).map(update).sum()
        } else {
            lower.iter_mut().zip(upper.iter_mut()).map(update).sum()
        }
    }

    fn apply_dense(&self, chunks: &mut [&mut [Complex64]]) -> f64 {
        let len = chunks.first().map_or(0, |c| c.len());
        let mut input = vec![Complex64::new(0.0, 0.0); self.dim];
        let mut norm = 0.0;
        for offset in 0..len {
            for (slot, chunk) in input.iter_mut().zip(chunks.iter()) {
                *slot = chunk[offset];
            }
            for (row, chunk) in chunks.iter_mut().enumerate() {
                let out = self.row_dot(row, &input);
                norm += out.norm_sqr();
                chunk[offset] = out;
            }
        }
        norm
    }

    /// Apply inside one buffer to the sub-space spanned by offset bits
    /// `positions` (`positions[0]` is the most significant matrix bit).
    /// Returns the squared norm of the whole buffer afterwards.
    pub fn apply_in_chunk(&self, amplitudes: &mut [Complex64], positions: &[usize]) -> f64 {
        debug_assert_eq!(positions.len(), self.arity);
        if let [position] = positions {
            return self.apply_strided(amplitudes, *position);
        }

        let mut sorted = positions.to_vec();
        sorted.sort_unstable();
        let bases = amplitudes.len() >> self.arity;
        let mut input = vec![Complex64::new(0.0, 0.0); self.dim];
        let mut index = vec![0usize; self.dim];
        for r in 0..bases {
            let base = insert_zero_bits(r, &sorted);
            for (m, slot) in index.iter_mut().enumerate() {
                *slot = base | pattern_bits(m, positions);
            }
            for (slot, &i) in input.iter_mut().zip(index.iter()) {
                *slot = amplitudes[i];
            }
            for (row, &i) in index.iter().enumerate() {
                amplitudes[i] = self.row_dot(row, &input);
            }
        }
        amplitudes.iter().map(|a| a.norm_sqr()).sum()
    }

    /// Single target at offset bit `position`.
    fn apply_strided(&self, amplitudes: &mut [Complex64], position: usize) -> f64 {
        // Stride is the distance between pair elements (i, i + 2^k)
        let stride = 1 << position;
        let block_size = stride * 2;
        // Inside each block the first `stride` elements have the target at
        // |0>, the next `stride` at |1>.
        amplitudes
            .chunks_mut(block_size)
            .map(|block| {
                let (lower, upper) = block.split_at_mut(stride);
                self.apply_pair(lower, upper, false)
            })
            .sum()
    }

    #[inline]
    fn row_dot(&self, row: usize, input: &[Complex64]) -> Complex64 {
        self.entries[row * self.dim..(row + 1) * self.dim]
            .iter()
            .zip(input)
            .map(|(m, v)| m * v)
            .sum()
    }
}

/// Spread the bits of `value` over the positions not listed in `sorted_holes`,
/// leaving zeros at the holes.
#[inline]
pub fn insert_zero_bits(mut value: usize, sorted_holes: &[usize]) -> usize {
    for &hole in sorted_holes {
        let low = value & ((1 << hole) - 1);
        value = ((value >> hole) << (hole + 1)) | low;
    }
    value
}

/// Place the bits of matrix index `m` at `positions` (`positions[0]` takes
/// the most significant of the `positions.len()` bits).
#[inline]
pub fn pattern_bits(m: usize, positions: &[usize]) -> usize {
    let k = positions.len();
    positions
        .iter()
        .enumerate()
        .fold(0, |acc, (j, &p)| acc | (((m >> (k - 1 - j)) & 1) << p))
}
