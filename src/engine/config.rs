// Engine configuration
use std::path::PathBuf;

/// Where chunk amplitudes live between acquisitions.
#[derive(Debug, Clone, PartialEq)]
pub enum Backing {
    /// Plain heap buffers. `max_bytes` caps the total allocation.
    Memory { max_bytes: Option<u64> },
    /// One memory-mapped file on secondary storage, one segment per chunk
    Mmap { path: PathBuf },
    /// Segments read and written through a Linux io_uring
    #[cfg(feature = "io-uring")]
    Uring { path: PathBuf, queue_depth: u32 },
}

impl Default for Backing {
    fn default() -> Self {
        Backing::Memory { max_bytes: None }
    }
}

/// What `acquire` does when the chunk is already held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquirePolicy {
    /// Wait for the holder to release
    #[default]
    Blocking,
    /// Fail with `ChunkBusy`
    NonBlocking,
}

/// How per-chunk work is distributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parallelism {
    Sequential,
    /// Bounded rayon pool; 0 picks rayon's default thread count
    Threads(usize),
}

impl Default for Parallelism {
    fn default() -> Self {
        Parallelism::Threads(0)
    }
}

/// Sizing and tuning knobs for one simulation run.
///
/// The primary/local split is always explicit; nothing here chooses it.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub num_primary: usize,
    pub num_local: usize,
    pub backing: Backing,
    pub acquire_policy: AcquirePolicy,
    /// Number of upcoming gates the scheduler inspects when it has to
    /// reorder. The batching this drives is a greedy heuristic, not an
    /// optimal schedule; tune it per workload.
    pub lookahead_window: usize,
    /// Most swaps folded into a single reorder pass. A pass over `k` swaps
    /// holds `2^k` chunks at once.
    pub max_batch_swaps: usize,
    pub parallelism: Parallelism,
    /// Report `NumericInstability` when `|norm - 1|` exceeds this after a gate
    pub norm_tolerance: Option<f64>,
    /// Refuse to materialize state vectors larger than this
    pub max_materialize_bytes: Option<u64>,
}

impl EngineConfig {
    pub fn new(num_primary: usize, num_local: usize) -> Self {
        Self {
            num_primary,
            num_local,
            backing: Backing::default(),
            acquire_policy: AcquirePolicy::default(),
            lookahead_window: 16,
            max_batch_swaps: 4,
            parallelism: Parallelism::default(),
            norm_tolerance: None,
            max_materialize_bytes: None,
        }
    }

    pub fn with_backing(mut self, backing: Backing) -> Self {
        self.backing = backing;
        self
    }

    pub fn with_acquire_policy(mut self, policy: AcquirePolicy) -> Self {
        self.acquire_policy = policy;
        self
    }

    pub fn with_lookahead_window(mut self, window: usize) -> Self {
        self.lookahead_window = window;
        self
    }

    pub fn with_max_batch_swaps(mut self, swaps: usize) -> Self {
        self.max_batch_swaps = swaps.max(1);
        self
    }

    pub fn with_parallelism(mut self, parallelism: Parallelism) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_norm_tolerance(mut self, tolerance: f64) -> Self {
        self.norm_tolerance = Some(tolerance);
        self
    }

    pub fn with_max_materialize_bytes(mut self, bytes: u64) -> Self {
        self.max_materialize_bytes = Some(bytes);
        self
    }

    pub fn num_qubits(&self) -> usize {
        self.num_primary + self.num_local
    }
}
