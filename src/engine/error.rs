// Error taxonomy
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, SimError>;

/// Every failure the engine can surface to its caller.
///
/// Construction-time variants (`InvalidPartition`, `ResourceLimit`) abort
/// before any amplitude is touched. Per-gate variants abort at the current
/// gate boundary and leave the chunk store as of the last applied gate.
#[derive(Error, Debug)]
pub enum SimError {
    /// Sizing mismatch or a role map that is not a bijection
    #[error("invalid partition: {reason}")]
    InvalidPartition { reason: String },

    /// The backing medium cannot hold the requested chunks
    #[error("resource limit: {reason}")]
    ResourceLimit { reason: String },

    /// A gate needs more primary slots than exist
    #[error("gate {position} acts on {arity} qubits but only {num_primary} are primary")]
    UnsupportedGateArity {
        position: usize,
        arity: usize,
        num_primary: usize,
    },

    /// Non-blocking acquisition hit a held chunk
    #[error("chunk {chunk} is held by another acquirer")]
    ChunkBusy { chunk: usize },

    /// A group acquisition named the same chunk twice
    #[error("chunk {chunk} requested twice in one group")]
    DuplicateChunk { chunk: usize },

    /// State norm drifted past the configured tolerance
    #[error("norm {norm} after gate {position} drifted beyond tolerance {tolerance}")]
    NumericInstability {
        position: usize,
        norm: f64,
        tolerance: f64,
    },

    /// Malformed gate descriptor
    #[error("invalid gate: {reason}")]
    InvalidGate { reason: String },

    #[error("qubit {qubit} out of range for a {num_qubits}-qubit register")]
    QubitOutOfRange { qubit: usize, num_qubits: usize },

    /// Run stopped between gates by an abort request
    #[error("run aborted after {completed} gates")]
    Aborted { completed: usize },

    #[error("backing store I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker pool: {0}")]
    WorkerPool(String),
}

impl SimError {
    pub(crate) fn partition(reason: impl Into<String>) -> Self {
        SimError::InvalidPartition {
            reason: reason.into(),
        }
    }

    pub(crate) fn resource(reason: impl Into<String>) -> Self {
        SimError::ResourceLimit {
            reason: reason.into(),
        }
    }

    pub(crate) fn gate(reason: impl Into<String>) -> Self {
        SimError::InvalidGate {
            reason: reason.into(),
        }
    }
}

impl From<rayon::ThreadPoolBuildError> for SimError {
    fn from(err: rayon::ThreadPoolBuildError) -> Self {
        SimError::WorkerPool(err.to_string())
    }
}
