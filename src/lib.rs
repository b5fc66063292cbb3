//! Out-of-core state-vector simulation.
//!
//! Qubits are split into a primary set (encoded in the chunk id) and a
//! local set (encoded in the offset inside a chunk). Gates run only on
//! primary qubits; the scheduler reorders qubit roles, moving amplitudes
//! between chunks, whenever a gate needs a local qubit.

pub mod engine;
#[cfg(feature = "python")]
mod python;

pub use engine::circuit::{gate_matrix, Circuit, GateDescriptor, GateOp};
pub use engine::config::{AcquirePolicy, Backing, EngineConfig, Parallelism};
pub use engine::controller::{
    run_detached, AbortHandle, DetachedRun, Engine, GateScheduler, RunReport, SchedulerState,
};
pub use engine::error::{Result, SimError};
pub use engine::memory::{ChunkGuard, ChunkStore};
pub use engine::observable::{Observable, Pauli, PauliString};
pub use engine::partition::{AmplitudeIndexer, Location, QubitPartition, Role, Slot};
pub use engine::reorder::{ReorderEngine, ReorderStats};
pub use engine::results::StateReader;

#[cfg(feature = "python")]
use pyo3::prelude::*;

/// Python module definition
#[cfg(feature = "python")]
#[pymodule]
fn qp_chunk_sim(_py: Python, m: &Bound<'_, PyModule>) -> PyResult<()> {
    // Expose the main Engine class to Python
    m.add_class::<python::PyEngine>()?;
    Ok(())
}
