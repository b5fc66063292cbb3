// Python bindings
use numpy::{IntoPyArray, PyArray1, PyReadonlyArray2};
use num_complex::Complex64;
use pyo3::exceptions::{PyIOError, PyMemoryError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::engine::circuit::{Circuit, GateDescriptor, GateOp};
use crate::engine::config::{Backing, EngineConfig};
use crate::engine::controller::Engine;
use crate::engine::error::SimError;
use crate::engine::observable::Observable;

impl From<SimError> for PyErr {
    fn from(err: SimError) -> Self {
        let message = err.to_string();
        match err {
            SimError::InvalidPartition { .. }
            | SimError::InvalidGate { .. }
            | SimError::QubitOutOfRange { .. }
            | SimError::UnsupportedGateArity { .. } => PyValueError::new_err(message),
            SimError::ResourceLimit { .. } => PyMemoryError::new_err(message),
            SimError::Io(_) => PyIOError::new_err(message),
            _ => PyRuntimeError::new_err(message),
        }
    }
}

/// Gates are collected first. Each `run` builds a fresh engine from |0…0⟩
/// over the gates added since the previous run.
#[pyclass(name = "Engine")]
pub struct PyEngine {
    config: EngineConfig,
    circuit: Circuit,
    engine: Option<Engine>, // Option allows building lazily
}

impl PyEngine {
    fn engine(&self) -> PyResult<&Engine> {
        self.engine
            .as_ref()
            .ok_or_else(|| PyRuntimeError::new_err("Engine has not run yet"))
    }
}

#[pymethods]
impl PyEngine {
    #[new]
    #[pyo3(signature = (num_qubits, num_primary, num_local, backing_store=None, lookahead_window=16))]
    pub fn new(
        num_qubits: usize,
        num_primary: usize,
        num_local: usize,
        backing_store: Option<String>,
        lookahead_window: usize,
    ) -> PyResult<Self> {
        if num_primary + num_local != num_qubits {
            return Err(SimError::InvalidPartition {
                reason: format!("{num_primary} primary + {num_local} local != {num_qubits} qubits"),
            }
            .into());
        }
        let backing = match backing_store {
            Some(path) => Backing::Mmap {
                path: PathBuf::from(path),
            },
            None => Backing::default(),
        };
        let config = EngineConfig::new(num_primary, num_local)
            .with_backing(backing)
            .with_lookahead_window(lookahead_window);
        Ok(Self {
            config,
            circuit: Circuit::new(num_qubits),
            engine: None,
        })
    }

    /// Append a named gate, e.g. `add_gate("cx", [0, 3])`.
    #[pyo3(signature = (name, targets, params=Vec::new()))]
    pub fn add_gate(&mut self, name: String, targets: Vec<usize>, params: Vec<f64>) -> PyResult<()> {
        let gate = GateOp::new(name, targets, params).to_descriptor()?;
        self.circuit.push(gate)?;
        Ok(())
    }

    /// Append an explicit unitary.
    pub fn add_matrix_gate(
        &mut self,
        matrix: PyReadonlyArray2<'_, Complex64>,
        targets: Vec<usize>,
    ) -> PyResult<()> {
        let gate = GateDescriptor::new(matrix.as_array().to_owned(), targets)?;
        self.circuit.push(gate)?;
        Ok(())
    }

    /// Execute the collected circuit. Returns (gates, swaps, passes, norm).
    pub fn run(&mut self, py: Python<'_>) -> PyResult<(usize, u64, u64, f64)> {
        let circuit = std::mem::replace(&mut self.circuit, Circuit::new(self.config.num_qubits()));
        let mut engine = Engine::new(circuit, self.config.clone())?;
        let report = py.allow_threads(|| engine.run());
        self.engine = Some(engine);
        let report = report?;
        Ok((
            report.gates_applied,
            report.reorder.swaps,
            report.reorder.passes,
            report.final_norm,
        ))
    }

    pub fn state_vector<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyArray1<Complex64>>> {
        let vector = self.engine()?.to_state_vector()?;
        Ok(vector.into_pyarray(py))
    }

    #[pyo3(signature = (shots, seed=None))]
    pub fn sample(&self, shots: usize, seed: Option<u64>) -> PyResult<BTreeMap<usize, usize>> {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(self.engine()?.sample(shots, &mut rng)?)
    }

    /// `terms` is a list of `(coefficient, "XIZ")` pairs.
    pub fn expectation(&self, terms: Vec<(f64, String)>) -> PyResult<f64> {
        let labels: Vec<(f64, &str)> = terms.iter().map(|(c, s)| (*c, s.as_str())).collect();
        let observable = Observable::from_labels(&labels)?;
        Ok(self.engine()?.expectation(&observable)?)
    }
}
