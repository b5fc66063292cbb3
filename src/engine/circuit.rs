// Circuit Analyzer
use bitvec::prelude::*;
use ndarray::{array, Array2};
use num_complex::Complex64;
use std::f64::consts::FRAC_1_SQRT_2;

use crate::engine::error::{Result, SimError};

const UNITARY_TOLERANCE: f64 = 1e-8;
const MAX_QUBITS: usize = usize::BITS as usize;

/// Immutable unitary plus the ordered qubits it acts on.
///
/// `targets[0]` is the most significant bit of the matrix row/column index.
#[derive(Debug, Clone, PartialEq)]
pub struct GateDescriptor {
    matrix: Array2<Complex64>,
    targets: Vec<usize>,
}

impl GateDescriptor {
    pub fn new(matrix: Array2<Complex64>, targets: Vec<usize>) -> Result<Self> {
        if targets.is_empty() {
            return Err(SimError::gate("a gate needs at least one target"));
        }
        // Amplitude indices are `usize`, so no register is wider than its bits
        if let Some(&t) = targets.iter().find(|&&t| t >= MAX_QUBITS) {
            return Err(SimError::gate(format!(
                "qubit {t} is beyond the {MAX_QUBITS}-qubit addressing limit"
            )));
        }
        let mut sorted = targets.clone();
        sorted.sort_unstable();
        if let Some(pair) = sorted.windows(2).find(|w| w[0] == w[1]) {
            return Err(SimError::gate(format!("qubit {} is targeted twice", pair[0])));
        }
        let dim = 1usize
            .checked_shl(targets.len() as u32)
            .ok_or_else(|| SimError::gate("too many targets"))?;
        if matrix.dim() != (dim, dim) {
            return Err(SimError::gate(format!(
                "{} targets need a {dim}x{dim} matrix, got {:?}",
                targets.len(),
                matrix.dim()
            )));
        }
        if !is_unitary(&matrix) {
            return Err(SimError::gate("matrix is not unitary"));
        }
        Ok(Self { matrix, targets })
    }

    pub fn identity(targets: Vec<usize>) -> Result<Self> {
        let dim = 1usize << targets.len().min(usize::BITS as usize - 1);
        Self::new(Array2::eye(dim), targets)
    }

    pub fn matrix(&self) -> &Array2<Complex64> {
        &self.matrix
    }

    pub fn targets(&self) -> &[usize] {
        &self.targets
    }

    pub fn arity(&self) -> usize {
        self.targets.len()
    }

    /// Conjugate transpose on the same targets.
    pub fn inverse(&self) -> Self {
        Self {
            matrix: self.matrix.t().mapv(|c| c.conj()),
            targets: self.targets.clone(),
        }
    }
}

fn is_unitary(matrix: &Array2<Complex64>) -> bool {
    let adjoint = matrix.t().mapv(|c| c.conj());
    let product = adjoint.dot(matrix);
    product.indexed_iter().all(|((r, c), v)| {
        let expected = if r == c { 1.0 } else { 0.0 };
        (v - Complex64::new(expected, 0.0)).norm() < UNITARY_TOLERANCE
    })
}

/// Represents a named Quantum Gate as emitted by a circuit compiler
#[derive(Debug, Clone)]
pub struct GateOp {
    pub name: String,
    pub targets: Vec<usize>,
    pub params: Vec<f64>,
}

impl GateOp {
    pub fn new(name: impl Into<String>, targets: Vec<usize>, params: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            targets,
            params,
        }
    }

    pub fn to_descriptor(&self) -> Result<GateDescriptor> {
        let matrix = gate_matrix(&self.name, &self.params)?;
        GateDescriptor::new(matrix, self.targets.clone())
    }
}

fn c(re: f64, im: f64) -> Complex64 {
    Complex64::new(re, im)
}

fn phase(theta: f64) -> Complex64 {
    Complex64::from_polar(1.0, theta)
}

/// Block-diagonal `diag(I, u)`: the first target is the control.
fn controlled(u: &Array2<Complex64>) -> Array2<Complex64> {
    let n = u.nrows();
    let mut m = Array2::eye(2 * n);
    m.slice_mut(ndarray::s![n.., n..]).assign(u);
    m
}

fn expect_params(name: &str, params: &[f64], count: usize) -> Result<()> {
    if params.len() != count {
        return Err(SimError::gate(format!(
            "{name} takes {count} parameter(s), got {}",
            params.len()
        )));
    }
    Ok(())
}

/// Matrix for a standard gate name. Names are case-insensitive.
pub fn gate_matrix(name: &str, params: &[f64]) -> Result<Array2<Complex64>> {
    let upper = name.to_uppercase();
    let fixed = |m: Array2<Complex64>| expect_params(&upper, params, 0).map(|_| m);
    let zero = c(0.0, 0.0);
    let one = c(1.0, 0.0);
    match upper.as_str() {
        "I" | "ID" => fixed(Array2::eye(2)),
        "X" => fixed(array![[zero, one], [one, zero]]),
        "Y" => fixed(array![[zero, c(0.0, -1.0)], [c(0.0, 1.0), zero]]),
        "Z" => fixed(array![[one, zero], [zero, -one]]),
        "H" => {
            let val = c(FRAC_1_SQRT_2, 0.0);
            fixed(array![[val, val], [val, -val]])
        }
        "S" => fixed(array![[one, zero], [zero, c(0.0, 1.0)]]),
        "SDG" => fixed(array![[one, zero], [zero, c(0.0, -1.0)]]),
        "T" => fixed(array![[one, zero], [zero, phase(std::f64::consts::FRAC_PI_4)]]),
        "TDG" => fixed(array![[one, zero], [zero, phase(-std::f64::consts::FRAC_PI_4)]]),
        "SX" => fixed(array![
            [c(0.5, 0.5), c(0.5, -0.5)],
            [c(0.5, -0.5), c(0.5, 0.5)]
        ]),
        "RX" => {
            expect_params(&upper, params, 1)?;
            let (cos, sin) = ((params[0] / 2.0).cos(), (params[0] / 2.0).sin());
            Ok(array![[c(cos, 0.0), c(0.0, -sin)], [c(0.0, -sin), c(cos, 0.0)]])
        }
        "RY" => {
            expect_params(&upper, params, 1)?;
            let (cos, sin) = ((params[0] / 2.0).cos(), (params[0] / 2.0).sin());
            Ok(array![[c(cos, 0.0), c(-sin, 0.0)], [c(sin, 0.0), c(cos, 0.0)]])
        }
        "RZ" => {
            expect_params(&upper, params, 1)?;
            Ok(array![
                [phase(-params[0] / 2.0), zero],
                [zero, phase(params[0] / 2.0)]
            ])
        }
        "P" | "U1" => {
            expect_params(&upper, params, 1)?;
            Ok(array![[one, zero], [zero, phase(params[0])]])
        }
        "U" | "U3" => {
            expect_params(&upper, params, 3)?;
            let (theta, phi, lambda) = (params[0], params[1], params[2]);
            let (cos, sin) = ((theta / 2.0).cos(), (theta / 2.0).sin());
            Ok(array![
                [c(cos, 0.0), -phase(lambda) * sin],
                [phase(phi) * sin, phase(phi + lambda) * cos]
            ])
        }
        "CX" | "CNOT" => Ok(controlled(&gate_matrix("X", params)?)),
        "CY" => Ok(controlled(&gate_matrix("Y", params)?)),
        "CZ" => Ok(controlled(&gate_matrix("Z", params)?)),
        "CP" | "CU1" => Ok(controlled(&gate_matrix("P", params)?)),
        "CCX" | "TOFFOLI" => Ok(controlled(&controlled(&gate_matrix("X", params)?))),
        "SWAP" => fixed(array![
            [one, zero, zero, zero],
            [zero, zero, one, zero],
            [zero, one, zero, zero],
            [zero, zero, zero, one]
        ]),
        "ISWAP" => {
            let i = c(0.0, 1.0);
            fixed(array![
                [one, zero, zero, zero],
                [zero, zero, i, zero],
                [zero, i, zero, zero],
                [zero, zero, zero, one]
            ])
        }
        "RZZ" => {
            expect_params(&upper, params, 1)?;
            let (a, b) = (phase(-params[0] / 2.0), phase(params[0] / 2.0));
            let mut m = Array2::zeros((4, 4));
            for (i, v) in [a, b, b, a].into_iter().enumerate() {
                m[[i, i]] = v;
            }
            Ok(m)
        }
        _ => Err(SimError::gate(format!("unknown gate '{name}'"))),
    }
}

/// Ordered gate sequence over a fixed register width.
#[derive(Debug, Clone, Default)]
pub struct Circuit {
    num_qubits: usize,
    gates: Vec<GateDescriptor>,
}

impl Circuit {
    pub fn new(num_qubits: usize) -> Self {
        Self {
            num_qubits,
            gates: Vec::new(),
        }
    }

    pub fn from_ops(num_qubits: usize, ops: &[GateOp]) -> Result<Self> {
        let mut circuit = Self::new(num_qubits);
        for op in ops {
            circuit.push(op.to_descriptor()?)?;
        }
        Ok(circuit)
    }

    pub fn push(&mut self, gate: GateDescriptor) -> Result<&mut Self> {
        if let Some(&qubit) = gate.targets().iter().find(|&&t| t >= self.num_qubits) {
            return Err(SimError::QubitOutOfRange {
                qubit,
                num_qubits: self.num_qubits,
            });
        }
        self.gates.push(gate);
        Ok(self)
    }

    /// Append a named gate.
    pub fn gate(&mut self, name: &str, targets: &[usize], params: &[f64]) -> Result<&mut Self> {
        let op = GateOp::new(name, targets.to_vec(), params.to_vec());
        self.push(op.to_descriptor()?)
    }

    pub fn num_qubits(&self) -> usize {
        self.num_qubits
    }

    pub fn gates(&self) -> &[GateDescriptor] {
        &self.gates
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    /// The circuit run backwards with every gate inverted.
    pub fn inverse(&self) -> Self {
        Self {
            num_qubits: self.num_qubits,
            gates: self.gates.iter().rev().map(GateDescriptor::inverse).collect(),
        }
    }
}

/// Qubit demand of a run of upcoming gates.
#[derive(Debug, Clone)]
pub struct AccessWindow {
    /// Qubits the covered gates act on
    pub working_set: BitVec,
    /// Gates `[start, start + covered)` all fit once `working_set` is primary
    pub covered: usize,
    /// Gates from `start` until each qubit is first touched inside the window
    pub first_use: Vec<Option<usize>>,
}

impl AccessWindow {
    /// Working-set qubits in the order the window first touches them
    pub fn by_first_use(&self) -> Vec<usize> {
        let mut qubits: Vec<usize> = self.working_set.iter_ones().collect();
        qubits.sort_by_key(|&q| (self.first_use[q].unwrap_or(usize::MAX), q));
        qubits
    }
}

/// The "Lookahead" logic: greedy scan over a bounded window of gates.
pub struct CircuitAnalyzer {
    num_qubits: usize,
    num_primary: usize,
    window: usize,
}

impl CircuitAnalyzer {
    pub fn new(num_qubits: usize, num_primary: usize, window: usize) -> Self {
        Self {
            num_qubits,
            num_primary,
            window: window.max(1),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Grow the working set gate by gate from `start` while it still fits in
    /// the primary tier. The gate at `start` must itself fit.
    pub fn analyze(&self, gates: &[GateDescriptor], start: usize) -> AccessWindow {
        let mut working_set = bitvec![0; self.num_qubits];
        let mut first_use = vec![None; self.num_qubits];
        let mut covered = 0;
        let mut growing = true;
        let end = gates.len().min(start.saturating_add(self.window));

        for (distance, gate) in gates[start.min(end)..end].iter().enumerate() {
            for &q in gate.targets() {
                first_use[q].get_or_insert(distance);
            }
            if !growing {
                continue;
            }
            let mut grown = working_set.clone();
            for &q in gate.targets() {
                grown.set(q, true);
            }
            if grown.count_ones() > self.num_primary && covered > 0 {
                growing = false;
                continue;
            }
            working_set = grown;
            covered += 1;
        }

        AccessWindow {
            working_set,
            covered,
            first_use,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_validation() {
        let x = gate_matrix("x", &[]).unwrap();
        assert!(GateDescriptor::new(x.clone(), vec![]).is_err());
        assert!(GateDescriptor::new(x.clone(), vec![0, 1]).is_err());
        let cx = gate_matrix("cx", &[]).unwrap();
        assert!(GateDescriptor::new(cx, vec![3, 3]).is_err());
        let skew = array![[c(1.0, 0.0), c(1.0, 0.0)], [c(0.0, 0.0), c(1.0, 0.0)]];
        assert!(GateDescriptor::new(skew, vec![0]).is_err());
        assert!(GateDescriptor::new(x, vec![2]).is_ok());
    }

    #[test]
    fn huge_target_indices_are_rejected() {
        let x = gate_matrix("x", &[]).unwrap();
        assert!(matches!(
            GateDescriptor::new(x.clone(), vec![usize::MAX]),
            Err(SimError::InvalidGate { .. })
        ));
        assert!(matches!(
            GateDescriptor::new(x.clone(), vec![1 << 40]),
            Err(SimError::InvalidGate { .. })
        ));
        let cx = gate_matrix("cx", &[]).unwrap();
        assert!(GateDescriptor::new(cx, vec![63, 0]).is_ok());
    }

    #[test]
    fn unknown_names_and_bad_params_are_rejected() {
        assert!(gate_matrix("frobnicate", &[]).is_err());
        assert!(gate_matrix("rx", &[]).is_err());
        assert!(gate_matrix("h", &[0.3]).is_err());
        assert!(gate_matrix("u", &[0.1, 0.2, 0.3]).is_ok());
    }

    #[test]
    fn library_gates_are_unitary() {
        let cases: &[(&str, &[f64])] = &[
            ("I", &[]),
            ("X", &[]),
            ("Y", &[]),
            ("Z", &[]),
            ("H", &[]),
            ("S", &[]),
            ("SDG", &[]),
            ("T", &[]),
            ("TDG", &[]),
            ("SX", &[]),
            ("RX", &[0.7]),
            ("RY", &[1.3]),
            ("RZ", &[-0.4]),
            ("P", &[2.1]),
            ("U", &[0.3, 1.1, -0.8]),
            ("CX", &[]),
            ("CY", &[]),
            ("CZ", &[]),
            ("CP", &[0.9]),
            ("SWAP", &[]),
            ("ISWAP", &[]),
            ("RZZ", &[0.5]),
            ("CCX", &[]),
        ];
        for (name, params) in cases {
            let m = gate_matrix(name, params).unwrap();
            assert!(is_unitary(&m), "{name} is not unitary");
        }
    }

    #[test]
    fn cx_uses_first_target_as_control() {
        let cx = gate_matrix("cx", &[]).unwrap();
        assert_eq!(cx[[2, 3]], c(1.0, 0.0));
        assert_eq!(cx[[3, 2]], c(1.0, 0.0));
        assert_eq!(cx[[1, 1]], c(1.0, 0.0));
    }

    #[test]
    fn inverse_composes_to_identity() {
        let u = GateOp::new("u", vec![0], vec![0.3, 1.1, -0.8])
            .to_descriptor()
            .unwrap();
        let product = u.inverse().matrix().dot(u.matrix());
        assert!((product[[0, 0]] - c(1.0, 0.0)).norm() < 1e-12);
        assert!(product[[0, 1]].norm() < 1e-12);
    }

    #[test]
    fn circuit_rejects_out_of_range_targets() {
        let mut circuit = Circuit::new(2);
        circuit.gate("h", &[1], &[]).unwrap();
        assert!(matches!(
            circuit.gate("x", &[2], &[]),
            Err(SimError::QubitOutOfRange { qubit: 2, .. })
        ));
        assert_eq!(circuit.len(), 1);
    }

    #[test]
    fn analyzer_grows_working_set_until_primary_is_full() {
        let mut circuit = Circuit::new(5);
        circuit
            .gate("h", &[4], &[])
            .unwrap()
            .gate("cx", &[4, 3], &[])
            .unwrap()
            .gate("x", &[4], &[])
            .unwrap()
            .gate("h", &[0], &[])
            .unwrap()
            .gate("x", &[3], &[])
            .unwrap();
        let analyzer = CircuitAnalyzer::new(5, 2, 8);
        let window = analyzer.analyze(circuit.gates(), 0);
        assert_eq!(window.covered, 3);
        assert_eq!(window.working_set.iter_ones().collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(window.first_use[0], Some(3));
        assert_eq!(window.first_use[1], None);
        assert_eq!(window.by_first_use(), vec![4, 3]);
    }

    #[test]
    fn analyzer_respects_window_bound() {
        let mut circuit = Circuit::new(3);
        for _ in 0..10 {
            circuit.gate("x", &[2], &[]).unwrap();
        }
        let window = CircuitAnalyzer::new(3, 2, 4).analyze(circuit.gates(), 3);
        assert_eq!(window.covered, 4);
    }
}
