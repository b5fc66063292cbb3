// Shared helpers for integration tests
#![allow(dead_code)]

use num_complex::Complex64;
use qp_chunk_sim::engine::kernels::GateKernel;
use qp_chunk_sim::{Circuit, Engine, EngineConfig, Parallelism};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const EPSILON: f64 = 1e-9;

/// Whole-vector simulation with every qubit in one buffer.
pub fn reference_state(circuit: &Circuit) -> Vec<Complex64> {
    let n = circuit.num_qubits();
    let mut state = vec![Complex64::new(0.0, 0.0); 1 << n];
    state[0] = Complex64::new(1.0, 0.0);
    for gate in circuit.gates() {
        let positions: Vec<usize> = gate.targets().iter().map(|&q| n - 1 - q).collect();
        GateKernel::new(gate.matrix()).apply_in_chunk(&mut state, &positions);
    }
    state
}

pub fn sequential(p: usize, l: usize) -> EngineConfig {
    EngineConfig::new(p, l).with_parallelism(Parallelism::Sequential)
}

pub fn run_engine(circuit: &Circuit, config: EngineConfig) -> Engine {
    let mut engine = Engine::new(circuit.clone(), config).unwrap();
    engine.run().unwrap();
    engine
}

pub fn assert_states_close(actual: &[Complex64], expected: &[Complex64]) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).norm() < EPSILON,
            "amplitude {i}: got {a}, expected {e}"
        );
    }
}

/// Random circuit drawing targets uniformly; `max_arity` caps gate width.
pub fn random_circuit(num_qubits: usize, gates: usize, max_arity: usize, seed: u64) -> Circuit {
    const ONE: &[(&str, usize)] = &[
        ("h", 0),
        ("x", 0),
        ("y", 0),
        ("s", 0),
        ("t", 0),
        ("sx", 0),
        ("rx", 1),
        ("ry", 1),
        ("rz", 1),
        ("u", 3),
    ];
    const TWO: &[(&str, usize)] = &[
        ("cx", 0),
        ("cz", 0),
        ("swap", 0),
        ("iswap", 0),
        ("cp", 1),
        ("rzz", 1),
    ];
    let mut rng = StdRng::seed_from_u64(seed);
    let mut circuit = Circuit::new(num_qubits);
    for _ in 0..gates {
        let arity = rng.gen_range(1..=max_arity.min(3).min(num_qubits));
        let (name, params) = match arity {
            1 => ONE[rng.gen_range(0..ONE.len())],
            2 => TWO[rng.gen_range(0..TWO.len())],
            _ => ("ccx", 0),
        };
        let mut targets = Vec::with_capacity(arity);
        while targets.len() < arity {
            let q = rng.gen_range(0..num_qubits);
            if !targets.contains(&q) {
                targets.push(q);
            }
        }
        let params: Vec<f64> = (0..params).map(|_| rng.gen_range(-3.0..3.0)).collect();
        circuit.gate(name, &targets, &params).unwrap();
    }
    circuit
}
