// Controller
use bitvec::prelude::*;
use log::{debug, info, trace, warn};
use ndarray::Array1;
use num_complex::Complex64;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::engine::circuit::{Circuit, CircuitAnalyzer, GateDescriptor};
use crate::engine::config::EngineConfig;
use crate::engine::error::{Result, SimError};
use crate::engine::kernels::{insert_zero_bits, pattern_bits, GateKernel};
use crate::engine::memory::{release_all, ChunkStore};
use crate::engine::observable::Observable;
use crate::engine::partition::{AmplitudeIndexer, QubitPartition};
use crate::engine::pool::WorkPool;
use crate::engine::reorder::{ReorderEngine, ReorderStats};
use crate::engine::results::StateReader;

/// Where the scheduler is in its per-gate cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// No gate in flight
    Idle,
    /// Checking the next gate's target roles
    Resolving,
    /// Promoting local targets
    Reordering,
    /// Kernel running over every chunk group
    Executing,
    /// Gate sequence exhausted
    Done,
}

/// Cross-thread request to stop a run at the next gate boundary.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Allow a stopped engine to resume.
    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Summary of the work done so far.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunReport {
    pub gates_applied: usize,
    pub reorder: ReorderStats,
    /// Squared norm after the last applied gate
    pub final_norm: f64,
    pub elapsed: Duration,
}

/// Walks the gate sequence: resolve roles, reorder if needed, execute.
///
/// When a gate has local targets the scheduler looks `lookahead_window`
/// gates ahead and promotes the whole prefix working set in one batched
/// pass. This greedy batching is a heuristic; no global optimum is sought.
pub struct GateScheduler {
    circuit: Circuit,
    cursor: usize,
    state: SchedulerState,
    analyzer: CircuitAnalyzer,
    reorder: ReorderEngine,
    norm_tolerance: Option<f64>,
    final_norm: f64,
    elapsed: Duration,
    abort: AbortHandle,
}

impl GateScheduler {
    pub fn new(circuit: Circuit, config: &EngineConfig) -> Result<Self> {
        let num_qubits = config.num_qubits();
        if circuit.num_qubits() != num_qubits {
            return Err(SimError::partition(format!(
                "circuit has {} qubits but {} primary + {} local = {num_qubits}",
                circuit.num_qubits(),
                config.num_primary,
                config.num_local
            )));
        }
        let state = if circuit.is_empty() {
            SchedulerState::Done
        } else {
            SchedulerState::Idle
        };
        Ok(Self {
            analyzer: CircuitAnalyzer::new(num_qubits, config.num_primary, config.lookahead_window),
            reorder: ReorderEngine::new(num_qubits, config.max_batch_swaps),
            circuit,
            cursor: 0,
            state,
            norm_tolerance: config.norm_tolerance,
            final_norm: 1.0,
            elapsed: Duration::ZERO,
            abort: AbortHandle::default(),
        })
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Index of the next gate to run
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn circuit(&self) -> &Circuit {
        &self.circuit
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn report(&self) -> RunReport {
        RunReport {
            gates_applied: self.cursor,
            reorder: self.reorder.stats(),
            final_norm: self.final_norm,
            elapsed: self.elapsed,
        }
    }

    fn transition(&mut self, next: SchedulerState) {
        trace!(
            target: "qp_chunk_sim::controller",
            "gate {}: {:?} -> {:?}",
            self.cursor,
            self.state,
            next
        );
        self.state = next;
    }

    /// Run one gate. Returns its position, or `None` once the sequence is done.
    pub fn step(
        &mut self,
        store: &ChunkStore,
        partition: &mut QubitPartition,
        indexer: &mut AmplitudeIndexer,
        pool: &WorkPool,
    ) -> Result<Option<usize>> {
        if self.cursor >= self.circuit.len() {
            self.state = SchedulerState::Done;
            return Ok(None);
        }
        if self.abort.is_aborted() {
            return Err(SimError::Aborted {
                completed: self.cursor,
            });
        }
        let started = Instant::now();
        let outcome = self.advance(store, partition, pool);
        indexer.refresh(partition);
        self.elapsed += started.elapsed();
        match outcome {
            Ok(position) => {
                let next = if self.cursor == self.circuit.len() {
                    SchedulerState::Done
                } else {
                    SchedulerState::Idle
                };
                self.transition(next);
                Ok(Some(position))
            }
            Err(err) => {
                self.transition(SchedulerState::Idle);
                Err(err)
            }
        }
    }

    fn advance(
        &mut self,
        store: &ChunkStore,
        partition: &mut QubitPartition,
        pool: &WorkPool,
    ) -> Result<usize> {
        let position = self.cursor;
        self.transition(SchedulerState::Resolving);
        let gate = &self.circuit.gates()[position];
        if gate.arity() > partition.num_primary() {
            return Err(SimError::UnsupportedGateArity {
                position,
                arity: gate.arity(),
                num_primary: partition.num_primary(),
            });
        }

        if gate.targets().iter().any(|&q| !partition.is_primary(q)) {
            self.state = SchedulerState::Reordering;
            let window = self.analyzer.analyze(self.circuit.gates(), position);
            let swaps = self
                .reorder
                .promote_window(store, partition, pool, &window)?;
            debug!(
                target: "qp_chunk_sim::controller",
                "gate {}: {} swaps cover the next {} gates",
                position,
                swaps,
                window.covered
            );
        }

        self.state = SchedulerState::Executing;
        let gate = &self.circuit.gates()[position];
        let norm = execute_gate(gate, store, partition, pool)?;
        self.reorder.touch(gate.targets());
        self.cursor += 1;
        self.final_norm = norm;

        if let Some(tolerance) = self.norm_tolerance {
            if (norm - 1.0).abs() > tolerance {
                return Err(SimError::NumericInstability {
                    position,
                    norm,
                    tolerance,
                });
            }
        }
        Ok(position)
    }
}

/// Apply one gate whose targets are all primary. Chunk groups that differ
/// only in the targets' primary positions are disjoint work partitions.
///
/// If any group fails, the groups that already ran get the inverse gate, so
/// the store is left as it was before this gate.
fn execute_gate(
    gate: &GateDescriptor,
    store: &ChunkStore,
    partition: &QubitPartition,
    pool: &WorkPool,
) -> Result<f64> {
    let positions = gate
        .targets()
        .iter()
        .map(|&q| partition.role_of(q).map(|slot| slot.position))
        .collect::<Result<Vec<_>>>()?;
    let groups = store.total_chunks() >> positions.len();
    let kernel = GateKernel::new(gate.matrix());
    let parallel = pool.is_parallel();
    let finished = Mutex::new(bitvec![0; groups]);

    let outcome = pool.sum(groups, |group| {
        let norm = apply_to_group(&kernel, group, &positions, store, parallel)?;
        finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set(group, true);
        Ok(norm)
    });
    let err = match outcome {
        Ok(norm) => return Ok(norm),
        Err(err) => err,
    };

    let finished: Vec<usize> = finished
        .into_inner()
        .unwrap_or_else(PoisonError::into_inner)
        .iter_ones()
        .collect();
    let undo = GateKernel::new(gate.inverse().matrix());
    let rollback = pool.for_each(finished.len(), |i| {
        apply_to_group(&undo, finished[i], &positions, store, parallel).map(|_| ())
    });
    match rollback {
        Ok(()) => debug!(
            target: "qp_chunk_sim::controller",
            "Rolled back {} of {} chunk groups after: {}",
            finished.len(),
            groups,
            err
        ),
        Err(undo_err) => warn!(
            target: "qp_chunk_sim::controller",
            "Rollback after '{}' failed, store is inconsistent: {}",
            err,
            undo_err
        ),
    }
    Err(err)
}

/// Run `kernel` over one group of `2^k` chunks. Returns the group's squared norm.
fn apply_to_group(
    kernel: &GateKernel,
    group: usize,
    positions: &[usize],
    store: &ChunkStore,
    parallel: bool,
) -> Result<f64> {
    let mut sorted = positions.to_vec();
    sorted.sort_unstable();
    let base = insert_zero_bits(group, &sorted);
    let ids: Vec<usize> = (0..1usize << positions.len())
        .map(|m| base | pattern_bits(m, positions))
        .collect();
    let mut guards = store.acquire_group(&ids)?;
    let norm = {
        let mut views: Vec<&mut [Complex64]> = guards.iter_mut().map(|g| &mut **g).collect();
        kernel.apply_grouped(&mut views, parallel)
    };
    release_all(guards)?;
    Ok(norm)
}

/// One simulation run: chunk store, role assignment, and scheduler.
pub struct Engine {
    config: EngineConfig,
    store: ChunkStore,
    partition: QubitPartition,
    indexer: AmplitudeIndexer,
    pool: WorkPool,
    scheduler: GateScheduler,
}

impl Engine {
    /// Validate sizing and allocate the backing medium. Fails before any
    /// amplitude is written if either step fails.
    pub fn new(circuit: Circuit, config: EngineConfig) -> Result<Self> {
        let partition = QubitPartition::new(config.num_qubits(), config.num_primary, config.num_local)?;
        let scheduler = GateScheduler::new(circuit, &config)?;
        let store = ChunkStore::open(&config)?;
        let pool = WorkPool::new(config.parallelism)?;
        info!(
            target: "qp_chunk_sim::controller",
            "Initialized {} qubits ({} primary, {} local) on {}: {} chunks x {} amplitudes, {} worker(s)",
            config.num_qubits(),
            config.num_primary,
            config.num_local,
            store.medium(),
            store.total_chunks(),
            store.chunk_len(),
            pool.threads()
        );
        Ok(Self {
            indexer: AmplitudeIndexer::new(&partition),
            config,
            store,
            partition,
            pool,
            scheduler,
        })
    }

    /// Drive the gate sequence to completion.
    pub fn run(&mut self) -> Result<RunReport> {
        info!(
            target: "qp_chunk_sim::controller",
            "Running {} gates from position {}",
            self.scheduler.circuit().len(),
            self.scheduler.cursor()
        );
        while self.step()?.is_some() {}
        let report = self.report();
        info!(
            target: "qp_chunk_sim::controller",
            "Applied {} gates with {} swaps in {} passes ({} amplitudes moved), norm {:.12}",
            report.gates_applied,
            report.reorder.swaps,
            report.reorder.passes,
            report.reorder.amplitudes_moved,
            report.final_norm
        );
        Ok(report)
    }

    /// Apply the next gate; `None` once every gate has run.
    pub fn step(&mut self) -> Result<Option<usize>> {
        self.scheduler.step(
            &self.store,
            &mut self.partition,
            &mut self.indexer,
            &self.pool,
        )
    }

    pub fn state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn report(&self) -> RunReport {
        self.scheduler.report()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.scheduler.abort_handle()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn partition(&self) -> &QubitPartition {
        &self.partition
    }

    pub fn indexer(&self) -> &AmplitudeIndexer {
        &self.indexer
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn reader(&self) -> StateReader<'_> {
        StateReader::new(&self.store, &self.indexer, &self.pool)
    }

    pub fn amplitude(&self, global: usize) -> Result<Complex64> {
        self.reader().amplitude(global)
    }

    pub fn to_state_vector(&self) -> Result<Array1<Complex64>> {
        self.reader()
            .to_state_vector(self.config.max_materialize_bytes)
    }

    pub fn sample<R: Rng + ?Sized>(&self, shots: usize, rng: &mut R) -> Result<BTreeMap<usize, usize>> {
        self.reader().sample(shots, rng)
    }

    pub fn expectation(&self, observable: &Observable) -> Result<f64> {
        self.reader().expectation(observable)
    }
}

/// Outcome of a run moved onto tokio's blocking pool.
pub struct DetachedRun {
    pub engine: Engine,
    pub outcome: Result<RunReport>,
}

/// Run `engine` without blocking the async executor. The engine comes back
/// with the outcome so a failed or aborted run can still be inspected.
pub async fn run_detached(mut engine: Engine) -> Result<DetachedRun> {
    tokio::task::spawn_blocking(move || {
        let outcome = engine.run();
        DetachedRun { engine, outcome }
    })
    .await
    .map_err(|e| SimError::WorkerPool(format!("detached run panicked or was cancelled: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::{AcquirePolicy, Parallelism};

    fn engine(circuit: Circuit, p: usize, l: usize) -> Engine {
        let config = EngineConfig::new(p, l).with_parallelism(Parallelism::Sequential);
        Engine::new(circuit, config).unwrap()
    }

    #[test]
    fn empty_circuit_is_done_immediately() {
        let mut e = engine(Circuit::new(3), 2, 1);
        assert_eq!(e.state(), SchedulerState::Done);
        let report = e.run().unwrap();
        assert_eq!(report.gates_applied, 0);
        assert_eq!(e.amplitude(0).unwrap(), Complex64::new(1.0, 0.0));
    }

    #[test]
    fn circuit_width_must_match_partition() {
        let err = Engine::new(Circuit::new(4), EngineConfig::new(2, 1)).err().unwrap();
        assert!(matches!(err, SimError::InvalidPartition { .. }));
    }

    #[test]
    fn step_walks_the_state_machine() {
        let mut circuit = Circuit::new(3);
        circuit.gate("x", &[0], &[]).unwrap().gate("x", &[2], &[]).unwrap();
        let mut e = engine(circuit, 2, 1);
        assert_eq!(e.state(), SchedulerState::Idle);
        assert_eq!(e.step().unwrap(), Some(0));
        assert_eq!(e.state(), SchedulerState::Idle);
        assert_eq!(e.report().reorder.swaps, 0);
        assert_eq!(e.step().unwrap(), Some(1));
        assert_eq!(e.state(), SchedulerState::Done);
        assert_eq!(e.report().reorder.swaps, 1);
        assert_eq!(e.step().unwrap(), None);
        assert_eq!(e.amplitude(0b101).unwrap(), Complex64::new(1.0, 0.0));
    }

    #[test]
    fn abort_stops_between_gates() {
        let mut circuit = Circuit::new(2);
        circuit.gate("h", &[0], &[]).unwrap().gate("h", &[0], &[]).unwrap();
        let mut e = engine(circuit, 1, 1);
        e.step().unwrap();
        let handle = e.abort_handle();
        handle.abort();
        assert!(matches!(e.run(), Err(SimError::Aborted { completed: 1 })));
        assert_eq!(e.report().gates_applied, 1);
        let p = e.reader().chunk_probabilities().unwrap();
        assert!((p[0] - 0.5).abs() < 1e-12);
        handle.clear();
        assert_eq!(e.run().unwrap().gates_applied, 2);
    }

    #[test]
    fn failed_gate_leaves_the_store_untouched() {
        let config = EngineConfig::new(2, 1)
            .with_parallelism(Parallelism::Sequential)
            .with_acquire_policy(AcquirePolicy::NonBlocking);
        let mut circuit = Circuit::new(3);
        circuit.gate("x", &[0], &[]).unwrap();
        let mut scheduler = GateScheduler::new(circuit, &config).unwrap();
        let store = ChunkStore::open(&config).unwrap();
        let mut partition = QubitPartition::new(3, 2, 1).unwrap();
        let mut indexer = AmplitudeIndexer::new(&partition);
        let pool = WorkPool::sequential();

        // Group {0, 2} runs first, group {1, 3} hits the held chunk
        let held = store.acquire(3).unwrap();
        let err = scheduler
            .step(&store, &mut partition, &mut indexer, &pool)
            .unwrap_err();
        assert!(matches!(err, SimError::ChunkBusy { chunk: 3 }));
        assert_eq!(scheduler.cursor(), 0);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        drop(held);

        let amp = |chunk: usize| {
            let guard = store.acquire(chunk).unwrap();
            let value = guard[0];
            value
        };
        assert_eq!(amp(0), Complex64::new(1.0, 0.0));
        assert_eq!(amp(2), Complex64::new(0.0, 0.0));

        // Resuming applies the gate exactly once
        assert_eq!(
            scheduler
                .step(&store, &mut partition, &mut indexer, &pool)
                .unwrap(),
            Some(0)
        );
        assert_eq!(amp(0), Complex64::new(0.0, 0.0));
        assert_eq!(amp(2), Complex64::new(1.0, 0.0));
    }

    #[test]
    fn norm_drift_is_reported() {
        let mut circuit = Circuit::new(2);
        circuit.gate("h", &[0], &[]).unwrap();
        let config = EngineConfig::new(1, 1)
            .with_parallelism(Parallelism::Sequential)
            .with_norm_tolerance(1e-9);
        let mut e = Engine::new(circuit, config).unwrap();
        // Corrupt the state behind the scheduler's back.
        {
            let mut guard = e.store().acquire(1).unwrap();
            guard[0] = Complex64::new(0.5, 0.0);
        }
        assert!(matches!(
            e.run(),
            Err(SimError::NumericInstability { position: 0, .. })
        ));
    }
}
