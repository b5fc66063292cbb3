// Work distribution over disjoint chunk partitions
use rayon::prelude::*;
use std::ops::Add;

use crate::engine::config::Parallelism;
use crate::engine::error::Result;

/// Runs a task once per partition index, either inline or on a bounded
/// rayon pool. Callers guarantee partitions touch disjoint chunks.
pub struct WorkPool {
    pool: Option<rayon::ThreadPool>,
}

impl WorkPool {
    pub fn new(parallelism: Parallelism) -> Result<Self> {
        let pool = match parallelism {
            Parallelism::Sequential => None,
            Parallelism::Threads(threads) => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("qp-chunk-{i}"))
                    .build()?,
            ),
        };
        Ok(Self { pool })
    }

    pub fn sequential() -> Self {
        Self { pool: None }
    }

    pub fn is_parallel(&self) -> bool {
        self.pool.is_some()
    }

    pub fn threads(&self) -> usize {
        self.pool
            .as_ref()
            .map_or(1, rayon::ThreadPool::current_num_threads)
    }

    /// Run `task` for every partition; stops at the first error.
    pub fn for_each<F>(&self, partitions: usize, task: F) -> Result<()>
    where
        F: Fn(usize) -> Result<()> + Send + Sync,
    {
        match &self.pool {
            None => (0..partitions).try_for_each(task),
            Some(pool) => pool.install(|| (0..partitions).into_par_iter().try_for_each(&task)),
        }
    }

    /// Run `task` for every partition and add up what they return.
    pub fn sum<T, F>(&self, partitions: usize, task: F) -> Result<T>
    where
        T: Default + Add<Output = T> + Send,
        F: Fn(usize) -> Result<T> + Send + Sync,
    {
        match &self.pool {
            None => (0..partitions).try_fold(T::default(), |acc, i| -> Result<T> {
                Ok(acc + task(i)?)
            }),
            Some(pool) => pool.install(|| {
                (0..partitions)
                    .into_par_iter()
                    .map(&task)
                    .try_reduce(T::default, |a, b| Ok(a + b))
            }),
        }
    }

    /// Run `task` for every partition, keeping results in partition order.
    pub fn collect<T, F>(&self, partitions: usize, task: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(usize) -> Result<T> + Send + Sync,
    {
        match &self.pool {
            None => (0..partitions).map(task).collect(),
            Some(pool) => pool.install(|| (0..partitions).into_par_iter().map(&task).collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::error::SimError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn sequential_and_threaded_agree() {
        let seq = WorkPool::sequential();
        let par = WorkPool::new(Parallelism::Threads(3)).unwrap();
        assert!(!seq.is_parallel());
        assert_eq!(par.threads(), 3);
        let square = |i: usize| -> Result<usize> { Ok(i * i) };
        assert_eq!(seq.sum(100, square).unwrap(), par.sum(100, square).unwrap());
        assert_eq!(
            seq.collect(10, square).unwrap(),
            par.collect(10, square).unwrap()
        );
    }

    #[test]
    fn every_partition_runs_once() {
        let pool = WorkPool::new(Parallelism::Threads(4)).unwrap();
        let hits = AtomicUsize::new(0);
        pool.for_each(64, |_| {
            hits.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
        .unwrap();
        assert_eq!(hits.into_inner(), 64);
    }

    #[test]
    fn first_error_is_returned() {
        let pool = WorkPool::sequential();
        let err = pool
            .for_each(8, |i| {
                if i == 5 {
                    Err(SimError::ChunkBusy { chunk: i })
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert!(matches!(err, SimError::ChunkBusy { chunk: 5 }));
    }
}
