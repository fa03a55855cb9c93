//! Explicit execution context for a training run.

use crate::{MbrlError, Result};
use rayon::{ThreadPool, ThreadPoolBuilder};

/// Owns the worker pool used for real-environment rollouts.
///
/// The pool only exists between `acquire` and `release`; work submitted
/// outside that window fails with `ContextError`.
///
/// # Example
///
/// ```ignore
/// let mut ctx = ExecutionContext::new(4, 0);
/// ctx.acquire()?;
/// let sum = ctx.install(|| (0..100).into_par_iter().sum::<i32>())?;
/// ctx.release();
/// ```
pub struct ExecutionContext {
    n_parallel: usize,
    seed: u64,
    pool: Option<ThreadPool>,
}

impl ExecutionContext {
    pub fn new(n_parallel: usize, seed: u64) -> Self {
        Self {
            n_parallel: n_parallel.max(1),
            seed,
            pool: None,
        }
    }

    pub fn n_parallel(&self) -> usize {
        self.n_parallel
    }

    pub fn is_acquired(&self) -> bool {
        self.pool.is_some()
    }

    /// Build the worker pool.
    pub fn acquire(&mut self) -> Result<()> {
        if self.pool.is_some() {
            return Err(MbrlError::ContextError(
                "execution context already acquired".to_string(),
            ));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.n_parallel)
            .thread_name(|i| format!("mbrl-worker-{}", i))
            .build()
            .map_err(|e| MbrlError::ContextError(e.to_string()))?;
        tracing::debug!(
            n_parallel = self.n_parallel,
            seed = self.seed,
            "Acquired execution context"
        );
        self.pool = Some(pool);
        Ok(())
    }

    /// Tear down the worker pool. Safe to call when not acquired.
    pub fn release(&mut self) {
        if self.pool.take().is_some() {
            tracing::debug!("Released execution context");
        }
    }

    /// Run `op` inside the worker pool.
    pub fn install<R, OP>(&self, op: OP) -> Result<R>
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        let pool = self.pool.as_ref().ok_or_else(|| {
            MbrlError::ContextError("execution context used before acquire".to_string())
        })?;
        Ok(pool.install(op))
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn test_lifecycle() {
        let mut ctx = ExecutionContext::new(2, 0);
        assert!(matches!(ctx.install(|| 1), Err(MbrlError::ContextError(_))));

        ctx.acquire().unwrap();
        assert!(ctx.acquire().is_err());
        let sum = ctx
            .install(|| (0..10).into_par_iter().sum::<i32>())
            .unwrap();
        assert_eq!(sum, 45);

        ctx.release();
        assert!(!ctx.is_acquired());
        ctx.release();
    }
}
