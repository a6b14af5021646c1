//! Block task scheduling and cooperative run control.
//!
//! The iterative trainers are data-parallel over blocks of their input:
//! each iteration fans a set of independent block tasks out, gathers
//! their results on the coordinator, reduces sequentially and fans out
//! again. [`Executor`] is the minimal seam between that structure and a
//! concrete scheduler; implementations only promise that every task runs
//! exactly once and that results come back in block-id order. The
//! execution order of the tasks themselves is unspecified.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{Result, StrataError};

/// Schedules a collection of independent block tasks.
///
/// `Send + Sync` so a single executor can be shared across partition
/// runs. The generic method keeps dispatch monomorphized.
pub trait Executor: Send + Sync {
    /// Run `task(block_id, state)` for every block, consuming the
    /// per-block state and returning the outputs **in block-id order**.
    fn map_blocks<S, T>(&self, items: Vec<S>, task: &(dyn Fn(usize, S) -> T + Sync)) -> Vec<T>
    where
        S: Send,
        T: Send;
}

/// Runs every block task on the calling thread, in order.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialExecutor;

impl Executor for SerialExecutor {
    fn map_blocks<S, T>(&self, items: Vec<S>, task: &(dyn Fn(usize, S) -> T + Sync)) -> Vec<T>
    where
        S: Send,
        T: Send,
    {
        items
            .into_iter()
            .enumerate()
            .map(|(block_id, state)| task(block_id, state))
            .collect()
    }
}

/// Runs block tasks on the rayon thread pool.
#[cfg(feature = "parallel")]
#[derive(Debug, Clone, Copy, Default)]
pub struct RayonExecutor;

#[cfg(feature = "parallel")]
impl Executor for RayonExecutor {
    fn map_blocks<S, T>(&self, items: Vec<S>, task: &(dyn Fn(usize, S) -> T + Sync)) -> Vec<T>
    where
        S: Send,
        T: Send,
    {
        use rayon::prelude::*;
        items
            .into_par_iter()
            .enumerate()
            .map(|(block_id, state)| task(block_id, state))
            .collect()
    }
}

/// Cooperative cancellation and wall-clock budget for an iterative run.
///
/// Handles are cheap to clone and share one cancellation flag. Trainers
/// call [`checkpoint`](Self::checkpoint) between iterations only, so a
/// cancelled or timed-out run always keeps the parameters committed by
/// its last completed iteration.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    cancel: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl RunControl {
    /// A control with no deadline and nothing cancelled.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// A control that times out `budget` from now.
    pub fn with_timeout(budget: Duration) -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + budget),
        }
    }

    /// A handle sharing this control's cancellation flag, with a
    /// deadline `budget` from now. An earlier existing deadline wins.
    pub fn with_budget(&self, budget: Duration) -> Self {
        let candidate = Instant::now() + budget;
        Self {
            cancel: Arc::clone(&self.cancel),
            deadline: Some(self.deadline.map_or(candidate, |d| d.min(candidate))),
        }
    }

    /// Request cancellation; observed at the next checkpoint.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Fail if the run has been cancelled or its deadline has passed.
    ///
    /// # Errors
    ///
    /// [`StrataError::Cancelled`] or [`StrataError::TimedOut`].
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(StrataError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(StrataError::TimedOut);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_executor_preserves_block_order() {
        let items: Vec<usize> = (0..8).collect();
        let out = SerialExecutor.map_blocks(items, &|block_id, x| (block_id, x * 2));
        for (i, (block_id, doubled)) in out.iter().enumerate() {
            assert_eq!(*block_id, i);
            assert_eq!(*doubled, i * 2);
        }
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn rayon_executor_preserves_block_order() {
        let items: Vec<usize> = (0..64).collect();
        let out = RayonExecutor.map_blocks(items, &|block_id, x| (block_id, x + 1));
        for (i, (block_id, incremented)) in out.iter().enumerate() {
            assert_eq!(*block_id, i);
            assert_eq!(*incremented, i + 1);
        }
    }

    #[test]
    fn fresh_control_passes_checkpoint() {
        assert!(RunControl::unbounded().checkpoint().is_ok());
    }

    #[test]
    fn cancelled_control_fails_checkpoint() {
        let control = RunControl::unbounded();
        let handle = control.clone();
        handle.cancel();
        assert!(matches!(
            control.checkpoint(),
            Err(StrataError::Cancelled)
        ));
    }

    #[test]
    fn expired_deadline_fails_checkpoint() {
        let control = RunControl::with_timeout(Duration::from_secs(0));
        assert!(matches!(control.checkpoint(), Err(StrataError::TimedOut)));
    }

    #[test]
    fn budget_derives_a_shared_cancel_flag() {
        let control = RunControl::unbounded();
        let budgeted = control.with_budget(Duration::from_secs(3600));
        assert!(budgeted.checkpoint().is_ok());
        control.cancel();
        assert!(matches!(budgeted.checkpoint(), Err(StrataError::Cancelled)));

        let expired = RunControl::unbounded().with_budget(Duration::from_secs(0));
        assert!(matches!(expired.checkpoint(), Err(StrataError::TimedOut)));
    }
}
