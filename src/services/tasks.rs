use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How often a waiting handle re-checks its cancellation flag.
const WAIT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task cancelled")]
    Cancelled,

    #[error("Worker dropped the task without a result")]
    WorkerLost,

    #[error("Failed to build worker pool: {0}")]
    PoolBuild(#[from] rayon::ThreadPoolBuildError),
}

/// Shared cancellation flag. Child tokens observe their parent's flag as well
/// as their own, so cancelling a batch cancels every task in it.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<AtomicBool>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(self.flag.clone()),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
            || self
                .parent
                .as_ref()
                .is_some_and(|p| p.load(Ordering::Relaxed))
    }

    /// Clears this token's own flag (not the parent's).
    pub fn reset(&self) {
        self.flag.store(false, Ordering::Relaxed);
    }
}

/// Bounded pool of workers with explicit submit / wait / cancel handles.
pub struct TaskQueue {
    pool: rayon::ThreadPool,
    token: CancellationToken,
}

impl TaskQueue {
    pub fn new(max_concurrent_tasks: usize, token: CancellationToken) -> Result<Self, TaskError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(max_concurrent_tasks.max(1))
            .thread_name(|i| format!("cullrs-worker-{i}"))
            .build()?;
        Ok(Self { pool, token })
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn submit<T, F>(&self, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&CancellationToken) -> T + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let token = self.token.child();
        let worker_token = token.clone();
        self.pool.spawn(move || {
            if worker_token.is_cancelled() {
                return;
            }
            let result = task(&worker_token);
            // The handle may have been dropped after cancelling
            let _ = tx.send(result);
        });
        TaskHandle { rx, token }
    }
}

pub struct TaskHandle<T> {
    rx: Receiver<T>,
    token: CancellationToken,
}

impl<T> TaskHandle<T> {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Blocks for the result. A cancelled task is abandoned: the handle stops
    /// waiting even if the worker is still running.
    pub fn wait(self) -> Result<T, TaskError> {
        loop {
            if self.token.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            match self.rx.recv_timeout(WAIT_POLL) {
                Ok(value) => return Ok(value),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(if self.token.is_cancelled() {
                        TaskError::Cancelled
                    } else {
                        TaskError::WorkerLost
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_submit_and_wait() {
        let queue = TaskQueue::new(2, CancellationToken::new()).unwrap();
        let handles: Vec<_> = (0..8).map(|i| queue.submit(move |_| i * 2)).collect();
        let results: Vec<i32> = handles.into_iter().map(|h| h.wait().unwrap()).collect();
        assert_eq!(results, vec![0, 2, 4, 6, 8, 10, 12, 14]);
        assert_eq!(queue.workers(), 2);
    }

    #[test]
    fn test_cancelled_handle_is_abandoned() {
        let queue = TaskQueue::new(1, CancellationToken::new()).unwrap();
        let handle = queue.submit(|token: &CancellationToken| {
            while !token.is_cancelled() {
                std::thread::sleep(Duration::from_millis(1));
            }
            1
        });
        handle.cancel();
        assert!(matches!(handle.wait(), Err(TaskError::Cancelled)));
    }

    #[test]
    fn test_parent_cancellation_skips_queued_tasks() {
        let parent = CancellationToken::new();
        let queue = TaskQueue::new(1, parent.clone()).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        parent.cancel();
        let handle = {
            let ran = ran.clone();
            queue.submit(move |_| {
                ran.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert!(matches!(handle.wait(), Err(TaskError::Cancelled)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_child_tokens() {
        let parent = CancellationToken::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
        parent.cancel();
        assert!(parent.child().is_cancelled());
        parent.reset();
        assert!(!parent.is_cancelled());
    }
}
