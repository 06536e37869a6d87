//! Bounded pool of scoped worker threads.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Mutex, PoisonError};
use std::thread;

use derive_more::{Display, Error};

/// A job panicked instead of returning.
#[derive(Debug, Clone, Display, Error)]
#[display("worker panicked: {message}")]
pub struct JobPanic {
    message: String,
}

impl JobPanic {
    fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown cause".to_string());
        Self { message }
    }
}

/// Runs jobs on at most `size` threads.
///
/// The workers are scoped to a single [execute](Self::execute) call: they may
/// borrow from the caller and are always joined before it returns, no matter
/// how the jobs end.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    size: usize,
}

impl WorkerPool {
    /// Pool of `size` workers, at least one.
    pub fn new(size: usize) -> Self {
        Self { size: size.max(1) }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Runs all `jobs` and hands each result to `on_complete` together with
    /// the index of its job.
    ///
    /// Results arrive in completion order on the calling thread. A panicking
    /// job is reported as [JobPanic] and doesn't affect the others.
    pub fn execute<T, F>(&self, jobs: Vec<F>, mut on_complete: impl FnMut(usize, Result<T, JobPanic>))
    where
        F: FnOnce() -> T + Send,
        T: Send,
    {
        let total = jobs.len();
        if total == 0 {
            return;
        }
        let workers = self.size.min(total);
        log::debug!(target: "executor::pool", "Running {total} job(s) on {workers} worker(s)");

        let queue = Mutex::new(jobs.into_iter().enumerate().collect::<VecDeque<_>>());
        let (tx, rx) = mpsc::channel();

        thread::scope(|scope| {
            for worker in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                scope.spawn(move || loop {
                    let next = queue
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .pop_front();
                    let Some((index, job)) = next else {
                        break;
                    };

                    log::trace!(target: "executor::pool", "Worker {worker} runs job {index}");
                    let result = panic::catch_unwind(AssertUnwindSafe(job))
                        .map_err(JobPanic::from_payload);
                    if tx.send((index, result)).is_err() {
                        break;
                    }
                });
            }
            drop(tx);

            for (index, result) in rx {
                on_complete(index, result);
            }
        });
    }
}
