//! The [WorkerPool] runs blocking jobs, never more than a fixed number at once.
//!
//! Jobs go through a tokio runtime: each one waits for a semaphore permit, then runs on the blocking pool while
//! holding it.  The pool either owns a dedicated runtime or borrows a [Handle] to one the embedder already has.
//!
//! Nothing here is global.  Dropping the pool stops it; already running jobs finish on their threads, queued ones
//! are discarded.  Use [WorkerPool::shutdown] to let queued work drain first.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::Semaphore;
use tracing::{error, warn};

use crate::ConfigError;

/// Counts jobs from submission until they are done with, so that callers can wait for the pool to go quiet.
#[derive(Debug, Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn begin(self: &Arc<Self>) -> InFlightGuard {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        InFlightGuard(self.clone())
    }

    fn current(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_idle(&self, timeout: Duration) -> bool {
        let guard = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .idle
            .wait_timeout_while(guard, timeout, |count| *count > 0)
            .unwrap_or_else(PoisonError::into_inner);
        *guard == 0
    }
}

/// Decrements on drop, so a job counts as finished however its task ends: completion, panic, or a dropped runtime.
struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count -= 1;
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

pub struct WorkerPool {
    /// Only set when the pool built its own runtime.
    runtime: Option<Runtime>,
    handle: Handle,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    in_flight: Arc<InFlight>,
    accepting: AtomicBool,
}

impl WorkerPool {
    /// Build a pool with its own runtime.  Threads are named after `name`.
    pub fn new(name: &str, max_concurrent: usize) -> Result<WorkerPool, ConfigError> {
        if max_concurrent == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }

        // The only async work is waiting for permits, so a single worker thread is plenty.
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(max_concurrent)
            .thread_name(name)
            .build()
            .map_err(ConfigError::Runtime)?;
        let handle = runtime.handle().clone();
        Ok(WorkerPool::from_parts(Some(runtime), handle, max_concurrent))
    }

    /// Build a pool which schedules onto somebody else's runtime.
    pub fn with_handle(handle: Handle, max_concurrent: usize) -> Result<WorkerPool, ConfigError> {
        if max_concurrent == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }
        Ok(WorkerPool::from_parts(None, handle, max_concurrent))
    }

    fn from_parts(runtime: Option<Runtime>, handle: Handle, max_concurrent: usize) -> WorkerPool {
        WorkerPool {
            runtime,
            handle,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            in_flight: Default::default(),
            accepting: AtomicBool::new(true),
        }
    }

    /// Queue a blocking job.  Returns false if the pool is shutting down, in which case the job is dropped.
    pub fn spawn<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.accepting.load(Ordering::Acquire) {
            warn!("worker pool is shut down; dropping job");
            return false;
        }

        let guard = self.in_flight.begin();
        let permits = self.permits.clone();
        self.handle.spawn(async move {
            let _guard = guard;
            // Closed only on shutdown.
            let _permit = match permits.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };
            if let Err(e) = tokio::task::spawn_blocking(job).await {
                if e.is_panic() {
                    error!("worker job panicked");
                }
            }
        });
        true
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Jobs submitted and not yet finished, including those still waiting for a permit.
    pub fn in_flight(&self) -> usize {
        self.in_flight.current()
    }

    /// Jobs currently holding a permit.
    pub fn running(&self) -> usize {
        self.max_concurrent - self.permits.available_permits()
    }

    /// Block until every submitted job has finished, or the timeout passes.  Returns whether the pool is idle.
    ///
    /// Must not be called from inside the pool's own runtime.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.in_flight.wait_idle(timeout)
    }

    /// Stop accepting jobs, give queued ones up to `timeout` to finish, then tear the runtime down.
    ///
    /// Returns whether everything drained in time.
    pub fn shutdown(&mut self, timeout: Duration) -> bool {
        self.accepting.store(false, Ordering::Release);
        let drained = self.in_flight.wait_idle(timeout);
        self.stop();
        drained
    }

    fn stop(&mut self) {
        self.accepting.store(false, Ordering::Release);
        self.permits.close();
        // Never blocks, so this is fine even when dropped from inside another runtime.
        if let Some(rt) = self.runtime.take() {
            rt.shutdown_background();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}
