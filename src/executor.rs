// Bounded worker pool for outbound probes
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::debug;

/// Why a task was not accepted
#[derive(Debug, Clone, thiserror::Error)]
pub enum RejectedExecution {
    #[error("executor [{0}] is shut down")]
    Shutdown(String),

    #[error("executor [{name}] is saturated ({capacity} tasks queued or running)")]
    Saturated { name: String, capacity: usize },
}

/// Pool running at most `max_workers` tasks at once with a bounded number
/// of tasks waiting for a worker. Anything beyond that is rejected rather
/// than queued, so callers can rely on a later attempt instead.
pub struct ProbeExecutor {
    name: String,
    max_workers: usize,
    capacity: usize,
    workers: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    shutdown: AtomicBool,
    handle: Handle,
}

struct InFlightSlot(Arc<AtomicUsize>);

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ProbeExecutor {
    pub fn new(name: impl Into<String>, max_workers: usize, max_queued: usize) -> Self {
        Self::with_handle(name, max_workers, max_queued, Handle::current())
    }

    pub fn with_handle(name: impl Into<String>, max_workers: usize, max_queued: usize, handle: Handle) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            name: name.into(),
            max_workers,
            capacity: max_workers + max_queued,
            workers: Arc::new(Semaphore::new(max_workers)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            shutdown: AtomicBool::new(false),
            handle,
        }
    }

    pub fn submit<F>(&self, task: F) -> Result<(), RejectedExecution>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(RejectedExecution::Shutdown(self.name.clone()));
        }

        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= self.capacity {
                return Err(RejectedExecution::Saturated {
                    name: self.name.clone(),
                    capacity: self.capacity,
                });
            }
            match self.in_flight.compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let slot = InFlightSlot(self.in_flight.clone());
        let workers = self.workers.clone();
        let name = self.name.clone();
        self.handle.spawn(async move {
            let _slot = slot;
            let _permit = match workers.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    debug!(executor = %name, "dropping queued task, executor shut down");
                    return;
                }
            };
            task.await;
        });
        Ok(())
    }

    /// Stop accepting tasks and drop the ones still waiting for a worker.
    /// Tasks already running are left to finish.
    pub fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            self.workers.close();
            debug!(executor = %self.name, "executor shut down");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Tasks queued or running
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }
}
