// Delayed task execution on the tokio runtime
use std::time::Duration;
use futures::future::BoxFuture;
use tokio::runtime::Handle;

/// Runs tasks now or after a delay. Discovery never owns timers itself;
/// it hands its waves and deadlines to whatever implements this.
pub trait Scheduler: Send + Sync {
    /// Run a task as soon as possible on a generic worker
    fn execute(&self, task: BoxFuture<'static, ()>);

    /// Run a task once `delay` has elapsed
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>);
}

/// Scheduler backed by tokio tasks and timers
#[derive(Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Bind to the runtime we are currently running on
    pub fn current() -> Self {
        Self {
            handle: Handle::current(),
        }
    }

    pub fn with_handle(handle: Handle) -> Self {
        Self { handle }
    }
}

impl Scheduler for TokioScheduler {
    fn execute(&self, task: BoxFuture<'static, ()>) {
        self.handle.spawn(task);
    }

    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use tokio::sync::oneshot;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_schedule_runs_after_delay() {
        let scheduler = TokioScheduler::current();
        let started = Instant::now();
        let (tx, rx) = oneshot::channel();

        scheduler.schedule(
            Duration::from_secs(2),
            async move {
                let _ = tx.send(Instant::now());
            }
            .boxed(),
        );

        let fired = rx.await.unwrap();
        assert!(fired.duration_since(started) >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_execute_runs_immediately() {
        let scheduler = TokioScheduler::current();
        let (tx, rx) = oneshot::channel();
        scheduler.execute(async move {
            let _ = tx.send(7u32);
        }
        .boxed());
        assert_eq!(rx.await.unwrap(), 7);
    }
}
