//! Background task lifecycle.

use std::future::Future;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Handle to control and join a background task.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn `task` on the current runtime. The task receives a stop signal and is
    /// expected to return promptly once it fires.
    pub fn spawn<F, Fut>(name: &'static str, task: F) -> Self
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, rx) = watch::channel(false);
        let join = tokio::spawn(task(StopSignal(rx)));
        info!(worker = name, "worker started");
        Self {
            name,
            shutdown,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Request graceful shutdown and wait for the task to stop.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                warn!(worker = self.name, error = %err, "worker terminated abnormally");
            }
        }
        info!(worker = self.name, "worker stopped");
    }
}

/// Receiving side of a worker's stop request.
#[derive(Debug, Clone)]
pub struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    /// Resolves once a stop was requested (or the handle was dropped).
    pub async fn stopped(&mut self) {
        while !*self.0.borrow_and_update() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn shutdown_waits_for_the_task_to_finish() {
        let cleaned_up = Arc::new(AtomicBool::new(false));
        let flag = cleaned_up.clone();

        let handle = WorkerHandle::spawn("test", move |mut stop| async move {
            stop.stopped().await;
            tokio::task::yield_now().await;
            flag.store(true, Ordering::SeqCst);
        });
        assert!(!handle.is_finished());

        handle.shutdown().await;
        assert!(cleaned_up.load(Ordering::SeqCst));
    }
}
