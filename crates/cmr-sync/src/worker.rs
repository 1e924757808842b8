//! Handle to a long-running worker task.

use cmr_core::{CmrError, Result, Watcher};
use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Stop signal observed by a worker's loop
#[derive(Debug, Clone)]
pub struct Dying {
    rx: watch::Receiver<bool>,
}

impl Dying {
    pub fn is_dying(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the worker has been killed or its handle dropped
    pub async fn wait(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// A spawned worker that can be killed and waited on
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<Result<()>>>,
    err: Option<CmrError>,
}

impl WorkerHandle {
    /// Spawn `work`, which should return promptly once [`Dying`] resolves
    pub fn spawn<F, Fut>(name: impl Into<String>, work: F) -> Self
    where
        F: FnOnce(Dying) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let (shutdown_tx, rx) = watch::channel(false);
        let handle = tokio::spawn(work(Dying { rx }));
        tracing::debug!(worker = %name, "worker started");
        Self {
            name,
            shutdown_tx,
            handle: Some(handle),
            err: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kill(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for the worker to finish, returning its error if it failed
    pub async fn wait(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) if join_err.is_cancelled() => Ok(()),
                Err(join_err) => Err(CmrError::internal(format!(
                    "worker {} panicked: {join_err}",
                    self.name
                ))),
            };
            if let Err(err) = outcome {
                self.err = Some(err);
            }
            tracing::debug!(worker = %self.name, "worker stopped");
        }
        match &self.err {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Kill the worker and wait for it
    pub async fn stop(mut self) -> Result<()> {
        self.kill();
        self.wait().await
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Error to fail with once an upstream watcher has closed
pub(crate) async fn closed_error<T>(watcher: &mut Watcher<T>, kind: &str) -> CmrError {
    match watcher.wait().await {
        Err(err) => err,
        Ok(()) => CmrError::internal(format!("{kind} watcher closed")),
    }
}
