//! Supervision of a worker's children.
//!
//! Children spawned through a [`Catacomb`] report a fatal error to it, and
//! the parent's loop selects on [`Catacomb::failed`] to fail with them.
//! Killing the parent kills its children when their handles are stopped or
//! dropped.

use crate::worker::{Dying, WorkerHandle};
use cmr_core::{CmrError, Result};
use std::future::Future;
use tokio::sync::mpsc;

#[derive(Debug)]
pub struct Catacomb {
    fatal_tx: mpsc::UnboundedSender<CmrError>,
    fatal_rx: mpsc::UnboundedReceiver<CmrError>,
}

impl Catacomb {
    pub fn new() -> Self {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        Self { fatal_tx, fatal_rx }
    }

    /// Spawn a child whose error becomes fatal to the parent
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, work: F) -> WorkerHandle
    where
        F: FnOnce(Dying) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let fatal_tx = self.fatal_tx.clone();
        let child = name.clone();
        WorkerHandle::spawn(name, move |dying| {
            let work = work(dying);
            async move {
                let outcome = work.await;
                if let Err(err) = &outcome {
                    tracing::warn!(worker = %child, error = %err, "child worker failed");
                    let _ = fatal_tx.send(err.clone());
                }
                outcome
            }
        })
    }

    /// First fatal error reported by any child
    pub async fn failed(&mut self) -> CmrError {
        match self.fatal_rx.recv().await {
            Some(err) => err,
            // The catacomb holds a sender, so the channel never closes.
            None => std::future::pending().await,
        }
    }
}

impl Default for Catacomb {
    fn default() -> Self {
        Self::new()
    }
}
