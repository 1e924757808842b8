//! Generic watcher with a uniform lifecycle.
//!
//! A [`Watcher`] runs a producer task that delivers one initial value and
//! then a further value on every change. Consumers read values with
//! [`Watcher::next`], request termination with [`Watcher::kill`], and
//! retrieve the producer's terminal error with [`Watcher::wait`] or
//! [`Watcher::stop`]. Relation-units, strings, relation-status and notify
//! watchers are all instances of this one type.

use crate::errors::{CmrError, Result};
use std::future::Future;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Consumer half of a watcher
#[derive(Debug)]
pub struct Watcher<T> {
    changes: mpsc::Receiver<T>,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<Result<()>>>,
    err: Option<CmrError>,
}

/// Producer half handed to a watcher's task
#[derive(Debug)]
pub struct WatcherSink<T> {
    tx: mpsc::Sender<T>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<T: Send + 'static> Watcher<T> {
    /// Start a watcher whose values come from `producer`
    ///
    /// The producer should send its initial snapshot first and return when
    /// [`WatcherSink::send`] reports that the watcher is stopping.
    pub fn spawn<F, Fut>(capacity: usize, producer: F) -> Self
    where
        F: FnOnce(WatcherSink<T>) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, changes) = mpsc::channel(capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(producer(WatcherSink { tx, shutdown_rx }));
        Self {
            changes,
            shutdown_tx,
            handle: Some(handle),
            err: None,
        }
    }
}

impl<T> Watcher<T> {
    /// Next value, or `None` once the producer has terminated
    pub async fn next(&mut self) -> Option<T> {
        self.changes.recv().await
    }

    /// Ask the producer to stop without waiting for it
    pub fn kill(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for the producer to terminate, returning its error if any
    pub async fn wait(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) if join_err.is_cancelled() => Ok(()),
                Err(join_err) => Err(CmrError::internal(format!("watcher panicked: {join_err}"))),
            };
            if let Err(err) = outcome {
                self.err = Some(err);
            }
        }
        match &self.err {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Kill and wait
    pub async fn stop(mut self) -> Result<()> {
        self.kill();
        self.wait().await
    }

    /// Terminal error, available once [`Watcher::wait`] has returned
    pub fn err(&self) -> Option<&CmrError> {
        self.err.as_ref()
    }
}

impl<T> Drop for Watcher<T> {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl<T> WatcherSink<T> {
    /// Deliver a value
    ///
    /// Returns `false` if the watcher is stopping or its consumer is gone,
    /// in which case the producer should return.
    pub async fn send(&mut self, value: T) -> bool {
        if self.is_dying() {
            return false;
        }
        tokio::select! {
            sent = self.tx.send(value) => sent.is_ok(),
            _ = self.shutdown_rx.changed() => false,
        }
    }

    pub fn is_dying(&self) -> bool {
        *self.shutdown_rx.borrow() || self.tx.is_closed()
    }

    /// Resolves once the watcher has been asked to stop
    pub async fn dying(&mut self) {
        while !self.is_dying() {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = self.tx.closed() => return,
            }
        }
    }
}
