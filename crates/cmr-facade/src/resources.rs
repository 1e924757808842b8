//! Server-side registry of watchers handed out by the facades.
//!
//! A watch call registers its watcher here and returns the id; callers then
//! poll `next` with that id until they stop it. Stopping a watcher wakes any
//! `next` call pending on it.

use cmr_core::params::{RelationStatusChange, RelationUnitsChange, WatchResult};
use cmr_core::{CmrError, Result, Watcher};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

type Shared<T> = Arc<async_lock::Mutex<Watcher<T>>>;

/// A registered watcher of one of the supported kinds
#[derive(Debug, Clone)]
pub enum Resource {
    RelationUnits(Shared<RelationUnitsChange>),
    Strings(Shared<Vec<String>>),
    RelationStatus(Shared<Vec<RelationStatusChange>>),
}

/// Change types that can be served through the registry
pub trait ResourceKind: Sized + Send + 'static {
    const KIND: &'static str;

    fn into_resource(watcher: Watcher<Self>) -> Resource;

    fn from_resource(resource: &Resource) -> Option<Shared<Self>>;
}

impl ResourceKind for RelationUnitsChange {
    const KIND: &'static str = "relation units";

    fn into_resource(watcher: Watcher<Self>) -> Resource {
        Resource::RelationUnits(Arc::new(async_lock::Mutex::new(watcher)))
    }

    fn from_resource(resource: &Resource) -> Option<Shared<Self>> {
        match resource {
            Resource::RelationUnits(watcher) => Some(watcher.clone()),
            _ => None,
        }
    }
}

impl ResourceKind for Vec<String> {
    const KIND: &'static str = "strings";

    fn into_resource(watcher: Watcher<Self>) -> Resource {
        Resource::Strings(Arc::new(async_lock::Mutex::new(watcher)))
    }

    fn from_resource(resource: &Resource) -> Option<Shared<Self>> {
        match resource {
            Resource::Strings(watcher) => Some(watcher.clone()),
            _ => None,
        }
    }
}

impl ResourceKind for Vec<RelationStatusChange> {
    const KIND: &'static str = "relation status";

    fn into_resource(watcher: Watcher<Self>) -> Resource {
        Resource::RelationStatus(Arc::new(async_lock::Mutex::new(watcher)))
    }

    fn from_resource(resource: &Resource) -> Option<Shared<Self>> {
        match resource {
            Resource::RelationStatus(watcher) => Some(watcher.clone()),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct Entry {
    resource: Resource,
    stop_tx: watch::Sender<bool>,
}

/// Watchers registered by facade calls, keyed by id
#[derive(Debug, Default)]
pub struct Resources {
    next_id: AtomicU64,
    entries: Mutex<HashMap<String, Entry>>,
}

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `watcher`, returning its id
    pub fn register<T: ResourceKind>(&self, watcher: Watcher<T>) -> String {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (stop_tx, _) = watch::channel(false);
        self.entries.lock().insert(
            id.clone(),
            Entry {
                resource: T::into_resource(watcher),
                stop_tx,
            },
        );
        tracing::debug!(watcher_id = %id, kind = T::KIND, "registered watcher");
        id
    }

    /// Take the initial snapshot of `watcher` and register it
    pub async fn serve<T: ResourceKind>(&self, mut watcher: Watcher<T>) -> Result<WatchResult<T>> {
        match watcher.next().await {
            Some(changes) => Ok(WatchResult {
                watcher_id: self.register(watcher),
                changes,
            }),
            None => {
                watcher.wait().await?;
                Err(CmrError::internal(format!(
                    "{} watcher closed before its initial event",
                    T::KIND
                )))
            }
        }
    }

    /// Number of live watchers
    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Wait for the next change of watcher `id`
    ///
    /// `NotFound` once the watcher is unknown or has been stopped; a watcher
    /// that failed reports its terminal error.
    pub async fn next<T: ResourceKind>(&self, id: &str) -> Result<T> {
        let (watcher, mut stopped) = {
            let entries = self.entries.lock();
            let entry = entries
                .get(id)
                .ok_or_else(|| CmrError::not_found(format!("watcher {id:?}")))?;
            let watcher = T::from_resource(&entry.resource).ok_or_else(|| {
                CmrError::not_valid(format!("watcher {id:?} as {} watcher", T::KIND))
            })?;
            (watcher, entry.stop_tx.subscribe())
        };

        let next = async {
            let mut watcher = watcher.lock().await;
            match watcher.next().await {
                Some(change) => Ok(change),
                None => {
                    watcher.wait().await?;
                    Err(CmrError::not_found(format!("watcher {id:?}")))
                }
            }
        };
        tokio::select! {
            result = next => result,
            _ = stopped.changed() => Err(CmrError::not_found(format!("watcher {id:?}"))),
        }
    }

    /// Stop and forget watcher `id`, returning its terminal error if any
    pub async fn stop(&self, id: &str) -> Result<()> {
        let entry = self
            .entries
            .lock()
            .remove(id)
            .ok_or_else(|| CmrError::not_found(format!("watcher {id:?}")))?;
        let _ = entry.stop_tx.send(true);
        tracing::debug!(watcher_id = %id, "stopping watcher");
        match entry.resource {
            Resource::RelationUnits(watcher) => stop_shared(&watcher).await,
            Resource::Strings(watcher) => stop_shared(&watcher).await,
            Resource::RelationStatus(watcher) => stop_shared(&watcher).await,
        }
    }

    /// Stop every registered watcher
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.entries.lock().keys().cloned().collect();
        for id in ids {
            if let Err(err) = self.stop(&id).await {
                tracing::debug!(watcher_id = %id, error = %err, "watcher stopped with error");
            }
        }
    }
}

async fn stop_shared<T>(watcher: &Shared<T>) -> Result<()> {
    let mut watcher = watcher.lock().await;
    watcher.kill();
    watcher.wait().await
}
