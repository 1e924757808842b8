//! Top-level worker running one [`RemoteApplicationWorker`] per remote application.

use crate::application_worker::RemoteApplicationWorker;
use crate::catacomb::Catacomb;
use crate::remote::{LocalModelFacade, RemoteModelConnector};
use crate::worker::{closed_error, Dying, WorkerHandle};
use cmr_core::{Result, SyncConfig};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct RemoteRelationsWorker {
    local: Arc<dyn LocalModelFacade>,
    connector: Arc<dyn RemoteModelConnector>,
    config: SyncConfig,
}

impl RemoteRelationsWorker {
    pub fn new(
        local: Arc<dyn LocalModelFacade>,
        connector: Arc<dyn RemoteModelConnector>,
        config: SyncConfig,
    ) -> Self {
        Self {
            local,
            connector,
            config,
        }
    }

    /// Spawn the worker
    pub fn start(self) -> WorkerHandle {
        WorkerHandle::spawn("remote-relations", |dying| self.run(dying))
    }

    pub async fn run(self, mut dying: Dying) -> Result<()> {
        let mut watcher = self.local.watch_remote_applications().await?;
        let mut catacomb = Catacomb::new();
        let mut workers = BTreeMap::new();
        let outcome = loop {
            tokio::select! {
                _ = dying.wait() => break Ok(()),
                err = catacomb.failed() => break Err(err),
                names = watcher.next() => {
                    let Some(names) = names else {
                        break Err(closed_error(&mut watcher, "remote applications").await);
                    };
                    let changed = self.applications_changed(names, &catacomb, &mut workers);
                    if let Err(err) = changed.await {
                        break Err(err);
                    }
                }
            }
        };
        for (name, worker) in workers {
            stop_application_worker(&name, worker).await;
        }
        outcome
    }

    async fn applications_changed(
        &self,
        names: Vec<String>,
        catacomb: &Catacomb,
        workers: &mut BTreeMap<String, WorkerHandle>,
    ) -> Result<()> {
        for name in names {
            let application = match self.local.remote_application(&name).await {
                Ok(application) => Some(application),
                Err(err) if err.is_not_found() => None,
                Err(err) => return Err(err),
            };
            match application {
                Some(application) if application.life.is_alive() => {
                    if workers.contains_key(&name) {
                        continue;
                    }
                    let worker = RemoteApplicationWorker::new(
                        application,
                        self.local.clone(),
                        self.connector.clone(),
                        &self.config,
                    );
                    let handle = catacomb.spawn(format!("remote application {name}"), |dying| {
                        worker.run(dying)
                    });
                    workers.insert(name, handle);
                }
                _ => {
                    if let Some(worker) = workers.remove(&name) {
                        stop_application_worker(&name, worker).await;
                    }
                }
            }
        }
        Ok(())
    }
}

async fn stop_application_worker(name: &str, worker: WorkerHandle) {
    tracing::debug!(application = %name, "stopping remote application worker");
    if let Err(err) = worker.stop().await {
        tracing::warn!(application = %name, error = %err, "remote application worker stopped with error");
    }
}
