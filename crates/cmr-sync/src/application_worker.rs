//! Worker synchronizing the relations of one remote application.
//!
//! On the consuming side each new relation is registered with the offering
//! model, after which four children keep it in sync: local scope changes are
//! published to the offering model, the offering model's scope and life
//! changes are consumed locally, and local egress addresses are published as
//! the offering side's ingress networks. On the offering side the proxy was
//! registered by the consumer, so the worker only tracks the tokens involved.

use crate::catacomb::Catacomb;
use crate::egress::EgressAddressWorker;
use crate::relation_status::RelationStatusWorker;
use crate::relation_units::{LocalSettings, RelationUnitsWorker, RemoteSettings};
use crate::remote::{LocalModelFacade, RemoteModelConnector, RemoteModelFacade};
use crate::worker::{closed_error, Dying, WorkerHandle};
use cmr_core::params::{
    Credential, RegisterRemoteRelationArg, RemoteApplicationInfo, RemoteEndpoint, RemoteEntityArg,
    RemoteRelation, RemoteRelationChangeEvent,
};
use cmr_core::{CmrError, Life, RemoteEntityId, Result, SyncConfig, Tag};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

type ChangeSender = mpsc::Sender<RemoteRelationChangeEvent>;

/// A relation being kept in sync
#[derive(Debug)]
enum TrackedRelation {
    /// Registered by a consuming model against one of our offers
    Offered { relation_token: Option<String> },
    /// Registered by this worker with the offering model
    Consumed(ConsumedRelation),
}

#[derive(Debug)]
struct ConsumedRelation {
    relation_id: RemoteEntityId,
    application_id: RemoteEntityId,
    credential: Credential,
    workers: Vec<WorkerHandle>,
}

pub struct RemoteApplicationWorker {
    application: RemoteApplicationInfo,
    local: Arc<dyn LocalModelFacade>,
    connector: Arc<dyn RemoteModelConnector>,
    remote: Option<Arc<dyn RemoteModelFacade>>,
    relations: BTreeMap<String, TrackedRelation>,
    capacity: usize,
}

impl RemoteApplicationWorker {
    pub fn new(
        application: RemoteApplicationInfo,
        local: Arc<dyn LocalModelFacade>,
        connector: Arc<dyn RemoteModelConnector>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            application,
            local,
            connector,
            remote: None,
            relations: BTreeMap::new(),
            capacity: config.channel_capacity,
        }
    }

    pub async fn run(mut self, mut dying: Dying) -> Result<()> {
        let name = self.application.name.clone();
        tracing::info!(application = %name, offering = self.application.is_consumer_proxy, "remote application worker started");
        let mut relations = self.local.watch_remote_application_relations(&name).await?;
        let (local_tx, mut local_rx) = mpsc::channel(self.capacity.max(1));
        let (remote_tx, mut remote_rx) = mpsc::channel(self.capacity.max(1));
        let mut catacomb = Catacomb::new();

        let outcome = loop {
            tokio::select! {
                _ = dying.wait() => break Ok(()),
                err = catacomb.failed() => break Err(err),
                keys = relations.next() => {
                    let Some(keys) = keys else {
                        let err = closed_error(&mut relations, "remote application relations");
                        break Err(err.await);
                    };
                    let changed = self.relations_changed(keys, &catacomb, &local_tx, &remote_tx);
                    if let Err(err) = changed.await {
                        break Err(err);
                    }
                }
                Some(change) = local_rx.recv() => {
                    if let Err(err) = self.publish_local_change(change).await {
                        break Err(err);
                    }
                }
                Some(change) = remote_rx.recv() => {
                    tracing::debug!(application = %name, token = %change.relation_id.token, "consuming remote relation change");
                    if let Err(err) = self.local.consume_remote_relation_change(change).await {
                        break Err(err);
                    }
                }
            }
        };

        for (_, tracked) in std::mem::take(&mut self.relations) {
            if let TrackedRelation::Consumed(relation) = tracked {
                stop_workers(relation.workers).await;
            }
        }
        match &outcome {
            Ok(()) => tracing::info!(application = %name, "remote application worker stopped"),
            Err(err) => tracing::warn!(application = %name, error = %err, "remote application worker failed"),
        }
        outcome
    }

    async fn relations_changed(
        &mut self,
        keys: Vec<String>,
        catacomb: &Catacomb,
        local_tx: &ChangeSender,
        remote_tx: &ChangeSender,
    ) -> Result<()> {
        for key in keys {
            let relation = match self.local.relation(&key).await {
                Ok(relation) => relation,
                Err(err) if err.is_not_found() => {
                    self.relation_gone(&key).await?;
                    continue;
                }
                Err(err) => return Err(err),
            };
            if self.relations.contains_key(&key) {
                if !relation.life.is_alive() {
                    self.relation_gone(&key).await?;
                }
                continue;
            }
            if !relation.life.is_alive() {
                continue;
            }
            let tracked = if self.application.is_consumer_proxy {
                self.offered_relation(&relation).await?
            } else {
                self.consumed_relation(&relation, catacomb, local_tx, remote_tx)
                    .await?
            };
            self.relations.insert(key, tracked);
        }
        Ok(())
    }

    async fn offered_relation(&self, relation: &RemoteRelation) -> Result<TrackedRelation> {
        // Registration records the tokens just after adding the relation.
        let consumer = relation.source_model_uuid;
        let relation_token = optional(self.local.get_token(&consumer, &relation.key.tag()).await)?;
        tracing::debug!(
            relation = %relation.key,
            relation_token = ?relation_token,
            "tracking relation registered by consuming model"
        );
        Ok(TrackedRelation::Offered { relation_token })
    }

    async fn consumed_relation(
        &mut self,
        relation: &RemoteRelation,
        catacomb: &Catacomb,
        local_tx: &ChangeSender,
        remote_tx: &ChangeSender,
    ) -> Result<TrackedRelation> {
        let remote = self.remote_facade().await?;
        let local_uuid = self.local.model_uuid();
        let application_token = self
            .local
            .export_entity(&Tag::Application(relation.application_name.clone()))
            .await?;
        let relation_token = self.local.export_entity(&relation.key.tag()).await?;
        let offer_credential = self.application.credential.clone().ok_or_else(|| {
            CmrError::permission_denied(format!(
                "no offer credential for remote application {}",
                self.application.name
            ))
        })?;

        tracing::info!(relation = %relation.key, offer = %self.application.offer_name, "registering relation with offering model");
        let registered = remote
            .register_remote_relation(RegisterRemoteRelationArg {
                application_token: application_token.clone(),
                source_model_uuid: local_uuid,
                relation_token: relation_token.clone(),
                remote_endpoint: RemoteEndpoint::from(&relation.endpoint),
                offer_name: self.application.offer_name.clone(),
                local_endpoint_name: relation.remote_endpoint_name.clone(),
                credentials: vec![offer_credential],
            })
            .await?;
        self.local
            .save_credential(&relation.key, registered.credential.clone())
            .await?;
        let remote_application_id =
            RemoteEntityId::new(self.application.model_uuid, registered.token.clone());
        match self
            .local
            .import_remote_entity(
                &remote_application_id,
                &Tag::Application(self.application.name.clone()),
            )
            .await
        {
            Err(err) if err.is_already_exists() => {}
            other => other?,
        }

        let relation_id = RemoteEntityId::new(local_uuid, relation_token);
        let application_id = RemoteEntityId::new(local_uuid, application_token);
        let credentials = vec![registered.credential.clone()];
        let remote_arg = RemoteEntityArg {
            relation_id: relation_id.clone(),
            credentials: credentials.clone(),
        };

        let local_units = self.local.watch_local_relation_units(&relation.key).await?;
        let remote_units = remote.watch_relation_units(remote_arg.clone()).await?;
        let remote_status = remote.watch_relation_status(remote_arg).await?;
        let egress = self
            .local
            .watch_local_egress_addresses(&relation.key)
            .await?;

        let key = &relation.key;
        let local_worker = RelationUnitsWorker::new(
            relation_id.clone(),
            application_id.clone(),
            credentials.clone(),
            Arc::new(LocalSettings::new(self.local.clone(), key.clone())),
            local_tx.clone(),
        );
        let remote_worker = RelationUnitsWorker::new(
            relation_id.clone(),
            remote_application_id.clone(),
            Vec::new(),
            Arc::new(RemoteSettings::new(
                remote.clone(),
                relation_id.clone(),
                credentials.clone(),
            )),
            remote_tx.clone(),
        );
        let status_worker = RelationStatusWorker::new(
            relation_id.clone(),
            remote_application_id,
            remote_tx.clone(),
        );
        let egress_worker = EgressAddressWorker::new(
            relation_id.clone(),
            application_id.clone(),
            credentials,
            remote,
        );
        let workers = vec![
            catacomb.spawn(format!("{key} local units"), |dying| {
                local_worker.run(local_units, dying)
            }),
            catacomb.spawn(format!("{key} remote units"), |dying| {
                remote_worker.run(remote_units, dying)
            }),
            catacomb.spawn(format!("{key} remote status"), |dying| {
                status_worker.run(remote_status, dying)
            }),
            catacomb.spawn(format!("{key} egress"), |dying| {
                egress_worker.run(egress, dying)
            }),
        ];

        Ok(TrackedRelation::Consumed(ConsumedRelation {
            relation_id,
            application_id,
            credential: registered.credential,
            workers,
        }))
    }

    /// Stop syncing a relation, telling the offering model it is going away
    async fn relation_gone(&mut self, key: &str) -> Result<()> {
        let Some(tracked) = self.relations.remove(key) else {
            return Ok(());
        };
        let relation = match tracked {
            TrackedRelation::Offered { relation_token } => {
                tracing::debug!(relation = %key, token = ?relation_token, "registered relation gone");
                return Ok(());
            }
            TrackedRelation::Consumed(relation) => relation,
        };
        tracing::info!(relation = %key, "relation gone, notifying offering model");
        stop_workers(relation.workers).await;

        let remote = self.remote_facade().await?;
        let change = RemoteRelationChangeEvent {
            relation_id: relation.relation_id,
            application_id: relation.application_id,
            life: Life::Dying,
            departed_units: Vec::new(),
            changed_units: Vec::new(),
            credentials: vec![relation.credential],
        };
        match remote.publish_relation_change(change).await {
            Err(err) if err.is_not_found() => Ok(()),
            other => other,
        }
    }

    async fn publish_local_change(&mut self, change: RemoteRelationChangeEvent) -> Result<()> {
        tracing::debug!(
            token = %change.relation_id.token,
            changed = change.changed_units.len(),
            departed = change.departed_units.len(),
            "publishing local relation change"
        );
        let remote = self.remote_facade().await?;
        remote.publish_relation_change(change).await
    }

    async fn remote_facade(&mut self) -> Result<Arc<dyn RemoteModelFacade>> {
        if let Some(remote) = &self.remote {
            return Ok(remote.clone());
        }
        let remote = self.connector.connect(&self.application.model_uuid).await?;
        self.remote = Some(remote.clone());
        Ok(remote)
    }
}

fn optional<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

async fn stop_workers(workers: Vec<WorkerHandle>) {
    for worker in workers {
        let name = worker.name().to_string();
        if let Err(err) = worker.stop().await {
            tracing::warn!(worker = %name, error = %err, "relation worker stopped with error");
        }
    }
}
