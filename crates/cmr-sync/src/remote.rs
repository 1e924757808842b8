//! Facade seams used by the workers.
//!
//! [`LocalModelFacade`] is the consuming model's own remote-relations API;
//! [`RemoteModelFacade`] is the offering model's cross-model relations API,
//! reached through a [`RemoteModelConnector`]. Both are traits so the
//! transport can be swapped; the in-process implementations here call the
//! facades directly and turn their watch results back into [`Watcher`]s by
//! polling the facade's watcher registry.

use async_trait::async_trait;
use cmr_core::params::{
    BatchResult, Credential, ErrorResult, GetTokenArg, IngressNetworksChangeEvent,
    RegisterRemoteRelationArg, RegisterRemoteRelationResult, RelationStatusChange,
    RelationUnitArg, RelationUnitsChange, RemoteApplicationInfo, RemoteEntityArg,
    RemoteEntityTokenArg, RemoteRelation, RemoteRelationChangeEvent, RemoteRelationUnit,
    SaveCredentialArg, StringSettings, WatchResult,
};
use cmr_core::{
    CmrError, ErrorCode, ModelUuid, RelationKey, RemoteEntityId, Result, Tag, Watcher,
    WatcherSink,
};
use cmr_facade::{CrossModelRelationsApi, RemoteRelationsApi, ResourceKind, Resources};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Offering model's API as seen by a consuming model's workers
#[async_trait]
pub trait RemoteModelFacade: Send + Sync {
    async fn register_remote_relation(
        &self,
        arg: RegisterRemoteRelationArg,
    ) -> Result<RegisterRemoteRelationResult>;

    async fn publish_relation_change(&self, change: RemoteRelationChangeEvent) -> Result<()>;

    async fn publish_ingress_network_change(&self, change: IngressNetworksChangeEvent)
        -> Result<()>;

    async fn relation_unit_settings(&self, unit: RemoteRelationUnit) -> Result<StringSettings>;

    async fn watch_relation_units(&self, arg: RemoteEntityArg)
        -> Result<Watcher<RelationUnitsChange>>;

    async fn watch_relation_status(
        &self,
        arg: RemoteEntityArg,
    ) -> Result<Watcher<Vec<RelationStatusChange>>>;

    async fn watch_egress_addresses(&self, arg: RemoteEntityArg) -> Result<Watcher<Vec<String>>>;
}

/// Opens connections to offering models
#[async_trait]
pub trait RemoteModelConnector: Send + Sync {
    async fn connect(&self, model_uuid: &ModelUuid) -> Result<Arc<dyn RemoteModelFacade>>;
}

/// The consuming model's own API as seen by its workers
#[async_trait]
pub trait LocalModelFacade: Send + Sync {
    fn model_uuid(&self) -> ModelUuid;

    async fn watch_remote_applications(&self) -> Result<Watcher<Vec<String>>>;

    async fn watch_remote_application_relations(
        &self,
        application: &str,
    ) -> Result<Watcher<Vec<String>>>;

    async fn watch_local_relation_units(
        &self,
        key: &RelationKey,
    ) -> Result<Watcher<RelationUnitsChange>>;

    async fn watch_local_egress_addresses(&self, key: &RelationKey)
        -> Result<Watcher<Vec<String>>>;

    /// Token for a local entity, exporting it if it has none yet
    async fn export_entity(&self, tag: &Tag) -> Result<String>;

    async fn get_token(&self, model_uuid: &ModelUuid, tag: &Tag) -> Result<String>;

    async fn import_remote_entity(&self, id: &RemoteEntityId, tag: &Tag) -> Result<()>;

    async fn relation_unit_settings(&self, key: &RelationKey, unit: &str)
        -> Result<StringSettings>;

    async fn remote_application(&self, name: &str) -> Result<RemoteApplicationInfo>;

    async fn relation(&self, key: &str) -> Result<RemoteRelation>;

    async fn consume_remote_relation_change(&self, change: RemoteRelationChangeEvent)
        -> Result<()>;

    async fn save_credential(&self, key: &RelationKey, credential: Credential) -> Result<()>;
}

/// Only result of a single-item bulk call
fn single<T>(mut results: Vec<T>) -> Result<T> {
    let count = results.len();
    match results.pop() {
        Some(result) if count == 1 => Ok(result),
        _ => Err(CmrError::internal(format!("expected 1 result, got {count}"))),
    }
}

fn single_batch<T>(results: Vec<BatchResult<T>>) -> Result<T> {
    single(results)?.into_result()
}

fn single_error(results: Vec<ErrorResult>) -> Result<()> {
    single(results)?.into_result()
}

/// Client-side watcher fed by polling a facade's watcher registry
///
/// The initial snapshot from `result` is delivered first. Stopping the
/// returned watcher stops the server-side watcher too.
pub fn poll_watcher<T: ResourceKind>(
    resources: Arc<Resources>,
    capacity: usize,
    result: WatchResult<T>,
) -> Watcher<T> {
    Watcher::spawn(capacity, move |mut sink| async move {
        let WatchResult {
            watcher_id,
            changes,
        } = result;
        let outcome = if sink.send(changes).await {
            forward_changes(&mut sink, &resources, &watcher_id).await
        } else {
            Ok(())
        };
        if let Err(err) = resources.stop(&watcher_id).await {
            tracing::trace!(watcher_id = %watcher_id, error = %err, "remote watcher already stopped");
        }
        outcome
    })
}

async fn forward_changes<T: ResourceKind>(
    sink: &mut WatcherSink<T>,
    resources: &Resources,
    watcher_id: &str,
) -> Result<()> {
    loop {
        let change = tokio::select! {
            _ = sink.dying() => return Ok(()),
            change = resources.next::<T>(watcher_id) => change?,
        };
        if !sink.send(change).await {
            return Ok(());
        }
    }
}

/// In-process client of an offering model's [`CrossModelRelationsApi`]
#[derive(Debug, Clone)]
pub struct CrossModelRelationsClient {
    api: CrossModelRelationsApi,
}

impl CrossModelRelationsClient {
    pub fn new(api: CrossModelRelationsApi) -> Self {
        Self { api }
    }

    fn watcher<T: ResourceKind>(&self, result: WatchResult<T>) -> Watcher<T> {
        poll_watcher(
            self.api.resources().clone(),
            self.api.channel_capacity(),
            result,
        )
    }
}

#[async_trait]
impl RemoteModelFacade for CrossModelRelationsClient {
    async fn register_remote_relation(
        &self,
        arg: RegisterRemoteRelationArg,
    ) -> Result<RegisterRemoteRelationResult> {
        single_batch(self.api.register_remote_relations(&[arg]).await)
    }

    async fn publish_relation_change(&self, change: RemoteRelationChangeEvent) -> Result<()> {
        single_error(self.api.publish_relation_changes(&[change]).await)
    }

    async fn publish_ingress_network_change(
        &self,
        change: IngressNetworksChangeEvent,
    ) -> Result<()> {
        single_error(self.api.publish_ingress_network_changes(&[change]).await)
    }

    async fn relation_unit_settings(&self, unit: RemoteRelationUnit) -> Result<StringSettings> {
        single_batch(self.api.relation_unit_settings(&[unit]).await)
    }

    async fn watch_relation_units(
        &self,
        arg: RemoteEntityArg,
    ) -> Result<Watcher<RelationUnitsChange>> {
        let result = single_batch(self.api.watch_relation_units(&[arg]).await)?;
        Ok(self.watcher(result))
    }

    async fn watch_relation_status(
        &self,
        arg: RemoteEntityArg,
    ) -> Result<Watcher<Vec<RelationStatusChange>>> {
        let result = single_batch(self.api.watch_relations_status(&[arg]).await)?;
        Ok(self.watcher(result))
    }

    async fn watch_egress_addresses(&self, arg: RemoteEntityArg) -> Result<Watcher<Vec<String>>> {
        let result = single_batch(self.api.watch_egress_addresses_for_relations(&[arg]).await)?;
        Ok(self.watcher(result))
    }
}

/// Connector resolving offering models served in this process
#[derive(Default)]
pub struct InProcessConnector {
    models: RwLock<HashMap<ModelUuid, Arc<dyn RemoteModelFacade>>>,
}

impl std::fmt::Debug for InProcessConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessConnector")
            .field("models", &self.models.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl InProcessConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `api` as the offering model it belongs to
    pub fn register(&self, api: CrossModelRelationsApi) {
        let model_uuid = api.model_uuid();
        self.models
            .write()
            .insert(model_uuid, Arc::new(CrossModelRelationsClient::new(api)));
    }

    pub fn unregister(&self, model_uuid: &ModelUuid) {
        self.models.write().remove(model_uuid);
    }
}

#[async_trait]
impl RemoteModelConnector for InProcessConnector {
    async fn connect(&self, model_uuid: &ModelUuid) -> Result<Arc<dyn RemoteModelFacade>> {
        self.models
            .read()
            .get(model_uuid)
            .cloned()
            .ok_or_else(|| CmrError::not_found(format!("model {model_uuid}")))
    }
}

fn local_watcher<T: ResourceKind>(api: &RemoteRelationsApi, result: WatchResult<T>) -> Watcher<T> {
    poll_watcher(api.resources().clone(), api.channel_capacity(), result)
}

#[async_trait]
impl LocalModelFacade for RemoteRelationsApi {
    fn model_uuid(&self) -> ModelUuid {
        RemoteRelationsApi::model_uuid(self)
    }

    async fn watch_remote_applications(&self) -> Result<Watcher<Vec<String>>> {
        let result = RemoteRelationsApi::watch_remote_applications(self)
            .await
            .into_result()?;
        Ok(local_watcher(self, result))
    }

    async fn watch_remote_application_relations(
        &self,
        application: &str,
    ) -> Result<Watcher<Vec<String>>> {
        let tag = Tag::application(application)?.to_string();
        let results = RemoteRelationsApi::watch_remote_application_relations(self, &[tag]).await;
        let result = single_batch(results)?;
        Ok(local_watcher(self, result))
    }

    async fn watch_local_relation_units(
        &self,
        key: &RelationKey,
    ) -> Result<Watcher<RelationUnitsChange>> {
        let tag = key.tag().to_string();
        let result =
            single_batch(RemoteRelationsApi::watch_local_relation_units(self, &[tag]).await)?;
        Ok(local_watcher(self, result))
    }

    async fn watch_local_egress_addresses(
        &self,
        key: &RelationKey,
    ) -> Result<Watcher<Vec<String>>> {
        let tag = key.tag().to_string();
        let result =
            single_batch(RemoteRelationsApi::watch_local_egress_addresses(self, &[tag]).await)?;
        Ok(local_watcher(self, result))
    }

    async fn export_entity(&self, tag: &Tag) -> Result<String> {
        let exported = single(self.export_entities(&[tag.to_string()]).await)?;
        match (exported.result, exported.error) {
            (Some(token), None) => Ok(token),
            (Some(token), Some(error)) if error.code == Some(ErrorCode::AlreadyExists) => Ok(token),
            (_, Some(error)) => Err(error.into_error()),
            (None, None) => Err(CmrError::internal(format!("no token exported for {tag}"))),
        }
    }

    async fn get_token(&self, model_uuid: &ModelUuid, tag: &Tag) -> Result<String> {
        single_batch(
            self.get_tokens(&[GetTokenArg {
                model_uuid: *model_uuid,
                tag: tag.clone(),
            }])
            .await,
        )
    }

    async fn import_remote_entity(&self, id: &RemoteEntityId, tag: &Tag) -> Result<()> {
        single_error(
            self.import_remote_entities(&[RemoteEntityTokenArg {
                tag: tag.clone(),
                id: id.clone(),
            }])
            .await,
        )
    }

    async fn relation_unit_settings(
        &self,
        key: &RelationKey,
        unit: &str,
    ) -> Result<StringSettings> {
        single_batch(
            RemoteRelationsApi::relation_unit_settings(
                self,
                &[RelationUnitArg {
                    relation: key.tag(),
                    unit: Tag::unit(unit)?,
                }],
            )
            .await,
        )
    }

    async fn remote_application(&self, name: &str) -> Result<RemoteApplicationInfo> {
        let tag = Tag::application(name)?.to_string();
        single_batch(self.remote_applications(&[tag]).await)
    }

    async fn relation(&self, key: &str) -> Result<RemoteRelation> {
        single_batch(self.relations(&[key.to_string()]).await)
    }

    async fn consume_remote_relation_change(
        &self,
        change: RemoteRelationChangeEvent,
    ) -> Result<()> {
        single_error(self.consume_remote_relation_changes(&[change]).await)
    }

    async fn save_credential(&self, key: &RelationKey, credential: Credential) -> Result<()> {
        single_error(
            self.save_credentials(&[SaveCredentialArg {
                relation: key.tag(),
                credential,
            }])
            .await,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_requires_exactly_one_result() {
        assert_eq!(single(vec![7]).unwrap(), 7);
        assert!(matches!(single::<u8>(vec![]), Err(CmrError::Internal { .. })));
        let err = single(vec![1, 2]).unwrap_err();
        assert_eq!(err, CmrError::internal("expected 1 result, got 2"));
    }
}
