//! Consuming-side facade used by the remote relations workers.
//!
//! Exposes the local model's relations, units and token table to the
//! workers, and applies changes arriving from offering models.

use crate::common::{local_application, publish_relation_change, relation_unit_settings};
use crate::resources::Resources;
use cmr_core::params::{
    BatchResult, ErrorResult, GetTokenArg, RelationStatusChange, RelationUnitArg,
    RelationUnitsChange, RelationUnitsWatchResult, RemoteApplicationInfo, RemoteEntityTokenArg,
    RemoteRelation, RemoteRelationChangeEvent, SaveCredentialArg, StringSettings,
    StringsWatchResult, WatchResult,
};
use cmr_core::state::RemoteApplicationState;
use cmr_core::{Backend, CmrError, ModelUuid, RelationKey, Result, SyncConfig, Tag};
use cmr_firewall::watch_ingress_addresses;
use std::sync::Arc;

impl From<RemoteApplicationState> for RemoteApplicationInfo {
    fn from(app: RemoteApplicationState) -> Self {
        Self {
            name: app.name,
            offer_name: app.offer_name,
            model_uuid: app.source_model_uuid,
            life: app.life,
            is_consumer_proxy: app.is_consumer_proxy,
            credential: app.credential,
        }
    }
}

/// Remote relations API served to this model's own workers
#[derive(Clone)]
pub struct RemoteRelationsApi {
    backend: Arc<dyn Backend>,
    resources: Arc<Resources>,
    capacity: usize,
}

impl std::fmt::Debug for RemoteRelationsApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteRelationsApi")
            .field("model_uuid", &self.backend.model_uuid())
            .finish_non_exhaustive()
    }
}

impl RemoteRelationsApi {
    pub fn new(backend: Arc<dyn Backend>, config: &SyncConfig) -> Self {
        Self {
            backend,
            resources: Arc::new(Resources::new()),
            capacity: config.channel_capacity,
        }
    }

    pub fn with_resources(mut self, resources: Arc<Resources>) -> Self {
        self.resources = resources;
        self
    }

    pub fn model_uuid(&self) -> ModelUuid {
        self.backend.model_uuid()
    }

    pub fn resources(&self) -> &Arc<Resources> {
        &self.resources
    }

    /// Capacity of watcher channels created by this facade
    pub fn channel_capacity(&self) -> usize {
        self.capacity
    }

    /// Watch names of remote applications whose life changed
    pub async fn watch_remote_applications(&self) -> StringsWatchResult {
        let outcome = async {
            let watcher = self.backend.watch_remote_applications().await?;
            self.resources.serve(watcher).await
        }
        .await;
        outcome.into()
    }

    /// Watch keys of relations involving each remote application
    pub async fn watch_remote_application_relations(
        &self,
        applications: &[String],
    ) -> Vec<StringsWatchResult> {
        let mut results = Vec::with_capacity(applications.len());
        for tag in applications {
            results.push(self.watch_application_relations(tag).await.into());
        }
        results
    }

    async fn watch_application_relations(&self, tag: &str) -> Result<WatchResult<Vec<String>>> {
        let tag = Tag::parse_kind(tag, "application")?;
        let name = tag.id();
        self.backend.remote_application(&name).await?;
        let watcher = self.backend.watch_application_relations(&name).await?;
        self.resources.serve(watcher).await
    }

    /// Watch keys of every relation involving a remote application
    pub async fn watch_remote_relations(&self) -> StringsWatchResult {
        let outcome = async {
            let watcher = self.backend.watch_remote_relations().await?;
            self.resources.serve(watcher).await
        }
        .await;
        outcome.into()
    }

    /// Watch scope changes of the local application's units in each relation
    pub async fn watch_local_relation_units(
        &self,
        relations: &[String],
    ) -> Vec<RelationUnitsWatchResult> {
        let mut results = Vec::with_capacity(relations.len());
        for tag in relations {
            results.push(self.watch_one_local_relation_units(tag).await.into());
        }
        results
    }

    async fn watch_one_local_relation_units(
        &self,
        tag: &str,
    ) -> Result<WatchResult<RelationUnitsChange>> {
        let key = relation_tag_key(tag)?;
        let relation = self.backend.key_relation(&key).await?;
        let application = local_application(&*self.backend, &relation).await?;
        let watcher = self
            .backend
            .watch_relation_units(&key, &application)
            .await?;
        self.resources.serve(watcher).await
    }

    /// Watch the addresses the offering side must admit for each relation
    pub async fn watch_local_egress_addresses(
        &self,
        relations: &[String],
    ) -> Vec<StringsWatchResult> {
        let mut results = Vec::with_capacity(relations.len());
        for tag in relations {
            results.push(self.watch_one_local_egress_addresses(tag).await.into());
        }
        results
    }

    async fn watch_one_local_egress_addresses(
        &self,
        tag: &str,
    ) -> Result<WatchResult<Vec<String>>> {
        let key = relation_tag_key(tag)?;
        let relation = self.backend.key_relation(&key).await?;
        let application = local_application(&*self.backend, &relation).await?;
        let watcher =
            watch_ingress_addresses(self.backend.clone(), key, application, self.capacity);
        self.resources.serve(watcher).await
    }

    /// Record tokens another model issued for local entities
    pub async fn import_remote_entities(&self, args: &[RemoteEntityTokenArg]) -> Vec<ErrorResult> {
        let mut results = Vec::with_capacity(args.len());
        for arg in args {
            tracing::debug!(tag = %arg.tag, token = %arg.id.token, "importing remote entity");
            results.push(
                self.backend
                    .import_remote_entity(&arg.id, &arg.tag)
                    .await
                    .into(),
            );
        }
        results
    }

    pub async fn remove_remote_entities(&self, args: &[RemoteEntityTokenArg]) -> Vec<ErrorResult> {
        let mut results = Vec::with_capacity(args.len());
        for arg in args {
            results.push(
                self.backend
                    .remove_remote_entity(&arg.id.model_uuid, &arg.tag)
                    .await
                    .into(),
            );
        }
        results
    }

    /// Export local entities, returning their tokens
    ///
    /// An entity exported before gets its existing token together with an
    /// `AlreadyExists` error in the same result.
    pub async fn export_entities(&self, tags: &[String]) -> Vec<BatchResult<String>> {
        let mut results = Vec::with_capacity(tags.len());
        for tag in tags {
            let outcome = async {
                let tag: Tag = tag.parse()?;
                let exported = self.backend.export_local_entity(&tag).await?;
                Ok::<_, CmrError>((tag, exported))
            }
            .await;
            results.push(match outcome {
                Ok((tag, exported)) if exported.already_existed => BatchResult::with_error(
                    exported.token,
                    CmrError::already_exists(format!("token for {tag}")),
                ),
                Ok((_, exported)) => BatchResult::ok(exported.token),
                Err(err) => BatchResult::err(err),
            });
        }
        results
    }

    pub async fn get_tokens(&self, args: &[GetTokenArg]) -> Vec<BatchResult<String>> {
        let mut results = Vec::with_capacity(args.len());
        for arg in args {
            results.push(
                self.backend
                    .get_token(&arg.model_uuid, &arg.tag)
                    .await
                    .into(),
            );
        }
        results
    }

    /// Settings of local units in relation scope
    pub async fn relation_unit_settings(
        &self,
        args: &[RelationUnitArg],
    ) -> Vec<BatchResult<StringSettings>> {
        let mut results = Vec::with_capacity(args.len());
        for arg in args {
            let outcome = async {
                let key = arg.relation.as_relation_key().ok_or_else(|| {
                    CmrError::not_valid(format!("relation tag {}", arg.relation))
                })?;
                if !matches!(arg.unit, Tag::Unit(_)) {
                    return Err(CmrError::not_valid(format!("unit tag {}", arg.unit)));
                }
                relation_unit_settings(&*self.backend, key, &arg.unit.id()).await
            }
            .await;
            results.push(outcome.into());
        }
        results
    }

    pub async fn remote_applications(
        &self,
        applications: &[String],
    ) -> Vec<BatchResult<RemoteApplicationInfo>> {
        let mut results = Vec::with_capacity(applications.len());
        for tag in applications {
            let outcome = async {
                let tag = Tag::parse_kind(tag, "application")?;
                let app = self.backend.remote_application(&tag.id()).await?;
                Ok::<_, CmrError>(RemoteApplicationInfo::from(app))
            }
            .await;
            results.push(outcome.into());
        }
        results
    }

    /// Relations by key, described from the local side
    pub async fn relations(&self, keys: &[String]) -> Vec<BatchResult<RemoteRelation>> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.relation(key).await.into());
        }
        results
    }

    async fn relation(&self, key: &str) -> Result<RemoteRelation> {
        let key = RelationKey::parse(key)?;
        let relation = self.backend.key_relation(&key).await?;
        for endpoint in &relation.endpoints {
            let remote = match self
                .backend
                .remote_application(&endpoint.application_name)
                .await
            {
                Ok(remote) => remote,
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            };
            let local = relation.related_endpoint(&remote.name).ok_or_else(|| {
                CmrError::not_valid(format!("relation \"{key}\" without a local endpoint"))
            })?;
            return Ok(RemoteRelation {
                id: relation.id,
                life: relation.life,
                key: relation.key.clone(),
                application_name: local.application_name.clone(),
                remote_application_name: remote.name,
                remote_endpoint_name: endpoint.name.clone(),
                source_model_uuid: remote.source_model_uuid,
                endpoint: local.clone(),
            });
        }
        Err(CmrError::not_found(format!(
            "remote application for relation \"{key}\""
        )))
    }

    /// Apply changes observed in offering models
    pub async fn consume_remote_relation_changes(
        &self,
        changes: &[RemoteRelationChangeEvent],
    ) -> Vec<ErrorResult> {
        let mut results = Vec::with_capacity(changes.len());
        for change in changes {
            results.push(publish_relation_change(&*self.backend, None, change).await.into());
        }
        results
    }

    /// Retain relation-scoped credentials returned by registration
    pub async fn save_credentials(&self, args: &[SaveCredentialArg]) -> Vec<ErrorResult> {
        let mut results = Vec::with_capacity(args.len());
        for arg in args {
            let outcome = async {
                let key = arg.relation.as_relation_key().ok_or_else(|| {
                    CmrError::not_valid(format!("relation tag {}", arg.relation))
                })?;
                self.backend
                    .save_relation_credential(key, arg.credential.clone())
                    .await
            }
            .await;
            results.push(outcome.into());
        }
        results
    }

    pub async fn next_relation_units(&self, watcher_id: &str) -> Result<RelationUnitsChange> {
        self.resources.next(watcher_id).await
    }

    pub async fn next_strings(&self, watcher_id: &str) -> Result<Vec<String>> {
        self.resources.next(watcher_id).await
    }

    pub async fn next_relation_status(
        &self,
        watcher_id: &str,
    ) -> Result<Vec<RelationStatusChange>> {
        self.resources.next(watcher_id).await
    }

    pub async fn stop_watcher(&self, watcher_id: &str) -> Result<()> {
        self.resources.stop(watcher_id).await
    }
}

fn relation_tag_key(tag: &str) -> Result<RelationKey> {
    match Tag::parse_kind(tag, "relation")? {
        Tag::Relation(key) => Ok(key),
        other => Err(CmrError::not_valid(format!("relation tag {other}"))),
    }
}
