//! Offering-side facade called by consuming models.
//!
//! Every relation-scoped call checks its credentials against the relation the
//! token resolves to before touching the store, one item at a time; a bad
//! item fails only its own result.

use crate::common::{
    authorize_relation, local_application, publish_relation_change, relation_key_for_token,
    relation_unit_settings, tolerate_already_exists,
};
use crate::resources::Resources;
use cmr_authorization::{CredentialContext, DeclaredCaveats};
use cmr_core::params::{
    BatchResult, Credential, ErrorResult, IngressNetworksChangeEvent, RegisterRemoteRelationArg,
    RegisterRemoteRelationResult, RelationStatusChange, RelationStatusWatchResult,
    RelationUnitsChange, RelationUnitsWatchResult, RemoteEntityArg, RemoteRelationChangeEvent,
    RemoteRelationUnit, StringSettings, StringsWatchResult, WatchResult,
};
use cmr_core::state::{AddRemoteApplicationParams, OfferConnection, RelationInfo};
use cmr_core::{
    consumer_proxy_name, Backend, CmrError, Endpoint, ModelUuid, RelationKey, RemoteEntityId,
    Result, SyncConfig, Tag,
};
use cmr_firewall::watch_ingress_addresses;
use std::sync::Arc;

/// Cross-model relations API served by the offering model
#[derive(Clone)]
pub struct CrossModelRelationsApi {
    backend: Arc<dyn Backend>,
    credentials: Arc<CredentialContext>,
    resources: Arc<Resources>,
    capacity: usize,
}

impl std::fmt::Debug for CrossModelRelationsApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossModelRelationsApi")
            .field("model_uuid", &self.backend.model_uuid())
            .field("watchers", &self.resources.count())
            .finish_non_exhaustive()
    }
}

impl CrossModelRelationsApi {
    pub fn new(
        backend: Arc<dyn Backend>,
        credentials: Arc<CredentialContext>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            backend,
            credentials,
            resources: Arc::new(Resources::new()),
            capacity: config.channel_capacity,
        }
    }

    /// Share a watcher registry with other facades
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

    /// Apply relation changes published by consuming models
    pub async fn publish_relation_changes(
        &self,
        changes: &[RemoteRelationChangeEvent],
    ) -> Vec<ErrorResult> {
        let mut results = Vec::with_capacity(changes.len());
        for change in changes {
            let outcome =
                publish_relation_change(&*self.backend, Some(&*self.credentials), change).await;
            if let Err(err) = &outcome {
                tracing::debug!(token = %change.relation_id.token, error = %err, "publish relation change failed");
            }
            results.push(outcome.into());
        }
        results
    }

    /// Record the networks consumers need admitted for their relations
    pub async fn publish_ingress_network_changes(
        &self,
        changes: &[IngressNetworksChangeEvent],
    ) -> Vec<ErrorResult> {
        let mut results = Vec::with_capacity(changes.len());
        for change in changes {
            results.push(self.publish_ingress_network_change(change).await.into());
        }
        results
    }

    async fn publish_ingress_network_change(
        &self,
        change: &IngressNetworksChangeEvent,
    ) -> Result<()> {
        let key = match relation_key_for_token(&*self.backend, &change.relation_id).await {
            Ok(key) => key,
            Err(err) if err.is_not_found() => {
                tracing::debug!(token = %change.relation_id.token, "relation token not found, ignoring ingress change");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        self.authorize(&change.relation_id, &change.credentials, &key)
            .await?;
        let networks: &[String] = if change.ingress_required {
            &change.networks
        } else {
            &[]
        };
        tracing::debug!(relation = %key, networks = ?networks, "saving ingress networks");
        match self.backend.save_ingress_networks(&key, networks).await {
            Err(err) if err.is_not_found() => Ok(()),
            other => other,
        }
    }

    /// Register relations consuming this model's offers
    ///
    /// Repeating a registration with identical arguments yields the same
    /// relation and tokens. A relation token already bound to a different
    /// relation, a relation already registered under another token, or a
    /// proxy owned by a different model, is `NotValid`.
    pub async fn register_remote_relations(
        &self,
        relations: &[RegisterRemoteRelationArg],
    ) -> Vec<BatchResult<RegisterRemoteRelationResult>> {
        let mut results = Vec::with_capacity(relations.len());
        for arg in relations {
            let outcome = self.register_remote_relation(arg).await;
            if let Err(err) = &outcome {
                tracing::info!(offer = %arg.offer_name, error = %err, "remote relation registration failed");
            }
            results.push(outcome.into());
        }
        results
    }

    async fn register_remote_relation(
        &self,
        arg: &RegisterRemoteRelationArg,
    ) -> Result<RegisterRemoteRelationResult> {
        let (offer_credential, declared) =
            self.offer_credential(&arg.credentials, &arg.offer_name)?;

        let offer = self.backend.application_offer(&arg.offer_name).await?;
        let app_endpoint = offer.endpoints.get(&arg.local_endpoint_name).ok_or_else(|| {
            CmrError::not_found(format!(
                "endpoint {:?} of offer {:?}",
                arg.local_endpoint_name, arg.offer_name
            ))
        })?;
        let application = self.backend.application(&offer.application_name).await?;
        let local_endpoint = application.endpoint(app_endpoint).cloned().ok_or_else(|| {
            CmrError::not_found(format!(
                "endpoint {app_endpoint:?} of application {:?}",
                application.name
            ))
        })?;

        let proxy_name = consumer_proxy_name(&arg.application_token);
        let remote_endpoint = arg.remote_endpoint.for_application(&proxy_name);
        let endpoints = [local_endpoint, remote_endpoint];
        let key = RelationKey::from_endpoints(&endpoints)?;
        let relation_id = RemoteEntityId::new(arg.source_model_uuid, arg.relation_token.clone());
        match self.backend.get_remote_entity(&relation_id).await {
            Ok(tag) if tag != key.tag() => {
                return Err(CmrError::not_valid(format!(
                    "relation token {:?} registered for {tag}, re-registration for \"{key}\"",
                    arg.relation_token
                )));
            }
            Ok(_) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        let existing_token = self
            .backend
            .get_token(&arg.source_model_uuid, &key.tag())
            .await;
        match existing_token {
            Ok(token) if token != arg.relation_token => {
                return Err(CmrError::not_valid(format!(
                    "relation \"{key}\" registered with token {token:?}, re-registration with {:?}",
                    arg.relation_token
                )));
            }
            Ok(_) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        self.ensure_consumer_proxy(arg, &proxy_name, &endpoints[1])
            .await?;
        let relation = self.find_or_add_relation(&endpoints, &key).await?;
        tolerate_already_exists(
            self.backend
                .import_remote_entity(&relation_id, &key.tag())
                .await,
        )?;
        let application_id =
            RemoteEntityId::new(arg.source_model_uuid, arg.application_token.clone());
        tolerate_already_exists(
            self.backend
                .import_remote_entity(&application_id, &Tag::Application(proxy_name.clone()))
                .await,
        )?;

        let connection = OfferConnection {
            source_model_uuid: arg.source_model_uuid,
            relation_id: relation.id,
            relation_key: key.clone(),
            username: declared.username.clone(),
            offer_name: arg.offer_name.clone(),
        };
        match self.backend.add_offer_connection(connection).await {
            Ok(_) => {}
            Err(err) if err.is_already_exists() => {}
            Err(err) => return Err(err),
        }

        let exported = self
            .backend
            .export_local_entity(&Tag::Application(offer.application_name.clone()))
            .await?;
        let credential = self
            .credentials
            .attenuate_to_relation(offer_credential, &key)?;
        tracing::info!(
            relation = %key,
            proxy = %proxy_name,
            source_model = %arg.source_model_uuid,
            "registered remote relation"
        );
        Ok(RegisterRemoteRelationResult {
            token: exported.token,
            credential,
        })
    }

    /// First credential naming the offer, with its declared caveats
    fn offer_credential<'a>(
        &self,
        credentials: &'a [Credential],
        offer_name: &str,
    ) -> Result<(&'a Credential, DeclaredCaveats)> {
        let mut last_err = None;
        for credential in credentials {
            match self
                .credentials
                .check_offer_credential(std::slice::from_ref(credential), offer_name)
            {
                Ok(declared) => return Ok((credential, declared)),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| CmrError::permission_denied("no credentials supplied")))
    }

    async fn ensure_consumer_proxy(
        &self,
        arg: &RegisterRemoteRelationArg,
        proxy_name: &str,
        endpoint: &Endpoint,
    ) -> Result<()> {
        match self.backend.remote_application(proxy_name).await {
            Ok(existing) => {
                if !existing.is_consumer_proxy
                    || existing.source_model_uuid != arg.source_model_uuid
                {
                    return Err(CmrError::not_valid(format!(
                        "application {proxy_name:?} owned by model {}, registration from {}",
                        existing.source_model_uuid, arg.source_model_uuid
                    )));
                }
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                let params = AddRemoteApplicationParams {
                    name: proxy_name.to_string(),
                    source_model_uuid: arg.source_model_uuid,
                    offer_name: arg.offer_name.clone(),
                    endpoints: vec![endpoint.clone()],
                    is_consumer_proxy: true,
                    credential: None,
                };
                match self.backend.add_remote_application(params).await {
                    Ok(_) => {
                        tracing::debug!(proxy = proxy_name, "added consumer proxy");
                        Ok(())
                    }
                    Err(err) if err.is_already_exists() => Ok(()),
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    async fn find_or_add_relation(
        &self,
        endpoints: &[Endpoint],
        key: &RelationKey,
    ) -> Result<RelationInfo> {
        match self.backend.add_relation(endpoints).await {
            Ok(relation) => {
                tracing::debug!(relation = %key, "added relation for remote consumer");
                Ok(relation)
            }
            Err(err) if err.is_already_exists() => self.backend.key_relation(key).await,
            Err(err) => Err(err),
        }
    }

    /// Settings of units of this model's applications in relation scope
    pub async fn relation_unit_settings(
        &self,
        units: &[RemoteRelationUnit],
    ) -> Vec<BatchResult<StringSettings>> {
        let mut results = Vec::with_capacity(units.len());
        for unit in units {
            results.push(self.remote_relation_unit_settings(unit).await.into());
        }
        results
    }

    async fn remote_relation_unit_settings(
        &self,
        arg: &RemoteRelationUnit,
    ) -> Result<StringSettings> {
        let key = relation_key_for_token(&*self.backend, &arg.relation_id).await?;
        self.authorize(&arg.relation_id, &arg.credentials, &key)
            .await?;
        let unit = Tag::parse_kind(&arg.unit, "unit")?;
        relation_unit_settings(&*self.backend, &key, &unit.id()).await
    }

    /// Watch scope changes of this model's units in each relation
    pub async fn watch_relation_units(
        &self,
        args: &[RemoteEntityArg],
    ) -> Vec<RelationUnitsWatchResult> {
        let mut results = Vec::with_capacity(args.len());
        for arg in args {
            results.push(self.watch_one_relation_units(arg).await.into());
        }
        results
    }

    async fn watch_one_relation_units(
        &self,
        arg: &RemoteEntityArg,
    ) -> Result<WatchResult<RelationUnitsChange>> {
        let relation = self.authorized_relation(arg).await?;
        let application = local_application(&*self.backend, &relation).await?;
        let watcher = self
            .backend
            .watch_relation_units(&relation.key, &application)
            .await?;
        self.resources.serve(watcher).await
    }

    /// Watch the addresses consumers must admit for each relation
    pub async fn watch_egress_addresses_for_relations(
        &self,
        args: &[RemoteEntityArg],
    ) -> Vec<StringsWatchResult> {
        let mut results = Vec::with_capacity(args.len());
        for arg in args {
            results.push(self.watch_one_egress_addresses(arg).await.into());
        }
        results
    }

    async fn watch_one_egress_addresses(
        &self,
        arg: &RemoteEntityArg,
    ) -> Result<WatchResult<Vec<String>>> {
        let relation = self.authorized_relation(arg).await?;
        let application = local_application(&*self.backend, &relation).await?;
        let watcher = watch_ingress_addresses(
            self.backend.clone(),
            relation.key,
            application,
            self.capacity,
        );
        self.resources.serve(watcher).await
    }

    /// Watch life and suspension of each relation
    pub async fn watch_relations_status(
        &self,
        args: &[RemoteEntityArg],
    ) -> Vec<RelationStatusWatchResult> {
        let mut results = Vec::with_capacity(args.len());
        for arg in args {
            results.push(self.watch_one_relation_status(arg).await.into());
        }
        results
    }

    async fn watch_one_relation_status(
        &self,
        arg: &RemoteEntityArg,
    ) -> Result<WatchResult<Vec<RelationStatusChange>>> {
        let relation = self.authorized_relation(arg).await?;
        let watcher = self.backend.watch_relation_status(&relation.key).await?;
        self.resources.serve(watcher).await
    }

    async fn authorized_relation(&self, arg: &RemoteEntityArg) -> Result<RelationInfo> {
        let key = relation_key_for_token(&*self.backend, &arg.relation_id).await?;
        self.authorize(&arg.relation_id, &arg.credentials, &key)
            .await?;
        self.backend.key_relation(&key).await
    }

    async fn authorize(
        &self,
        relation_id: &RemoteEntityId,
        credentials: &[Credential],
        key: &RelationKey,
    ) -> Result<()> {
        authorize_relation(
            &*self.backend,
            &self.credentials,
            relation_id,
            credentials,
            key,
        )
        .await?;
        Ok(())
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
