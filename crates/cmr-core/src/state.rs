//! Backend capability traits over the local model store.
//!
//! The store itself is an external collaborator. Components depend on the
//! [`Backend`] supertrait; the production store and the in-memory test
//! double both implement the four capability traits it combines.

use crate::errors::Result;
use crate::identifiers::{Endpoint, Life, ModelUuid, RelationKey, RemoteEntityId, Tag};
use crate::params::{Credential, RelationStatusChange, RelationUnitsChange, Settings};
use crate::watcher::Watcher;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A local application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationInfo {
    pub name: String,
    pub life: Life,
    pub endpoints: Vec<Endpoint>,
}

impl ApplicationInfo {
    pub fn endpoint(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|ep| ep.name == name)
    }
}

/// A unit of a local application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitInfo {
    pub name: String,
    pub application: String,
    pub life: Life,
    pub machine_id: Option<String>,
    pub public_address: Option<String>,
}

/// A relation between two endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationInfo {
    pub id: u64,
    pub key: RelationKey,
    pub life: Life,
    pub suspended: bool,
    pub endpoints: Vec<Endpoint>,
}

impl RelationInfo {
    /// Endpoint of `application` in this relation
    pub fn endpoint(&self, application: &str) -> Option<&Endpoint> {
        self.endpoints
            .iter()
            .find(|ep| ep.application_name == application)
    }

    /// Endpoint on the other side from `application`
    pub fn related_endpoint(&self, application: &str) -> Option<&Endpoint> {
        self.endpoints
            .iter()
            .find(|ep| ep.application_name != application)
    }
}

/// Local stand-in for an application living in another model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteApplicationState {
    pub name: String,
    pub source_model_uuid: ModelUuid,
    pub offer_name: String,
    pub endpoints: Vec<Endpoint>,
    pub is_consumer_proxy: bool,
    pub life: Life,
    pub relation_count: usize,
    pub credential: Option<Credential>,
}

/// Arguments for creating a remote application proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddRemoteApplicationParams {
    pub name: String,
    pub source_model_uuid: ModelUuid,
    pub offer_name: String,
    pub endpoints: Vec<Endpoint>,
    pub is_consumer_proxy: bool,
    pub credential: Option<Credential>,
}

/// An application offered to other models
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationOffer {
    pub offer_name: String,
    pub application_name: String,
    /// Offer endpoint name to application endpoint name
    pub endpoints: BTreeMap<String, String>,
}

/// Which offer a consumed relation uses, and who consumes it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferConnection {
    pub source_model_uuid: ModelUuid,
    pub relation_id: u64,
    pub relation_key: RelationKey,
    pub username: String,
    pub offer_name: String,
}

/// Token produced by exporting a local entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedToken {
    pub token: String,
    /// The entity had already been exported; `token` is the existing one
    pub already_existed: bool,
}

/// Model identity, applications, units, machines and remote proxies
#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn model_uuid(&self) -> ModelUuid;

    async fn application(&self, name: &str) -> Result<ApplicationInfo>;

    async fn all_units(&self, application: &str) -> Result<Vec<UnitInfo>>;

    async fn unit(&self, name: &str) -> Result<UnitInfo>;

    /// Notifies once on start and whenever the machine's addresses change
    async fn watch_machine_addresses(&self, machine_id: &str) -> Result<Watcher<()>>;

    async fn remote_application(&self, name: &str) -> Result<RemoteApplicationState>;

    async fn add_remote_application(
        &self,
        params: AddRemoteApplicationParams,
    ) -> Result<RemoteApplicationState>;

    async fn destroy_remote_application(&self, name: &str) -> Result<()>;

    /// Names of remote applications whose life changed
    async fn watch_remote_applications(&self) -> Result<Watcher<Vec<String>>>;
}

/// Bidirectional token table: `(model, token) <-> tag`
#[async_trait]
pub trait RemoteEntityBackend: Send + Sync {
    /// Token for a local entity in this model's own table, minted on first use
    async fn export_local_entity(&self, tag: &Tag) -> Result<ExportedToken>;

    /// Record that `id` names `tag`; `AlreadyExists` if the pair is known
    async fn import_remote_entity(&self, id: &RemoteEntityId, tag: &Tag) -> Result<()>;

    async fn get_remote_entity(&self, id: &RemoteEntityId) -> Result<Tag>;

    async fn get_token(&self, model_uuid: &ModelUuid, tag: &Tag) -> Result<String>;

    async fn remove_remote_entity(&self, model_uuid: &ModelUuid, tag: &Tag) -> Result<()>;
}

/// Relations, relation scope, and per-relation ingress networks
#[async_trait]
pub trait RelationBackend: Send + Sync {
    async fn key_relation(&self, key: &RelationKey) -> Result<RelationInfo>;

    /// `AlreadyExists` if a relation with the same key exists
    async fn add_relation(&self, endpoints: &[Endpoint]) -> Result<RelationInfo>;

    /// Start tearing down a relation; it is removed once its scope empties
    async fn destroy_relation(&self, key: &RelationKey) -> Result<()>;

    async fn relation_unit_in_scope(&self, key: &RelationKey, unit: &str) -> Result<bool>;

    async fn enter_scope(&self, key: &RelationKey, unit: &str, settings: Settings) -> Result<()>;

    async fn replace_settings(
        &self,
        key: &RelationKey,
        unit: &str,
        settings: Settings,
    ) -> Result<()>;

    async fn leave_scope(&self, key: &RelationKey, unit: &str) -> Result<()>;

    async fn relation_unit_settings(&self, key: &RelationKey, unit: &str) -> Result<Settings>;

    /// Scope changes of `application`'s units in the relation
    async fn watch_relation_units(
        &self,
        key: &RelationKey,
        application: &str,
    ) -> Result<Watcher<RelationUnitsChange>>;

    async fn watch_relation_status(
        &self,
        key: &RelationKey,
    ) -> Result<Watcher<Vec<RelationStatusChange>>>;

    /// Keys of relations involving `application` whose life changed
    async fn watch_application_relations(&self, application: &str)
        -> Result<Watcher<Vec<String>>>;

    /// Keys of relations involving any remote application whose life changed
    async fn watch_remote_relations(&self) -> Result<Watcher<Vec<String>>>;

    async fn save_ingress_networks(&self, key: &RelationKey, cidrs: &[String]) -> Result<()>;

    async fn ingress_networks(&self, key: &RelationKey) -> Result<Vec<String>>;
}

/// Offers, offer connections, and retained credentials
#[async_trait]
pub trait OfferBackend: Send + Sync {
    async fn application_offer(&self, offer_name: &str) -> Result<ApplicationOffer>;

    /// `AlreadyExists` if the relation already has a connection
    async fn add_offer_connection(&self, connection: OfferConnection) -> Result<OfferConnection>;

    async fn offer_connection_for_relation(&self, key: &RelationKey) -> Result<OfferConnection>;

    async fn save_relation_credential(&self, key: &RelationKey, credential: Credential)
        -> Result<()>;

    async fn relation_credential(&self, key: &RelationKey) -> Result<Credential>;
}

/// Every capability a cross-model component needs from the model store
pub trait Backend: ModelBackend + RemoteEntityBackend + RelationBackend + OfferBackend {}

impl<T> Backend for T where
    T: ModelBackend + RemoteEntityBackend + RelationBackend + OfferBackend
{
}
