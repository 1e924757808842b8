//! Typed request and response parameters exchanged between models.
//!
//! Every batch call preserves cardinality: the response carries one
//! [`BatchResult`] per request item, positionally correlated.

use crate::errors::{CmrError, ErrorInfo, Result};
use crate::identifiers::{
    Endpoint, Life, ModelUuid, RelationKey, RelationScope, RemoteEntityId, Role, Tag,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Relation unit settings as stored; values may be structured
pub type Settings = BTreeMap<String, serde_json::Value>;

/// Relation unit settings as served across the model boundary
pub type StringSettings = BTreeMap<String, String>;

/// Opaque bearer credential, serialized in its transport encoding
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(pub String);

impl Credential {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Bearer material stays out of logs.
        write!(f, "Credential({} bytes)", self.0.len())
    }
}

/// Per-item result in a batch response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult<T> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl<T> BatchResult<T> {
    pub fn ok(result: T) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn err(error: impl Into<ErrorInfo>) -> Self {
        Self {
            result: None,
            error: Some(error.into()),
        }
    }

    /// A result that carries a value alongside a tolerated error
    pub fn with_error(result: T, error: impl Into<ErrorInfo>) -> Self {
        Self {
            result: Some(result),
            error: Some(error.into()),
        }
    }

    /// Error wins over any value present
    pub fn into_result(self) -> Result<T> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error.into_error()),
            (Some(result), None) => Ok(result),
            (None, None) => Err(CmrError::internal("batch result carries neither value nor error")),
        }
    }
}

impl<T> From<Result<T>> for BatchResult<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => Self::ok(value),
            Err(error) => Self::err(error),
        }
    }
}

/// Result of an operation with no return value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl ErrorResult {
    pub fn ok() -> Self {
        Self { error: None }
    }

    pub fn err(error: impl Into<ErrorInfo>) -> Self {
        Self {
            error: Some(error.into()),
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self.error {
            Some(error) => Err(error.into_error()),
            None => Ok(()),
        }
    }
}

impl From<Result<()>> for ErrorResult {
    fn from(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self::ok(),
            Err(error) => Self::err(error),
        }
    }
}

/// Changed unit carried in a [`RemoteRelationChangeEvent`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRelationUnitChange {
    pub unit_id: u32,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub version: i64,
}

/// Unit of synchronization sent across the model boundary in both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRelationChangeEvent {
    pub relation_id: RemoteEntityId,
    pub application_id: RemoteEntityId,
    pub life: Life,
    #[serde(default)]
    pub departed_units: Vec<u32>,
    #[serde(default)]
    pub changed_units: Vec<RemoteRelationUnitChange>,
    #[serde(default)]
    pub credentials: Vec<Credential>,
}

/// Ingress networks required by the consuming side of a relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressNetworksChangeEvent {
    pub relation_id: RemoteEntityId,
    pub application_id: RemoteEntityId,
    pub ingress_required: bool,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub credentials: Vec<Credential>,
}

/// Endpoint descriptor without an owning application
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteEndpoint {
    pub name: String,
    pub role: Role,
    pub interface: String,
    #[serde(default)]
    pub limit: u32,
}

impl RemoteEndpoint {
    /// Attach this descriptor to `application`
    pub fn for_application(&self, application: &str) -> Endpoint {
        Endpoint {
            application_name: application.to_string(),
            name: self.name.clone(),
            role: self.role,
            interface: self.interface.clone(),
            limit: self.limit,
            scope: RelationScope::default(),
        }
    }
}

impl From<&Endpoint> for RemoteEndpoint {
    fn from(endpoint: &Endpoint) -> Self {
        Self {
            name: endpoint.name.clone(),
            role: endpoint.role,
            interface: endpoint.interface.clone(),
            limit: endpoint.limit,
        }
    }
}

/// Registration of a consumed relation with the offering model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRemoteRelationArg {
    pub application_token: String,
    pub source_model_uuid: ModelUuid,
    pub relation_token: String,
    pub remote_endpoint: RemoteEndpoint,
    pub offer_name: String,
    pub local_endpoint_name: String,
    #[serde(default)]
    pub credentials: Vec<Credential>,
}

/// Offering side's answer to a registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRemoteRelationResult {
    /// Token of the offered application
    pub token: String,
    pub credential: Credential,
}

/// A relation token plus the credentials scoping a call to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntityArg {
    pub relation_id: RemoteEntityId,
    #[serde(default)]
    pub credentials: Vec<Credential>,
}

/// A unit of a relation addressed by token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRelationUnit {
    pub relation_id: RemoteEntityId,
    pub unit: String,
    #[serde(default)]
    pub credentials: Vec<Credential>,
}

/// Settings version of a unit in relation scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSettingsVersion {
    pub version: i64,
}

/// Scope change of a relation: joined or changed units, and departures
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationUnitsChange {
    #[serde(default)]
    pub changed: BTreeMap<String, UnitSettingsVersion>,
    #[serde(default)]
    pub departed: Vec<String>,
}

impl RelationUnitsChange {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.departed.is_empty()
    }
}

/// Life and suspension state of a relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationStatusChange {
    pub key: RelationKey,
    pub life: Life,
    #[serde(default)]
    pub suspended: bool,
}

/// Server-side watcher id plus its initial snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchResult<T> {
    pub watcher_id: String,
    pub changes: T,
}

pub type RelationUnitsWatchResult = BatchResult<WatchResult<RelationUnitsChange>>;
pub type StringsWatchResult = BatchResult<WatchResult<Vec<String>>>;
pub type RelationStatusWatchResult = BatchResult<WatchResult<Vec<RelationStatusChange>>>;

/// Association of a local tag with a token in some model's token table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntityTokenArg {
    pub tag: Tag,
    pub id: RemoteEntityId,
}

/// Request for the token of a tag within a model's token table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetTokenArg {
    pub model_uuid: ModelUuid,
    pub tag: Tag,
}

/// A local relation unit addressed by tags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationUnitArg {
    pub relation: Tag,
    pub unit: Tag,
}

/// Credential to retain for subsequent calls on a relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveCredentialArg {
    pub relation: Tag,
    pub credential: Credential,
}

/// Consuming-side view of a remote application proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteApplicationInfo {
    pub name: String,
    pub offer_name: String,
    pub model_uuid: ModelUuid,
    pub life: Life,
    pub is_consumer_proxy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,
}

/// A relation involving a remote application, as seen locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRelation {
    pub id: u64,
    pub life: Life,
    pub key: RelationKey,
    pub application_name: String,
    pub remote_application_name: String,
    pub remote_endpoint_name: String,
    pub source_model_uuid: ModelUuid,
    pub endpoint: Endpoint,
}
