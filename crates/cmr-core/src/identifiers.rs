//! Identifiers for models, entities, relations and offers.
//!
//! Tags are the canonical local names for entities. They never cross a model
//! boundary directly; remote models refer to entities by [`RemoteEntityId`]
//! tokens instead.

use crate::errors::{CmrError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelUuid(pub Uuid);

impl ModelUuid {
    /// Create a new random model UUID
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID
    pub fn uuid(&self) -> Uuid {
        self.0
    }

    /// Tag naming this model
    pub fn tag(&self) -> Tag {
        Tag::Model(*self)
    }
}

impl fmt::Display for ModelUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ModelUuid {
    type Err = CmrError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| CmrError::not_valid(format!("model UUID {s:?}")))
    }
}

impl From<Uuid> for ModelUuid {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Lifecycle of an entity; only ever moves forward
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Life {
    #[default]
    Alive,
    Dying,
    Dead,
}

impl Life {
    pub fn is_alive(&self) -> bool {
        matches!(self, Life::Alive)
    }
}

impl fmt::Display for Life {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Life::Alive => "alive",
            Life::Dying => "dying",
            Life::Dead => "dead",
        })
    }
}

/// Role an endpoint plays in a relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Provider,
    Requirer,
    Peer,
}

impl Role {
    /// The role an endpoint must have to relate to this one
    pub fn counterpart(&self) -> Role {
        match self {
            Role::Provider => Role::Requirer,
            Role::Requirer => Role::Provider,
            Role::Peer => Role::Peer,
        }
    }
}

/// Scope of a relation endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationScope {
    #[default]
    Global,
    Container,
}

/// A named relation endpoint of an application
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub application_name: String,
    pub name: String,
    pub role: Role,
    pub interface: String,
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub scope: RelationScope,
}

impl Endpoint {
    /// Whether this endpoint can form a relation with `other`
    pub fn can_relate_to(&self, other: &Endpoint) -> bool {
        self.interface == other.interface
            && self.role != Role::Peer
            && self.role.counterpart() == other.role
            && self.application_name != other.application_name
    }

    /// `app:endpoint` form used in relation keys
    pub fn descriptor(&self) -> String {
        format!("{}:{}", self.application_name, self.name)
    }
}

/// Canonical string naming a relation by its endpoints
///
/// Formatted `"app:endpoint app:endpoint"`, providers before requirers and
/// then ordered by application name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelationKey(String);

impl RelationKey {
    /// Build the key for a relation between the given endpoints
    pub fn from_endpoints(endpoints: &[Endpoint]) -> Result<Self> {
        match endpoints {
            [peer] if peer.role == Role::Peer => Ok(Self(peer.descriptor())),
            [a, b] => {
                let mut ordered = [a, b];
                ordered.sort_by(|x, y| {
                    x.role
                        .cmp(&y.role)
                        .then_with(|| x.application_name.cmp(&y.application_name))
                });
                Ok(Self(format!(
                    "{} {}",
                    ordered[0].descriptor(),
                    ordered[1].descriptor()
                )))
            }
            _ => Err(CmrError::not_valid(format!(
                "relation with {} endpoints",
                endpoints.len()
            ))),
        }
    }

    /// Parse and validate a relation key
    pub fn parse(key: &str) -> Result<Self> {
        let parts: Vec<&str> = key.split(' ').collect();
        if parts.is_empty() || parts.len() > 2 {
            return Err(CmrError::not_valid(format!("relation key {key:?}")));
        }
        for part in &parts {
            match part.split_once(':') {
                Some((app, endpoint))
                    if is_valid_application_name(app) && is_valid_endpoint_name(endpoint) => {}
                _ => return Err(CmrError::not_valid(format!("relation key {key:?}"))),
            }
        }
        Ok(Self(key.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `(application, endpoint)` pairs in key order
    pub fn endpoints(&self) -> Vec<(&str, &str)> {
        self.0
            .split(' ')
            .filter_map(|part| part.split_once(':'))
            .collect()
    }

    /// Whether one of the key's endpoints belongs to `application`
    pub fn involves(&self, application: &str) -> bool {
        self.endpoints().iter().any(|(app, _)| *app == application)
    }

    /// Tag naming this relation
    pub fn tag(&self) -> Tag {
        Tag::Relation(self.clone())
    }
}

impl fmt::Display for RelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RelationKey {
    type Err = CmrError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RelationKey {
    type Error = CmrError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<RelationKey> for String {
    fn from(key: RelationKey) -> Self {
        key.0
    }
}

/// Local name of an entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Tag {
    Model(ModelUuid),
    Application(String),
    Unit(String),
    Relation(RelationKey),
    Machine(String),
}

impl Tag {
    /// Tag for a validated application name
    pub fn application(name: &str) -> Result<Self> {
        if !is_valid_application_name(name) {
            return Err(CmrError::not_valid(format!("application name {name:?}")));
        }
        Ok(Tag::Application(name.to_string()))
    }

    /// Tag for a validated unit name
    pub fn unit(name: &str) -> Result<Self> {
        unit_number(name)?;
        Ok(Tag::Unit(name.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Tag::Model(_) => "model",
            Tag::Application(_) => "application",
            Tag::Unit(_) => "unit",
            Tag::Relation(_) => "relation",
            Tag::Machine(_) => "machine",
        }
    }

    /// Entity id without the kind prefix
    pub fn id(&self) -> String {
        match self {
            Tag::Model(uuid) => uuid.to_string(),
            Tag::Application(name) | Tag::Unit(name) | Tag::Machine(name) => name.clone(),
            Tag::Relation(key) => key.to_string(),
        }
    }

    /// Parse a tag, requiring the given kind
    pub fn parse_kind(s: &str, kind: &str) -> Result<Self> {
        let tag: Tag = s.parse()?;
        if tag.kind() != kind {
            return Err(CmrError::not_valid(format!("{kind} tag {s:?}")));
        }
        Ok(tag)
    }

    pub fn as_relation_key(&self) -> Option<&RelationKey> {
        match self {
            Tag::Relation(key) => Some(key),
            _ => None,
        }
    }

    pub fn as_application(&self) -> Option<&str> {
        match self {
            Tag::Application(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Model(uuid) => write!(f, "model-{uuid}"),
            Tag::Application(name) => write!(f, "application-{name}"),
            Tag::Unit(name) => write!(f, "unit-{}", name.replace('/', "-")),
            Tag::Relation(key) => write!(
                f,
                "relation-{}",
                key.as_str().replace(':', ".").replace(' ', "#")
            ),
            Tag::Machine(id) => write!(f, "machine-{}", id.replace('/', "-")),
        }
    }
}

impl FromStr for Tag {
    type Err = CmrError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CmrError::not_valid(format!("tag {s:?}"));
        let (kind, id) = s.split_once('-').ok_or_else(invalid)?;
        match kind {
            "model" => Ok(Tag::Model(id.parse().map_err(|_| invalid())?)),
            "application" => Tag::application(id).map_err(|_| invalid()),
            "unit" => {
                let (app, number) = id.rsplit_once('-').ok_or_else(invalid)?;
                Tag::unit(&format!("{app}/{number}")).map_err(|_| invalid())
            }
            "relation" => {
                let key = id.replace('.', ":").replace('#', " ");
                Ok(Tag::Relation(RelationKey::parse(&key).map_err(|_| invalid())?))
            }
            "machine" => {
                let machine = id.replace('-', "/");
                if machine.is_empty() || machine.split('/').any(str::is_empty) {
                    return Err(invalid());
                }
                Ok(Tag::Machine(machine))
            }
            _ => Err(invalid()),
        }
    }
}

impl TryFrom<String> for Tag {
    type Error = CmrError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Tag> for String {
    fn from(tag: Tag) -> Self {
        tag.to_string()
    }
}

/// A token qualified by the model whose token table issued or imported it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemoteEntityId {
    pub model_uuid: ModelUuid,
    pub token: String,
}

impl RemoteEntityId {
    pub fn new(model_uuid: ModelUuid, token: impl Into<String>) -> Self {
        Self {
            model_uuid,
            token: token.into(),
        }
    }
}

impl fmt::Display for RemoteEntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.model_uuid, self.token)
    }
}

/// URL of an application offer: `[controller:][user/]model.offer`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OfferUrl {
    pub controller: Option<String>,
    pub user: Option<String>,
    pub model: String,
    pub name: String,
}

impl OfferUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = || CmrError::not_valid(format!("offer URL {url:?}"));
        let (controller, rest) = match url.split_once(':') {
            Some((controller, rest)) if !controller.is_empty() => {
                (Some(controller.to_string()), rest)
            }
            Some(_) => return Err(invalid()),
            None => (None, url),
        };
        let (user, rest) = match rest.split_once('/') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some(_) => return Err(invalid()),
            None => (None, rest),
        };
        let (model, name) = rest.split_once('.').ok_or_else(invalid)?;
        if model.is_empty() || !is_valid_application_name(name) {
            return Err(invalid());
        }
        Ok(Self {
            controller,
            user,
            model: model.to_string(),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for OfferUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(controller) = &self.controller {
            write!(f, "{controller}:")?;
        }
        if let Some(user) = &self.user {
            write!(f, "{user}/")?;
        }
        write!(f, "{}.{}", self.model, self.name)
    }
}

impl TryFrom<String> for OfferUrl {
    type Error = CmrError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<OfferUrl> for String {
    fn from(url: OfferUrl) -> Self {
        url.to_string()
    }
}

pub fn is_valid_application_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.ends_with('-')
        && !name.contains("--")
}

pub fn is_valid_endpoint_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

/// Offering-side name of the proxy for a consumer's application token
pub fn consumer_proxy_name(application_token: &str) -> String {
    format!("remote-{}", application_token.replace('-', ""))
}

/// Name of unit `number` of `application`
pub fn unit_name(application: &str, number: u32) -> String {
    format!("{application}/{number}")
}

/// Numeric suffix of a unit name
pub fn unit_number(name: &str) -> Result<u32> {
    let invalid = || CmrError::not_valid(format!("unit name {name:?}"));
    let (app, number) = name.split_once('/').ok_or_else(invalid)?;
    if !is_valid_application_name(app) || (number.len() > 1 && number.starts_with('0')) {
        return Err(invalid());
    }
    number.parse().map_err(|_| invalid())
}

/// Application part of a unit name
pub fn unit_application(name: &str) -> Result<&str> {
    unit_number(name)?;
    name.split_once('/')
        .map(|(app, _)| app)
        .ok_or_else(|| CmrError::not_valid(format!("unit name {name:?}")))
}
