//! In-memory model store implementing every backend capability.
//!
//! State lives behind one async mutex; watchers subscribe under the same
//! lock that computes their initial snapshot so no change is missed.

use async_lock::Mutex;
use async_trait::async_trait;
use cmr_core::params::{
    Credential, RelationStatusChange, RelationUnitsChange, Settings, UnitSettingsVersion,
};
use cmr_core::state::{
    AddRemoteApplicationParams, ApplicationInfo, ApplicationOffer, ExportedToken, ModelBackend,
    OfferBackend, OfferConnection, RelationBackend, RelationInfo, RemoteApplicationState,
    RemoteEntityBackend, UnitInfo,
};
use cmr_core::{
    unit_application, CmrError, Endpoint, Life, ModelUuid, RelationKey, RemoteEntityId, Result,
    Tag, Watcher,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

/// In-memory model store for tests
#[derive(Debug, Clone)]
pub struct MemoryState {
    model_uuid: ModelUuid,
    capacity: usize,
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    applications: BTreeMap<String, ApplicationInfo>,
    units: BTreeMap<String, UnitInfo>,
    next_unit: BTreeMap<String, u32>,
    machines: BTreeSet<String>,
    remote_applications: BTreeMap<String, RemoteApplicationState>,
    relations: BTreeMap<RelationKey, RelationRecord>,
    next_relation_id: u64,
    tokens: BTreeMap<(ModelUuid, String), Tag>,
    tags: BTreeMap<(ModelUuid, Tag), String>,
    offers: BTreeMap<String, ApplicationOffer>,
    offer_connections: BTreeMap<RelationKey, OfferConnection>,
    relation_credentials: BTreeMap<RelationKey, Credential>,
    ingress_networks: BTreeMap<RelationKey, Vec<String>>,
    subscribers: Subscribers,
}

#[derive(Debug)]
struct RelationRecord {
    info: RelationInfo,
    scope: BTreeMap<String, ScopedUnit>,
}

#[derive(Debug, Clone)]
struct ScopedUnit {
    settings: Settings,
    version: i64,
}

#[derive(Debug, Default)]
struct Subscribers {
    relation_units: Vec<(RelationKey, String, UnboundedSender<RelationUnitsChange>)>,
    relation_status: Vec<(RelationKey, UnboundedSender<Vec<RelationStatusChange>>)>,
    application_relations: Vec<(String, UnboundedSender<Vec<String>>)>,
    remote_applications: Vec<UnboundedSender<Vec<String>>>,
    remote_relations: Vec<UnboundedSender<Vec<String>>>,
    machines: Vec<(String, UnboundedSender<()>)>,
}

fn status_of(info: &RelationInfo) -> RelationStatusChange {
    RelationStatusChange {
        key: info.key.clone(),
        life: info.life,
        suspended: info.suspended,
    }
}

impl Subscribers {
    fn scope_changed(&mut self, key: &RelationKey, application: &str, change: RelationUnitsChange) {
        self.relation_units.retain(|(k, app, tx)| {
            k != key || app != application || tx.send(change.clone()).is_ok()
        });
    }

    fn relation_changed(&mut self, info: &RelationInfo) {
        let status = vec![status_of(info)];
        self.relation_status
            .retain(|(k, tx)| k != &info.key || tx.send(status.clone()).is_ok());
        let keys = vec![info.key.to_string()];
        self.application_relations
            .retain(|(app, tx)| !info.key.involves(app) || tx.send(keys.clone()).is_ok());
    }

    fn remote_relation_changed(&mut self, key: &RelationKey) {
        let keys = vec![key.to_string()];
        self.remote_relations
            .retain(|tx| tx.send(keys.clone()).is_ok());
    }

    fn remote_application_changed(&mut self, name: &str) {
        let names = vec![name.to_string()];
        self.remote_applications
            .retain(|tx| tx.send(names.clone()).is_ok());
    }

    fn machine_changed(&mut self, machine: &str) {
        self.machines
            .retain(|(m, tx)| m != machine || tx.send(()).is_ok());
    }
}

impl Inner {
    fn relation(&self, key: &RelationKey) -> Result<&RelationRecord> {
        self.relations
            .get(key)
            .ok_or_else(|| CmrError::not_found(format!("relation \"{key}\"")))
    }

    fn relation_mut(&mut self, key: &RelationKey) -> Result<&mut RelationRecord> {
        self.relations
            .get_mut(key)
            .ok_or_else(|| CmrError::not_found(format!("relation \"{key}\"")))
    }

    fn relation_count(&self, application: &str) -> usize {
        self.relations
            .keys()
            .filter(|key| key.involves(application))
            .count()
    }

    fn remote_application(&self, name: &str) -> Result<RemoteApplicationState> {
        let mut app = self
            .remote_applications
            .get(name)
            .cloned()
            .ok_or_else(|| CmrError::not_found(format!("remote application {name:?}")))?;
        app.relation_count = self.relation_count(name);
        Ok(app)
    }

    fn involves_remote_application(&self, key: &RelationKey) -> bool {
        key.endpoints()
            .iter()
            .any(|(app, _)| self.remote_applications.contains_key(*app))
    }

    fn relation_changed(&mut self, info: &RelationInfo) {
        self.subscribers.relation_changed(info);
        if self.involves_remote_application(&info.key) {
            self.subscribers.remote_relation_changed(&info.key);
        }
    }

    fn application_exists(&self, name: &str) -> bool {
        self.applications.contains_key(name) || self.remote_applications.contains_key(name)
    }

    fn forget_tag(&mut self, tag: &Tag) {
        let stale: Vec<(ModelUuid, Tag)> = self
            .tags
            .keys()
            .filter(|(_, t)| t == tag)
            .cloned()
            .collect();
        for (model, tag) in stale {
            if let Some(token) = self.tags.remove(&(model, tag)) {
                self.tokens.remove(&(model, token));
            }
        }
    }

    fn remove_relation(&mut self, key: &RelationKey) {
        let Some(mut record) = self.relations.remove(key) else {
            return;
        };
        record.info.life = Life::Dead;
        self.relation_changed(&record.info);
        self.forget_tag(&key.tag());
        self.offer_connections.remove(key);
        self.relation_credentials.remove(key);
        self.ingress_networks.remove(key);

        let orphaned: Vec<String> = self
            .remote_applications
            .values()
            .filter(|app| !app.life.is_alive() && key.involves(&app.name))
            .map(|app| app.name.clone())
            .collect();
        for name in orphaned {
            if self.relation_count(&name) == 0 {
                self.remove_remote_application(&name);
            }
        }
        tracing::debug!(relation = %key, "relation removed");
    }

    fn remove_remote_application(&mut self, name: &str) {
        self.remote_applications.remove(name);
        self.forget_tag(&Tag::Application(name.to_string()));
        self.subscribers.remote_application_changed(name);
    }
}

/// Watcher delivering `initial` and then everything sent on `rx`
fn forward<T: Send + 'static>(
    capacity: usize,
    initial: T,
    mut rx: UnboundedReceiver<T>,
) -> Watcher<T> {
    Watcher::spawn(capacity, move |mut sink| async move {
        if !sink.send(initial).await {
            return Ok(());
        }
        loop {
            tokio::select! {
                change = rx.recv() => match change {
                    Some(change) => {
                        if !sink.send(change).await {
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                },
                _ = sink.dying() => return Ok(()),
            }
        }
    })
}

impl MemoryState {
    pub fn new(model_uuid: ModelUuid) -> Self {
        Self {
            model_uuid,
            capacity: 1,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Buffer size of watchers created by this store
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub async fn add_application(&self, name: &str, endpoints: Vec<Endpoint>) {
        let mut inner = self.inner.lock().await;
        inner.applications.insert(
            name.to_string(),
            ApplicationInfo {
                name: name.to_string(),
                life: Life::Alive,
                endpoints,
            },
        );
    }

    /// Add the next unit of `application`, returning its name
    pub async fn add_unit(
        &self,
        application: &str,
        machine_id: Option<&str>,
        public_address: Option<&str>,
    ) -> String {
        let mut inner = self.inner.lock().await;
        let number = inner.next_unit.entry(application.to_string()).or_insert(0);
        let name = cmr_core::unit_name(application, *number);
        *number += 1;
        if let Some(machine) = machine_id {
            inner.machines.insert(machine.to_string());
        }
        inner.units.insert(
            name.clone(),
            UnitInfo {
                name: name.clone(),
                application: application.to_string(),
                life: Life::Alive,
                machine_id: machine_id.map(str::to_string),
                public_address: public_address.map(str::to_string),
            },
        );
        name
    }

    pub async fn remove_unit(&self, name: &str) {
        self.inner.lock().await.units.remove(name);
    }

    pub async fn set_unit_public_address(&self, unit: &str, address: Option<&str>) {
        let mut inner = self.inner.lock().await;
        if let Some(unit) = inner.units.get_mut(unit) {
            unit.public_address = address.map(str::to_string);
        }
    }

    /// Give every unit on `machine` the address and notify machine watchers
    pub async fn set_machine_address(&self, machine: &str, address: &str) {
        let mut inner = self.inner.lock().await;
        for unit in inner.units.values_mut() {
            if unit.machine_id.as_deref() == Some(machine) {
                unit.public_address = Some(address.to_string());
            }
        }
        inner.subscribers.machine_changed(machine);
    }

    /// Notify machine watchers without changing anything
    pub async fn notify_machine(&self, machine: &str) {
        self.inner.lock().await.subscribers.machine_changed(machine);
    }

    /// Offer `application`; endpoint pairs map offer names to application names
    pub async fn add_offer(&self, offer_name: &str, application: &str, endpoints: &[(&str, &str)]) {
        let mut inner = self.inner.lock().await;
        inner.offers.insert(
            offer_name.to_string(),
            ApplicationOffer {
                offer_name: offer_name.to_string(),
                application_name: application.to_string(),
                endpoints: endpoints
                    .iter()
                    .map(|(offer, app)| (offer.to_string(), app.to_string()))
                    .collect(),
            },
        );
    }

    pub async fn set_relation_suspended(&self, key: &RelationKey, suspended: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let record = inner.relation_mut(key)?;
        record.info.suspended = suspended;
        let info = record.info.clone();
        inner.relation_changed(&info);
        Ok(())
    }

    pub async fn relations(&self) -> Vec<RelationInfo> {
        let inner = self.inner.lock().await;
        inner.relations.values().map(|r| r.info.clone()).collect()
    }

    /// Units currently in the relation's scope
    pub async fn units_in_scope(&self, key: &RelationKey) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner
            .relations
            .get(key)
            .map(|r| r.scope.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Every `(model, token, tag)` row of the token table
    pub async fn remote_entities(&self) -> Vec<(ModelUuid, String, Tag)> {
        let inner = self.inner.lock().await;
        inner
            .tokens
            .iter()
            .map(|((model, token), tag)| (*model, token.clone(), tag.clone()))
            .collect()
    }

    pub async fn offer_connections(&self) -> Vec<OfferConnection> {
        let inner = self.inner.lock().await;
        inner.offer_connections.values().cloned().collect()
    }

    pub async fn remote_applications(&self) -> Vec<RemoteApplicationState> {
        let inner = self.inner.lock().await;
        inner
            .remote_applications
            .keys()
            .filter_map(|name| inner.remote_application(name).ok())
            .collect()
    }
}

#[async_trait]
impl ModelBackend for MemoryState {
    fn model_uuid(&self) -> ModelUuid {
        self.model_uuid
    }

    async fn application(&self, name: &str) -> Result<ApplicationInfo> {
        let inner = self.inner.lock().await;
        inner
            .applications
            .get(name)
            .cloned()
            .ok_or_else(|| CmrError::not_found(format!("application {name:?}")))
    }

    async fn all_units(&self, application: &str) -> Result<Vec<UnitInfo>> {
        let inner = self.inner.lock().await;
        if !inner.applications.contains_key(application) {
            return Err(CmrError::not_found(format!("application {application:?}")));
        }
        Ok(inner
            .units
            .values()
            .filter(|unit| unit.application == application)
            .cloned()
            .collect())
    }

    async fn unit(&self, name: &str) -> Result<UnitInfo> {
        let inner = self.inner.lock().await;
        inner
            .units
            .get(name)
            .cloned()
            .ok_or_else(|| CmrError::not_found(format!("unit {name:?}")))
    }

    async fn watch_machine_addresses(&self, machine_id: &str) -> Result<Watcher<()>> {
        let mut inner = self.inner.lock().await;
        if !inner.machines.contains(machine_id) {
            return Err(CmrError::not_found(format!("machine {machine_id:?}")));
        }
        let (tx, rx) = unbounded_channel();
        inner.subscribers.machines.push((machine_id.to_string(), tx));
        Ok(forward(self.capacity, (), rx))
    }

    async fn remote_application(&self, name: &str) -> Result<RemoteApplicationState> {
        self.inner.lock().await.remote_application(name)
    }

    async fn add_remote_application(
        &self,
        params: AddRemoteApplicationParams,
    ) -> Result<RemoteApplicationState> {
        let mut inner = self.inner.lock().await;
        if inner.application_exists(&params.name) {
            return Err(CmrError::already_exists(format!(
                "application {:?}",
                params.name
            )));
        }
        let app = RemoteApplicationState {
            name: params.name.clone(),
            source_model_uuid: params.source_model_uuid,
            offer_name: params.offer_name,
            endpoints: params.endpoints,
            is_consumer_proxy: params.is_consumer_proxy,
            life: Life::Alive,
            relation_count: 0,
            credential: params.credential,
        };
        inner
            .remote_applications
            .insert(params.name.clone(), app.clone());
        inner.subscribers.remote_application_changed(&params.name);
        Ok(app)
    }

    async fn destroy_remote_application(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let in_use = inner.relation_count(name) > 0;
        let app = inner
            .remote_applications
            .get_mut(name)
            .ok_or_else(|| CmrError::not_found(format!("remote application {name:?}")))?;
        if in_use {
            app.life = Life::Dying;
            inner.subscribers.remote_application_changed(name);
        } else {
            inner.remove_remote_application(name);
        }
        Ok(())
    }

    async fn watch_remote_applications(&self) -> Result<Watcher<Vec<String>>> {
        let mut inner = self.inner.lock().await;
        let initial = inner.remote_applications.keys().cloned().collect();
        let (tx, rx) = unbounded_channel();
        inner.subscribers.remote_applications.push(tx);
        Ok(forward(self.capacity, initial, rx))
    }
}

#[async_trait]
impl RemoteEntityBackend for MemoryState {
    async fn export_local_entity(&self, tag: &Tag) -> Result<ExportedToken> {
        let mut inner = self.inner.lock().await;
        let model = self.model_uuid;
        if let Some(token) = inner.tags.get(&(model, tag.clone())) {
            return Ok(ExportedToken {
                token: token.clone(),
                already_existed: true,
            });
        }
        let token = Uuid::new_v4().to_string();
        inner.tags.insert((model, tag.clone()), token.clone());
        inner.tokens.insert((model, token.clone()), tag.clone());
        Ok(ExportedToken {
            token,
            already_existed: false,
        })
    }

    async fn import_remote_entity(&self, id: &RemoteEntityId, tag: &Tag) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.tokens.contains_key(&(id.model_uuid, id.token.clone()))
            || inner.tags.contains_key(&(id.model_uuid, tag.clone()))
        {
            return Err(CmrError::already_exists(format!("token for {tag}")));
        }
        inner
            .tokens
            .insert((id.model_uuid, id.token.clone()), tag.clone());
        inner
            .tags
            .insert((id.model_uuid, tag.clone()), id.token.clone());
        Ok(())
    }

    async fn get_remote_entity(&self, id: &RemoteEntityId) -> Result<Tag> {
        let inner = self.inner.lock().await;
        inner
            .tokens
            .get(&(id.model_uuid, id.token.clone()))
            .cloned()
            .ok_or_else(|| CmrError::not_found(format!("token {:?}", id.token)))
    }

    async fn get_token(&self, model_uuid: &ModelUuid, tag: &Tag) -> Result<String> {
        let inner = self.inner.lock().await;
        inner
            .tags
            .get(&(*model_uuid, tag.clone()))
            .cloned()
            .ok_or_else(|| CmrError::not_found(format!("token for {tag}")))
    }

    async fn remove_remote_entity(&self, model_uuid: &ModelUuid, tag: &Tag) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let token = inner
            .tags
            .remove(&(*model_uuid, tag.clone()))
            .ok_or_else(|| CmrError::not_found(format!("token for {tag}")))?;
        inner.tokens.remove(&(*model_uuid, token));
        Ok(())
    }
}

#[async_trait]
impl RelationBackend for MemoryState {
    async fn key_relation(&self, key: &RelationKey) -> Result<RelationInfo> {
        let inner = self.inner.lock().await;
        Ok(inner.relation(key)?.info.clone())
    }

    async fn add_relation(&self, endpoints: &[Endpoint]) -> Result<RelationInfo> {
        let key = RelationKey::from_endpoints(endpoints)?;
        let mut inner = self.inner.lock().await;
        if inner.relations.contains_key(&key) {
            return Err(CmrError::already_exists(format!("relation \"{key}\"")));
        }
        for ep in endpoints {
            if !inner.application_exists(&ep.application_name) {
                return Err(CmrError::not_found(format!(
                    "application {:?}",
                    ep.application_name
                )));
            }
        }
        if let [a, b] = endpoints {
            if !a.can_relate_to(b) {
                return Err(CmrError::not_valid(format!(
                    "relation between {} and {}",
                    a.descriptor(),
                    b.descriptor()
                )));
            }
        }
        let info = RelationInfo {
            id: inner.next_relation_id,
            key: key.clone(),
            life: Life::Alive,
            suspended: false,
            endpoints: endpoints.to_vec(),
        };
        inner.next_relation_id += 1;
        inner.relations.insert(
            key,
            RelationRecord {
                info: info.clone(),
                scope: BTreeMap::new(),
            },
        );
        inner.relation_changed(&info);
        Ok(info)
    }

    async fn destroy_relation(&self, key: &RelationKey) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let record = inner.relation_mut(key)?;
        if record.scope.is_empty() {
            inner.remove_relation(key);
            return Ok(());
        }
        if record.info.life.is_alive() {
            record.info.life = Life::Dying;
            let info = record.info.clone();
            inner.relation_changed(&info);
        }
        Ok(())
    }

    async fn relation_unit_in_scope(&self, key: &RelationKey, unit: &str) -> Result<bool> {
        let inner = self.inner.lock().await;
        Ok(inner.relation(key)?.scope.contains_key(unit))
    }

    async fn enter_scope(&self, key: &RelationKey, unit: &str, settings: Settings) -> Result<()> {
        let application = unit_application(unit)?.to_string();
        let mut inner = self.inner.lock().await;
        let record = inner.relation_mut(key)?;
        if !record.info.life.is_alive() {
            return Err(CmrError::not_valid(format!(
                "entering scope of {} relation \"{key}\"",
                record.info.life
            )));
        }
        if record.info.endpoint(&application).is_none() {
            return Err(CmrError::not_valid(format!(
                "unit {unit:?} in relation \"{key}\""
            )));
        }
        if record.scope.contains_key(unit) {
            return Err(CmrError::already_exists(format!(
                "unit {unit:?} in scope of \"{key}\""
            )));
        }
        record.scope.insert(
            unit.to_string(),
            ScopedUnit {
                settings,
                version: 0,
            },
        );
        let change = RelationUnitsChange {
            changed: BTreeMap::from([(unit.to_string(), UnitSettingsVersion { version: 0 })]),
            departed: Vec::new(),
        };
        inner.subscribers.scope_changed(key, &application, change);
        Ok(())
    }

    async fn replace_settings(
        &self,
        key: &RelationKey,
        unit: &str,
        settings: Settings,
    ) -> Result<()> {
        let application = unit_application(unit)?.to_string();
        let mut inner = self.inner.lock().await;
        let record = inner.relation_mut(key)?;
        let scoped = record
            .scope
            .get_mut(unit)
            .ok_or_else(|| CmrError::not_found(format!("unit {unit:?} in scope of \"{key}\"")))?;
        scoped.settings = settings;
        scoped.version += 1;
        let change = RelationUnitsChange {
            changed: BTreeMap::from([(
                unit.to_string(),
                UnitSettingsVersion {
                    version: scoped.version,
                },
            )]),
            departed: Vec::new(),
        };
        inner.subscribers.scope_changed(key, &application, change);
        Ok(())
    }

    async fn leave_scope(&self, key: &RelationKey, unit: &str) -> Result<()> {
        let application = unit_application(unit)?.to_string();
        let mut inner = self.inner.lock().await;
        let record = inner.relation_mut(key)?;
        if record.scope.remove(unit).is_none() {
            return Err(CmrError::not_found(format!(
                "unit {unit:?} in scope of \"{key}\""
            )));
        }
        let drained = record.scope.is_empty() && !record.info.life.is_alive();
        let change = RelationUnitsChange {
            changed: BTreeMap::new(),
            departed: vec![unit.to_string()],
        };
        inner.subscribers.scope_changed(key, &application, change);
        if drained {
            inner.remove_relation(key);
        }
        Ok(())
    }

    async fn relation_unit_settings(&self, key: &RelationKey, unit: &str) -> Result<Settings> {
        let inner = self.inner.lock().await;
        inner
            .relation(key)?
            .scope
            .get(unit)
            .map(|scoped| scoped.settings.clone())
            .ok_or_else(|| CmrError::not_found(format!("settings for {unit:?} in \"{key}\"")))
    }

    async fn watch_relation_units(
        &self,
        key: &RelationKey,
        application: &str,
    ) -> Result<Watcher<RelationUnitsChange>> {
        let mut inner = self.inner.lock().await;
        let record = inner.relation(key)?;
        let changed = record
            .scope
            .iter()
            .filter(|(unit, _)| {
                unit_application(unit).map(|app| app == application).unwrap_or(false)
            })
            .map(|(unit, scoped)| {
                (
                    unit.clone(),
                    UnitSettingsVersion {
                        version: scoped.version,
                    },
                )
            })
            .collect();
        let (tx, rx) = unbounded_channel();
        inner
            .subscribers
            .relation_units
            .push((key.clone(), application.to_string(), tx));
        let initial = RelationUnitsChange {
            changed,
            departed: Vec::new(),
        };
        Ok(forward(self.capacity, initial, rx))
    }

    async fn watch_relation_status(
        &self,
        key: &RelationKey,
    ) -> Result<Watcher<Vec<RelationStatusChange>>> {
        let mut inner = self.inner.lock().await;
        let initial = vec![status_of(&inner.relation(key)?.info)];
        let (tx, rx) = unbounded_channel();
        inner.subscribers.relation_status.push((key.clone(), tx));
        Ok(forward(self.capacity, initial, rx))
    }

    async fn watch_application_relations(
        &self,
        application: &str,
    ) -> Result<Watcher<Vec<String>>> {
        let mut inner = self.inner.lock().await;
        if !inner.application_exists(application) {
            return Err(CmrError::not_found(format!("application {application:?}")));
        }
        let initial = inner
            .relations
            .keys()
            .filter(|key| key.involves(application))
            .map(RelationKey::to_string)
            .collect();
        let (tx, rx) = unbounded_channel();
        inner
            .subscribers
            .application_relations
            .push((application.to_string(), tx));
        Ok(forward(self.capacity, initial, rx))
    }

    async fn watch_remote_relations(&self) -> Result<Watcher<Vec<String>>> {
        let mut inner = self.inner.lock().await;
        let initial = inner
            .relations
            .keys()
            .filter(|key| inner.involves_remote_application(key))
            .map(RelationKey::to_string)
            .collect();
        let (tx, rx) = unbounded_channel();
        inner.subscribers.remote_relations.push(tx);
        Ok(forward(self.capacity, initial, rx))
    }

    async fn save_ingress_networks(&self, key: &RelationKey, cidrs: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.relation(key)?;
        inner.ingress_networks.insert(key.clone(), cidrs.to_vec());
        Ok(())
    }

    async fn ingress_networks(&self, key: &RelationKey) -> Result<Vec<String>> {
        let inner = self.inner.lock().await;
        inner
            .ingress_networks
            .get(key)
            .cloned()
            .ok_or_else(|| CmrError::not_found(format!("ingress networks for \"{key}\"")))
    }
}

#[async_trait]
impl OfferBackend for MemoryState {
    async fn application_offer(&self, offer_name: &str) -> Result<ApplicationOffer> {
        let inner = self.inner.lock().await;
        inner
            .offers
            .get(offer_name)
            .cloned()
            .ok_or_else(|| CmrError::not_found(format!("offer {offer_name:?}")))
    }

    async fn add_offer_connection(&self, connection: OfferConnection) -> Result<OfferConnection> {
        let mut inner = self.inner.lock().await;
        if inner.offer_connections.contains_key(&connection.relation_key) {
            return Err(CmrError::already_exists(format!(
                "offer connection for \"{}\"",
                connection.relation_key
            )));
        }
        inner
            .offer_connections
            .insert(connection.relation_key.clone(), connection.clone());
        Ok(connection)
    }

    async fn offer_connection_for_relation(&self, key: &RelationKey) -> Result<OfferConnection> {
        let inner = self.inner.lock().await;
        inner
            .offer_connections
            .get(key)
            .cloned()
            .ok_or_else(|| CmrError::not_found(format!("offer connection for \"{key}\"")))
    }

    async fn save_relation_credential(
        &self,
        key: &RelationKey,
        credential: Credential,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.relation(key)?;
        inner.relation_credentials.insert(key.clone(), credential);
        Ok(())
    }

    async fn relation_credential(&self, key: &RelationKey) -> Result<Credential> {
        let inner = self.inner.lock().await;
        inner
            .relation_credentials
            .get(key)
            .cloned()
            .ok_or_else(|| CmrError::not_found(format!("credential for \"{key}\"")))
    }
}
