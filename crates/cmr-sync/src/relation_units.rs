//! Turns relation scope changes into change events for the other model.

use crate::remote::{LocalModelFacade, RemoteModelFacade};
use crate::worker::{closed_error, Dying};
use async_trait::async_trait;
use cmr_core::params::{
    Credential, RelationUnitsChange, RemoteRelationChangeEvent, RemoteRelationUnit,
    RemoteRelationUnitChange, Settings, StringSettings,
};
use cmr_core::{unit_number, Life, RelationKey, RemoteEntityId, Result, Tag, Watcher};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Where a unit's relation settings are read from
#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn unit_settings(&self, unit: &str) -> Result<Settings>;
}

fn settings_from_strings(settings: StringSettings) -> Settings {
    settings
        .into_iter()
        .map(|(key, value)| (key, serde_json::Value::String(value)))
        .collect()
}

/// Settings of the local application's units
pub struct LocalSettings {
    facade: Arc<dyn LocalModelFacade>,
    key: RelationKey,
}

impl LocalSettings {
    pub fn new(facade: Arc<dyn LocalModelFacade>, key: RelationKey) -> Self {
        Self { facade, key }
    }
}

#[async_trait]
impl SettingsSource for LocalSettings {
    async fn unit_settings(&self, unit: &str) -> Result<Settings> {
        let settings = self.facade.relation_unit_settings(&self.key, unit).await?;
        Ok(settings_from_strings(settings))
    }
}

/// Settings of the offering application's units, read across the model boundary
pub struct RemoteSettings {
    facade: Arc<dyn RemoteModelFacade>,
    relation_id: RemoteEntityId,
    credentials: Vec<Credential>,
}

impl RemoteSettings {
    pub fn new(
        facade: Arc<dyn RemoteModelFacade>,
        relation_id: RemoteEntityId,
        credentials: Vec<Credential>,
    ) -> Self {
        Self {
            facade,
            relation_id,
            credentials,
        }
    }
}

#[async_trait]
impl SettingsSource for RemoteSettings {
    async fn unit_settings(&self, unit: &str) -> Result<Settings> {
        let settings = self
            .facade
            .relation_unit_settings(RemoteRelationUnit {
                relation_id: self.relation_id.clone(),
                unit: Tag::unit(unit)?.to_string(),
                credentials: self.credentials.clone(),
            })
            .await?;
        Ok(settings_from_strings(settings))
    }
}

/// Forwards one relation's scope changes as [`RemoteRelationChangeEvent`]s
///
/// Events carry the tokens and credentials fixed at construction. Changed
/// units are sent with their full current settings; a unit whose settings
/// are already gone is left out, since its departure follows.
pub struct RelationUnitsWorker {
    relation_id: RemoteEntityId,
    application_id: RemoteEntityId,
    credentials: Vec<Credential>,
    settings: Arc<dyn SettingsSource>,
    changes: mpsc::Sender<RemoteRelationChangeEvent>,
}

impl RelationUnitsWorker {
    pub fn new(
        relation_id: RemoteEntityId,
        application_id: RemoteEntityId,
        credentials: Vec<Credential>,
        settings: Arc<dyn SettingsSource>,
        changes: mpsc::Sender<RemoteRelationChangeEvent>,
    ) -> Self {
        Self {
            relation_id,
            application_id,
            credentials,
            settings,
            changes,
        }
    }

    pub async fn run(
        self,
        mut watcher: Watcher<RelationUnitsChange>,
        mut dying: Dying,
    ) -> Result<()> {
        loop {
            let change = tokio::select! {
                _ = dying.wait() => return Ok(()),
                change = watcher.next() => change,
            };
            let Some(change) = change else {
                return Err(closed_error(&mut watcher, "relation units").await);
            };
            if change.is_empty() {
                continue;
            }
            let event = self.event(change).await?;
            tracing::debug!(
                token = %self.relation_id.token,
                changed = event.changed_units.len(),
                departed = event.departed_units.len(),
                "relation units changed"
            );
            tokio::select! {
                _ = dying.wait() => return Ok(()),
                sent = self.changes.send(event) => if sent.is_err() {
                    return Ok(());
                },
            }
        }
    }

    async fn event(&self, change: RelationUnitsChange) -> Result<RemoteRelationChangeEvent> {
        let mut changed_units = Vec::with_capacity(change.changed.len());
        for (unit, version) in &change.changed {
            let settings = match self.settings.unit_settings(unit).await {
                Ok(settings) => settings,
                Err(err) if err.is_not_found() => {
                    tracing::debug!(unit = %unit, "unit left scope before its settings were read");
                    continue;
                }
                Err(err) => return Err(err),
            };
            changed_units.push(RemoteRelationUnitChange {
                unit_id: unit_number(unit)?,
                settings,
                version: version.version,
            });
        }
        let departed_units = change
            .departed
            .iter()
            .map(|unit| unit_number(unit))
            .collect::<Result<Vec<_>>>()?;
        Ok(RemoteRelationChangeEvent {
            relation_id: self.relation_id.clone(),
            application_id: self.application_id.clone(),
            life: Life::Alive,
            departed_units,
            changed_units,
            credentials: self.credentials.clone(),
        })
    }
}
