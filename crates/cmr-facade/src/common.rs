//! Apply logic shared by the offering-side and consuming-side facades.

use cmr_authorization::{CredentialContext, DeclaredCaveats};
use cmr_core::params::{Credential, RemoteRelationChangeEvent, Settings, StringSettings};
use cmr_core::state::RelationInfo;
use cmr_core::{unit_name, Backend, CmrError, RelationKey, RemoteEntityId, Result};

/// Resolve a relation token to the local relation key
pub async fn relation_key_for_token<B: Backend + ?Sized>(
    backend: &B,
    id: &RemoteEntityId,
) -> Result<RelationKey> {
    let tag = backend.get_remote_entity(id).await?;
    tag.as_relation_key()
        .cloned()
        .ok_or_else(|| CmrError::not_valid(format!("token {:?} for {tag} as relation", id.token)))
}

/// Resolve an application token to the local application name
pub async fn application_for_token<B: Backend + ?Sized>(
    backend: &B,
    id: &RemoteEntityId,
) -> Result<String> {
    let tag = backend.get_remote_entity(id).await?;
    tag.as_application().map(str::to_string).ok_or_else(|| {
        CmrError::not_valid(format!("token {:?} for {tag} as application", id.token))
    })
}

/// Authorize a relation-scoped request from a consuming model
///
/// The credential must be scoped to `key`, and its holder and the requesting
/// model must be those recorded in the relation's offer connection.
pub async fn authorize_relation<B: Backend + ?Sized>(
    backend: &B,
    ctx: &CredentialContext,
    relation_id: &RemoteEntityId,
    credentials: &[Credential],
    key: &RelationKey,
) -> Result<DeclaredCaveats> {
    let declared = ctx.check_relation_credential(credentials, key)?;
    let connection = match backend.offer_connection_for_relation(key).await {
        Ok(connection) => connection,
        Err(err) if err.is_not_found() => {
            return Err(CmrError::permission_denied(format!(
                "no offer connection for relation \"{key}\""
            )));
        }
        Err(err) => return Err(err),
    };
    if declared.username != connection.username {
        return Err(CmrError::permission_denied(format!(
            "credential for user {:?} on relation \"{key}\" consumed by {:?}",
            declared.username, connection.username
        )));
    }
    if relation_id.model_uuid != connection.source_model_uuid {
        return Err(CmrError::permission_denied(format!(
            "request from model {} on relation \"{key}\" consumed by model {}",
            relation_id.model_uuid, connection.source_model_uuid
        )));
    }
    Ok(declared)
}

/// Name of the relation's endpoint application that lives in this model
pub async fn local_application<B: Backend + ?Sized>(
    backend: &B,
    relation: &RelationInfo,
) -> Result<String> {
    for endpoint in &relation.endpoints {
        match backend.application(&endpoint.application_name).await {
            Ok(app) => return Ok(app.name),
            Err(err) if err.is_not_found() => continue,
            Err(err) => return Err(err),
        }
    }
    Err(CmrError::not_found(format!(
        "local application for relation \"{}\"",
        relation.key
    )))
}

/// Apply a change event published by the other model
///
/// Changes for relations that no longer resolve locally succeed without
/// effect. When `credentials` is given the event must pass
/// [`authorize_relation`].
pub async fn publish_relation_change<B: Backend + ?Sized>(
    backend: &B,
    credentials: Option<&CredentialContext>,
    change: &RemoteRelationChangeEvent,
) -> Result<()> {
    let key = match relation_key_for_token(backend, &change.relation_id).await {
        Ok(key) => key,
        Err(err) if err.is_not_found() => {
            tracing::debug!(token = %change.relation_id.token, "relation token not found, ignoring change");
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    if let Some(ctx) = credentials {
        authorize_relation(backend, ctx, &change.relation_id, &change.credentials, &key)
            .await?;
    }
    let relation = match backend.key_relation(&key).await {
        Ok(relation) => relation,
        Err(err) if err.is_not_found() => {
            tracing::debug!(relation = %key, "relation already removed, ignoring change");
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    tracing::debug!(
        relation = %key,
        life = %change.life,
        departed = change.departed_units.len(),
        changed = change.changed_units.len(),
        "applying remote relation change"
    );

    let application = match application_for_token(backend, &change.application_id).await {
        Ok(application) => Some(application),
        Err(err) if err.is_not_found() => None,
        Err(err) => return Err(err),
    };

    if !change.life.is_alive() {
        tolerate_not_found(backend.destroy_relation(&key).await)?;
        if let Some(application) = &application {
            for unit_id in &change.departed_units {
                let unit = unit_name(application, *unit_id);
                tolerate_not_found(backend.leave_scope(&key, &unit).await)?;
            }
            destroy_orphaned_proxy(backend, application).await?;
        }
        return Ok(());
    }

    let Some(application) = application else {
        tracing::warn!(
            relation = %key,
            token = %change.application_id.token,
            "application token not found, skipping unit changes"
        );
        return Ok(());
    };
    match backend.remote_application(&application).await {
        Ok(_) => {}
        Err(err) if err.is_not_found() => {
            tracing::warn!(relation = %key, application, "remote application not found, skipping unit changes");
            return Ok(());
        }
        Err(err) => return Err(err),
    }

    for unit_id in &change.departed_units {
        let unit = unit_name(&application, *unit_id);
        tracing::debug!(relation = %key, unit, "remote unit left scope");
        tolerate_not_found(backend.leave_scope(&key, &unit).await)?;
    }
    if !relation.life.is_alive() {
        if !change.changed_units.is_empty() {
            tracing::debug!(relation = %key, life = %relation.life, "relation not alive, skipping unit settings");
        }
        return Ok(());
    }
    for changed in &change.changed_units {
        let unit = unit_name(&application, changed.unit_id);
        if backend.relation_unit_in_scope(&key, &unit).await? {
            backend
                .replace_settings(&key, &unit, changed.settings.clone())
                .await?;
        } else {
            tracing::debug!(relation = %key, unit, "remote unit entered scope");
            backend
                .enter_scope(&key, &unit, changed.settings.clone())
                .await?;
        }
    }
    Ok(())
}

async fn destroy_orphaned_proxy<B: Backend + ?Sized>(
    backend: &B,
    application: &str,
) -> Result<()> {
    let proxy = match backend.remote_application(application).await {
        Ok(proxy) => proxy,
        Err(err) if err.is_not_found() => return Ok(()),
        Err(err) => return Err(err),
    };
    if proxy.is_consumer_proxy && proxy.relation_count == 0 {
        tracing::info!(application, "destroying consumer proxy with no relations");
        tolerate_not_found(backend.destroy_remote_application(application).await)?;
    }
    Ok(())
}

/// Settings of a unit in relation scope, which must all be strings
pub async fn relation_unit_settings<B: Backend + ?Sized>(
    backend: &B,
    key: &RelationKey,
    unit: &str,
) -> Result<StringSettings> {
    let settings = backend.relation_unit_settings(key, unit).await?;
    string_settings(settings)
}

fn string_settings(settings: Settings) -> Result<StringSettings> {
    settings
        .into_iter()
        .map(|(key, value)| match value {
            serde_json::Value::String(value) => Ok((key, value)),
            other => Err(CmrError::not_valid(format!(
                "value of relation setting {key:?} (expected string, got {})",
                json_type(&other)
            ))),
        })
        .collect()
}

fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Treat `NotFound` as success
pub fn tolerate_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}

/// Treat `AlreadyExists` as success
pub fn tolerate_already_exists(result: Result<()>) -> Result<()> {
    match result {
        Err(err) if err.is_already_exists() => Ok(()),
        other => other,
    }
}
