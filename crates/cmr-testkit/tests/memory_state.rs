//! Lifecycle rules of the in-memory model store.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use assert_matches::assert_matches;
use cmr_core::params::Credential;
use cmr_core::state::{
    AddRemoteApplicationParams, ModelBackend, RelationBackend, RemoteEntityBackend,
};
use cmr_core::{CmrError, Life, ModelUuid, RelationKey, RemoteEntityId, Role, Tag};
use cmr_testkit::{endpoint, settings, MemoryState, ModelFixture};

async fn related() -> (MemoryState, RelationKey) {
    let state = ModelFixture::new().state;
    let wordpress = endpoint("wordpress", "db", Role::Requirer, "mysql");
    let mysql = endpoint("mysql", "db", Role::Provider, "mysql");
    state.add_application("wordpress", vec![wordpress.clone()]).await;
    state
        .add_remote_application(AddRemoteApplicationParams {
            name: "mysql".to_string(),
            source_model_uuid: ModelUuid::new_v4(),
            offer_name: "mysql".to_string(),
            endpoints: vec![mysql.clone()],
            is_consumer_proxy: false,
            credential: Some(Credential("offer".to_string())),
        })
        .await
        .unwrap();
    let relation = state.add_relation(&[wordpress, mysql]).await.unwrap();
    (state, relation.key)
}

#[tokio::test]
async fn test_destroy_with_units_in_scope_marks_dying() {
    let (state, key) = related().await;
    state
        .enter_scope(&key, "wordpress/0", settings(&[("a", "b")]))
        .await
        .unwrap();
    state.destroy_relation(&key).await.unwrap();
    assert_eq!(state.key_relation(&key).await.unwrap().life, Life::Dying);

    // A dying relation admits no new units and goes with its last one.
    assert_matches!(
        state.enter_scope(&key, "mysql/0", settings(&[])).await,
        Err(CmrError::NotValid { .. })
    );
    state.leave_scope(&key, "wordpress/0").await.unwrap();
    assert!(state.key_relation(&key).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_removed_relation_forgets_its_token() {
    let (state, key) = related().await;
    let exported = state.export_local_entity(&key.tag()).await.unwrap();
    let id = RemoteEntityId::new(state.model_uuid(), exported.token);
    assert_eq!(state.get_remote_entity(&id).await.unwrap(), key.tag());

    state.destroy_relation(&key).await.unwrap();
    assert!(state.get_remote_entity(&id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_scope_rules() {
    let (state, key) = related().await;
    state
        .enter_scope(&key, "wordpress/0", settings(&[]))
        .await
        .unwrap();
    assert_matches!(
        state.enter_scope(&key, "wordpress/0", settings(&[])).await,
        Err(CmrError::AlreadyExists { .. })
    );
    assert_matches!(
        state.enter_scope(&key, "django/0", settings(&[])).await,
        Err(CmrError::NotValid { .. })
    );
    assert_matches!(
        state.leave_scope(&key, "mysql/3").await,
        Err(CmrError::NotFound { .. })
    );
}

#[tokio::test]
async fn test_export_is_idempotent() {
    let (state, _) = related().await;
    let tag = Tag::Application("wordpress".to_string());
    let first = state.export_local_entity(&tag).await.unwrap();
    let second = state.export_local_entity(&tag).await.unwrap();
    assert!(!first.already_existed);
    assert!(second.already_existed);
    assert_eq!(first.token, second.token);
}

#[tokio::test]
async fn test_relation_watch_reports_removal() {
    let (state, key) = related().await;
    let mut watcher = state.watch_application_relations("mysql").await.unwrap();
    assert_eq!(watcher.next().await.unwrap(), vec![key.to_string()]);
    state.destroy_relation(&key).await.unwrap();
    assert_eq!(watcher.next().await.unwrap(), vec![key.to_string()]);
    assert_eq!(
        state.remote_application("mysql").await.unwrap().relation_count,
        0
    );
}
