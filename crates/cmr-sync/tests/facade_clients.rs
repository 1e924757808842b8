//! Worker-facing facade clients over in-process facades.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use cmr_core::params::{Credential, RegisterRemoteRelationArg, RemoteEndpoint, RemoteEntityArg};
use cmr_core::state::{AddRemoteApplicationParams, ModelBackend, RelationBackend};
use cmr_core::{ModelUuid, OfferUrl, RelationKey, RemoteEntityId, Role, SyncConfig, Tag};
use cmr_facade::{CrossModelRelationsApi, RemoteRelationsApi};
use cmr_sync::{
    CrossModelRelationsClient, InProcessConnector, LocalModelFacade, RemoteModelConnector,
    RemoteModelFacade,
};
use cmr_testkit::{endpoint, init_test_tracing, settings, ModelFixture};
use std::sync::Arc;
use std::time::Duration;

fn mysql(offering: ModelUuid) -> AddRemoteApplicationParams {
    AddRemoteApplicationParams {
        name: "mysql".to_string(),
        source_model_uuid: offering,
        offer_name: "mysql".to_string(),
        endpoints: vec![endpoint("mysql", "db", Role::Provider, "mysql")],
        is_consumer_proxy: false,
        credential: Some(Credential("offer-credential".to_string())),
    }
}

#[tokio::test]
async fn test_export_entity_reuses_existing_token() {
    init_test_tracing();
    let fixture = ModelFixture::new();
    fixture
        .state
        .add_application("wordpress", vec![endpoint("wordpress", "db", Role::Requirer, "mysql")])
        .await;
    let api = RemoteRelationsApi::new(Arc::new(fixture.state.clone()), &SyncConfig::default());
    let tag = Tag::Application("wordpress".to_string());

    let first = api.export_entity(&tag).await.unwrap();
    let second = api.export_entity(&tag).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(api.get_token(&fixture.model_uuid(), &tag).await.unwrap(), first);
}

#[tokio::test]
async fn test_import_twice_reports_already_exists() {
    let fixture = ModelFixture::new();
    let api = RemoteRelationsApi::new(Arc::new(fixture.state.clone()), &SyncConfig::default());
    let id = RemoteEntityId::new(ModelUuid::new_v4(), "mysql-token");
    let tag = Tag::Application("mysql".to_string());
    api.import_remote_entity(&id, &tag).await.unwrap();
    assert!(api
        .import_remote_entity(&id, &tag)
        .await
        .unwrap_err()
        .is_already_exists());
}

#[tokio::test]
async fn test_polled_watcher_delivers_changes_and_stops_server_side() {
    init_test_tracing();
    let fixture = ModelFixture::new();
    let api = RemoteRelationsApi::new(Arc::new(fixture.state.clone()), &SyncConfig::default());

    let mut watcher = LocalModelFacade::watch_remote_applications(&api).await.unwrap();
    assert_eq!(watcher.next().await.unwrap(), Vec::<String>::new());
    assert_eq!(api.resources().count(), 1);

    fixture
        .state
        .add_remote_application(mysql(ModelUuid::new_v4()))
        .await
        .unwrap();
    let names = tokio::time::timeout(Duration::from_secs(5), watcher.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(names, vec!["mysql".to_string()]);

    watcher.stop().await.unwrap();
    assert_eq!(api.resources().count(), 0);
}

#[tokio::test]
async fn test_remote_application_lookup() {
    let fixture = ModelFixture::new();
    let offering = ModelUuid::new_v4();
    fixture.state.add_remote_application(mysql(offering)).await.unwrap();
    let api = RemoteRelationsApi::new(Arc::new(fixture.state.clone()), &SyncConfig::default());

    let info = api.remote_application("mysql").await.unwrap();
    assert_eq!(info.model_uuid, offering);
    assert!(!info.is_consumer_proxy);
    assert!(api.remote_application("postgresql").await.unwrap_err().is_not_found());
    assert!(api.remote_application("Not_Valid").await.unwrap_err().is_not_valid());
}

#[tokio::test]
async fn test_connector_resolves_registered_models_only() {
    let connector = InProcessConnector::new();
    let unknown = ModelUuid::new_v4();
    assert!(connector.connect(&unknown).await.err().unwrap().is_not_found());

    let offering = ModelFixture::offering().await;
    connector.register(CrossModelRelationsApi::new(
        Arc::new(offering.state.clone()),
        offering.credentials.clone(),
        &SyncConfig::default(),
    ));
    assert!(connector.connect(&offering.model_uuid()).await.is_ok());
    connector.unregister(&offering.model_uuid());
    assert!(connector.connect(&offering.model_uuid()).await.is_err());
}

#[tokio::test]
async fn test_client_watches_offering_egress_addresses() {
    init_test_tracing();
    let offering = ModelFixture::offering().await;
    let unit = offering
        .state
        .add_unit("offeredapp", Some("0"), Some("10.0.0.1"))
        .await;
    let client = CrossModelRelationsClient::new(CrossModelRelationsApi::new(
        Arc::new(offering.state.clone()),
        offering.credentials.clone(),
        &SyncConfig::default(),
    ));
    let consumer = ModelUuid::new_v4();
    let offer_credential = offering
        .credentials
        .mint_offer_credential(
            "mary",
            offering.model_uuid(),
            &OfferUrl::parse("mary/prod.offered").unwrap(),
        )
        .unwrap();
    let registered = client
        .register_remote_relation(RegisterRemoteRelationArg {
            application_token: "app-token".to_string(),
            source_model_uuid: consumer,
            relation_token: "rel-token".to_string(),
            remote_endpoint: RemoteEndpoint {
                name: "remote".to_string(),
                role: Role::Requirer,
                interface: "http".to_string(),
                limit: 1,
            },
            offer_name: "offered".to_string(),
            local_endpoint_name: "local".to_string(),
            credentials: vec![offer_credential],
        })
        .await
        .unwrap();
    let key = RelationKey::parse("offeredapp:local remote-apptoken:remote").unwrap();
    offering
        .state
        .enter_scope(&key, &unit, settings(&[]))
        .await
        .unwrap();

    let mut watcher = client
        .watch_egress_addresses(RemoteEntityArg {
            relation_id: RemoteEntityId::new(consumer, "rel-token"),
            credentials: vec![registered.credential],
        })
        .await
        .unwrap();
    assert_eq!(watcher.next().await.unwrap(), vec!["10.0.0.1/32".to_string()]);

    offering.state.leave_scope(&key, &unit).await.unwrap();
    let addresses = tokio::time::timeout(Duration::from_secs(5), watcher.next())
        .await
        .unwrap()
        .unwrap();
    assert!(addresses.is_empty());
    watcher.stop().await.unwrap();
}
