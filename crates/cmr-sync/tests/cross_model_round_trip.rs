//! Two in-memory models kept in sync by the workers.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use assert_matches::assert_matches;
use cmr_core::params::Credential;
use cmr_core::state::{AddRemoteApplicationParams, ModelBackend, OfferBackend, RelationBackend};
use cmr_core::{CmrError, Life, OfferUrl, RelationKey, Role, SyncConfig};
use cmr_facade::{CrossModelRelationsApi, RemoteRelationsApi};
use cmr_sync::{InProcessConnector, RemoteRelationsWorker, WorkerHandle};
use cmr_testkit::{endpoint, init_test_tracing, settings, ModelFixture};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Poll `check` until it yields a value
async fn eventually<T, F, Fut>(what: &str, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = check().await {
            return value;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

struct Models {
    offering: ModelFixture,
    consuming: ModelFixture,
    /// Relation as seen by the consuming model
    key: RelationKey,
    connector: Arc<InProcessConnector>,
    consuming_worker: WorkerHandle,
    offering_worker: WorkerHandle,
}

async fn models() -> Models {
    init_test_tracing();
    let config = SyncConfig::default();
    let offering = ModelFixture::offering().await;
    offering
        .state
        .add_unit("offeredapp", Some("0"), Some("10.0.0.1"))
        .await;

    let consuming = ModelFixture::new();
    let wordpress = endpoint("wordpress", "db", Role::Requirer, "http");
    let offered = endpoint("offered", "local", Role::Provider, "http");
    consuming
        .state
        .add_application("wordpress", vec![wordpress.clone()])
        .await;
    consuming
        .state
        .add_unit("wordpress", Some("1"), Some("192.168.1.5"))
        .await;
    let offer_credential = offering
        .credentials
        .mint_offer_credential(
            "mary",
            offering.model_uuid(),
            &OfferUrl::parse("mary/prod.offered").unwrap(),
        )
        .unwrap();
    consuming
        .state
        .add_remote_application(AddRemoteApplicationParams {
            name: "offered".to_string(),
            source_model_uuid: offering.model_uuid(),
            offer_name: "offered".to_string(),
            endpoints: vec![offered.clone()],
            is_consumer_proxy: false,
            credential: Some(offer_credential),
        })
        .await
        .unwrap();
    let relation = consuming
        .state
        .add_relation(&[wordpress, offered])
        .await
        .unwrap();

    let connector = Arc::new(InProcessConnector::new());
    connector.register(CrossModelRelationsApi::new(
        Arc::new(offering.state.clone()),
        offering.credentials.clone(),
        &config,
    ));
    let consuming_worker = start_consuming(&consuming, &connector);
    let offering_worker = RemoteRelationsWorker::new(
        Arc::new(RemoteRelationsApi::new(
            Arc::new(offering.state.clone()),
            &config,
        )),
        Arc::new(InProcessConnector::new()),
        config,
    )
    .start();

    Models {
        offering,
        consuming,
        key: relation.key,
        connector,
        consuming_worker,
        offering_worker,
    }
}

fn start_consuming(consuming: &ModelFixture, connector: &Arc<InProcessConnector>) -> WorkerHandle {
    let config = SyncConfig::default();
    RemoteRelationsWorker::new(
        Arc::new(RemoteRelationsApi::new(
            Arc::new(consuming.state.clone()),
            &config,
        )),
        connector.clone(),
        config,
    )
    .start()
}

impl Models {
    /// The relation the consuming model registered with the offering model
    ///
    /// Returns once the consuming side's relation workers are running; the
    /// egress worker starts last and publishes on startup.
    async fn offered_relation(&self) -> RelationKey {
        let offering = &self.offering;
        eventually("registration", || async move {
            let relation = offering.state.relations().await.into_iter().next()?;
            offering
                .state
                .ingress_networks(&relation.key)
                .await
                .ok()
                .map(|_| relation.key)
        })
        .await
    }

    /// Name of the consuming model's proxy in the offering model
    async fn consumer_proxy(&self) -> String {
        let proxies = self.offering.state.remote_applications().await;
        assert_eq!(proxies.len(), 1);
        assert!(proxies[0].is_consumer_proxy);
        proxies[0].name.clone()
    }
}

#[tokio::test]
async fn test_registration_creates_offering_side_relation() {
    let models = models().await;
    let key = models.offered_relation().await;
    let proxy = models.consumer_proxy().await;
    assert!(proxy.starts_with("remote-"));
    assert!(key.involves("offeredapp"));
    assert!(key.involves(&proxy));

    let proxy_state = models.offering.state.remote_application(&proxy).await.unwrap();
    assert_eq!(proxy_state.source_model_uuid, models.consuming.model_uuid());

    let connections = models.offering.state.offer_connections().await;
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].offer_name, "offered");
    assert_eq!(connections[0].username, "mary");

    // The consuming model keeps the relation-scoped credential it was given.
    let credential = models
        .consuming
        .state
        .relation_credential(&models.key)
        .await
        .unwrap();
    models
        .offering
        .credentials
        .check_relation_credential(&[credential], &key)
        .unwrap();

    models.consuming_worker.stop().await.unwrap();
    models.offering_worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_restarted_consumer_registers_again_without_changes() {
    let models = models().await;
    let offered_key = models.offered_relation().await;
    let offering = &models.offering;
    let consuming = &models.consuming;
    let snapshot = || async move {
        (
            offering.state.remote_entities().await,
            offering.state.relations().await,
            offering.state.offer_connections().await,
            offering.state.remote_applications().await.len(),
            consuming.state.remote_entities().await,
            consuming.state.relations().await,
        )
    };
    let before = snapshot().await;
    let first_credential = consuming.state.relation_credential(&models.key).await.unwrap();
    models.consuming_worker.stop().await.unwrap();

    let restarted = start_consuming(consuming, &models.connector);
    // Registration hands out a freshly minted credential each time.
    let key = models.key.clone();
    let second_credential = eventually("second registration", || {
        let (key, first) = (key.clone(), first_credential.clone());
        async move {
            let credential = consuming.state.relation_credential(&key).await.ok()?;
            (credential != first).then_some(credential)
        }
    })
    .await;

    assert_eq!(snapshot().await, before);
    let declared = offering.credentials.declared(&second_credential).unwrap();
    assert_eq!(declared.relation_key, Some(offered_key));
    assert_eq!(declared.username, "mary");

    restarted.stop().await.unwrap();
    models.offering_worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_unit_scope_flows_both_ways() {
    let models = models().await;
    let offered_key = models.offered_relation().await;
    let proxy = models.consumer_proxy().await;

    models
        .consuming
        .state
        .enter_scope(&models.key, "wordpress/0", settings(&[("foo", "bar")]))
        .await
        .unwrap();
    let remote_unit = format!("{proxy}/0");
    let offering = &models.offering;
    let synced = eventually("consumer unit on the offering side", || {
        let (key, unit) = (offered_key.clone(), remote_unit.clone());
        async move {
            offering
                .state
                .relation_unit_settings(&key, &unit)
                .await
                .ok()
        }
    })
    .await;
    assert_eq!(synced, settings(&[("foo", "bar")]));

    models
        .offering
        .state
        .enter_scope(&offered_key, "offeredapp/0", settings(&[("host", "10.0.0.1")]))
        .await
        .unwrap();
    let consuming = &models.consuming;
    let key = models.key.clone();
    let synced = eventually("offering unit on the consuming side", || {
        let key = key.clone();
        async move {
            consuming
                .state
                .relation_unit_settings(&key, "offered/0")
                .await
                .ok()
        }
    })
    .await;
    assert_eq!(synced, settings(&[("host", "10.0.0.1")]));

    models
        .consuming
        .state
        .leave_scope(&models.key, "wordpress/0")
        .await
        .unwrap();
    eventually("consumer unit departure", || {
        let (key, unit) = (offered_key.clone(), remote_unit.clone());
        async move {
            let in_scope = offering.state.units_in_scope(&key).await;
            (!in_scope.contains(&unit)).then_some(())
        }
    })
    .await;
    assert_eq!(
        models.offering.state.units_in_scope(&offered_key).await,
        vec!["offeredapp/0".to_string()]
    );

    models.consuming_worker.stop().await.unwrap();
    models.offering_worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_egress_addresses_become_ingress_networks() {
    let models = models().await;
    let offered_key = models.offered_relation().await;

    models
        .consuming
        .state
        .enter_scope(&models.key, "wordpress/0", settings(&[]))
        .await
        .unwrap();
    let offering = &models.offering;
    let networks = eventually("ingress networks", || {
        let key = offered_key.clone();
        async move {
            let networks = offering.state.ingress_networks(&key).await.ok()?;
            (!networks.is_empty()).then_some(networks)
        }
    })
    .await;
    assert_eq!(networks, vec!["192.168.1.5/32".to_string()]);

    models.consuming_worker.stop().await.unwrap();
    models.offering_worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_removing_relation_tears_down_offering_side() {
    let models = models().await;
    let offered_key = models.offered_relation().await;

    models.consuming.state.destroy_relation(&models.key).await.unwrap();
    let offering = &models.offering;
    eventually("offering relation removal", || async move {
        offering.state.relations().await.is_empty().then_some(())
    })
    .await;
    assert!(offering.state.key_relation(&offered_key).await.unwrap_err().is_not_found());
    // The consumer proxy goes with its last relation.
    assert!(offering.state.remote_applications().await.is_empty());

    models.consuming_worker.stop().await.unwrap();
    models.offering_worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_offering_side_death_reaches_consumer() {
    let models = models().await;
    let offered_key = models.offered_relation().await;
    let consuming = &models.consuming;
    // With a unit in scope the offering relation only becomes Dying.
    consuming
        .state
        .enter_scope(&models.key, "wordpress/0", settings(&[]))
        .await
        .unwrap();
    let offering = &models.offering;
    eventually("consumer unit on the offering side", || {
        let key = offered_key.clone();
        async move { (!offering.state.units_in_scope(&key).await.is_empty()).then_some(()) }
    })
    .await;

    models
        .offering
        .state
        .destroy_relation(&offered_key)
        .await
        .unwrap();
    let key = models.key.clone();
    eventually("consuming relation leaving Alive", || {
        let key = key.clone();
        async move {
            match consuming.state.key_relation(&key).await {
                Ok(relation) if relation.life == Life::Alive => None,
                _ => Some(()),
            }
        }
    })
    .await;

    models.consuming_worker.stop().await.unwrap();
    models.offering_worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_missing_offer_credential_fails_worker() {
    init_test_tracing();
    let config = SyncConfig::default();
    let offering = ModelFixture::offering().await;
    let consuming = ModelFixture::new();
    let wordpress = endpoint("wordpress", "db", Role::Requirer, "http");
    let offered = endpoint("offered", "local", Role::Provider, "http");
    consuming
        .state
        .add_application("wordpress", vec![wordpress.clone()])
        .await;
    consuming
        .state
        .add_remote_application(AddRemoteApplicationParams {
            name: "offered".to_string(),
            source_model_uuid: offering.model_uuid(),
            offer_name: "offered".to_string(),
            endpoints: vec![offered.clone()],
            is_consumer_proxy: false,
            credential: Some(Credential("not-a-credential".to_string())),
        })
        .await
        .unwrap();
    consuming
        .state
        .add_relation(&[wordpress, offered])
        .await
        .unwrap();
    let connector = Arc::new(InProcessConnector::new());
    connector.register(CrossModelRelationsApi::new(
        Arc::new(offering.state.clone()),
        offering.credentials.clone(),
        &config,
    ));
    let mut worker = start_consuming(&consuming, &connector);

    let err = tokio::time::timeout(Duration::from_secs(5), worker.wait())
        .await
        .unwrap()
        .unwrap_err();
    assert_matches!(err, CmrError::PermissionDenied { .. });
    assert!(offering.state.relations().await.is_empty());
}
