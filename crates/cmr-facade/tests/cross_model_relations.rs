//! Offering-side facade behaviour against the in-memory store.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use assert_matches::assert_matches;
use cmr_core::params::{
    Credential, IngressNetworksChangeEvent, RegisterRemoteRelationArg, RemoteEndpoint,
    RemoteEntityArg, RemoteRelationChangeEvent, RemoteRelationUnit, RemoteRelationUnitChange,
};
use cmr_core::state::RelationBackend;
use cmr_core::{CmrError, Life, ModelUuid, OfferUrl, RelationKey, RemoteEntityId, Role, SyncConfig};
use cmr_facade::CrossModelRelationsApi;
use cmr_testkit::{init_test_tracing, settings, ModelFixture};
use serde_json::json;
use std::sync::Arc;

struct Offering {
    fixture: ModelFixture,
    api: CrossModelRelationsApi,
    consumer: ModelUuid,
}

async fn offering() -> Offering {
    init_test_tracing();
    let fixture = ModelFixture::offering().await;
    let api = CrossModelRelationsApi::new(
        Arc::new(fixture.state.clone()),
        fixture.credentials.clone(),
        &SyncConfig::default(),
    );
    Offering {
        fixture,
        api,
        consumer: ModelUuid::new_v4(),
    }
}

impl Offering {
    fn offer_credential(&self) -> Credential {
        self.fixture
            .credentials
            .mint_offer_credential(
                "mary",
                self.fixture.model_uuid(),
                &OfferUrl::parse("mary/prod.offered").unwrap(),
            )
            .unwrap()
    }

    fn register_arg(&self) -> RegisterRemoteRelationArg {
        RegisterRemoteRelationArg {
            application_token: "app-token".to_string(),
            source_model_uuid: self.consumer,
            relation_token: "rel-token".to_string(),
            remote_endpoint: RemoteEndpoint {
                name: "remote".to_string(),
                role: Role::Requirer,
                interface: "http".to_string(),
                limit: 1,
            },
            offer_name: "offered".to_string(),
            local_endpoint_name: "local".to_string(),
            credentials: vec![self.offer_credential()],
        }
    }

    /// Register the default relation, returning its relation credential
    async fn register(&self) -> Credential {
        let mut results = self.api.register_remote_relations(&[self.register_arg()]).await;
        results.remove(0).into_result().unwrap().credential
    }

    fn relation_id(&self) -> RemoteEntityId {
        RemoteEntityId::new(self.consumer, "rel-token")
    }

    fn change(&self, credential: &Credential) -> RemoteRelationChangeEvent {
        RemoteRelationChangeEvent {
            relation_id: self.relation_id(),
            application_id: RemoteEntityId::new(self.consumer, "app-token"),
            life: Life::Alive,
            departed_units: Vec::new(),
            changed_units: Vec::new(),
            credentials: vec![credential.clone()],
        }
    }

    fn entity_arg(&self, credential: &Credential) -> RemoteEntityArg {
        RemoteEntityArg {
            relation_id: self.relation_id(),
            credentials: vec![credential.clone()],
        }
    }
}

fn relation_key() -> RelationKey {
    RelationKey::parse("offeredapp:local remote-apptoken:remote").unwrap()
}

#[tokio::test]
async fn test_register_remote_relations_is_idempotent() {
    let offering = offering().await;
    let state = &offering.fixture.state;

    let first = offering
        .api
        .register_remote_relations(&[offering.register_arg()])
        .await;
    let relations_after_first = state.relations().await;
    let entities_after_first = state.remote_entities().await;
    let second = offering
        .api
        .register_remote_relations(&[offering.register_arg()])
        .await;

    let first = first.into_iter().next().unwrap().into_result().unwrap();
    let second = second.into_iter().next().unwrap().into_result().unwrap();
    assert_eq!(first.token, second.token);

    assert_eq!(state.relations().await, relations_after_first);
    assert_eq!(state.remote_entities().await, entities_after_first);
    let relations = state.relations().await;
    assert_eq!(relations.len(), 1);
    assert_eq!(relations[0].key, relation_key());

    let imported: Vec<_> = entities_after_first
        .iter()
        .filter(|(model, _, _)| *model == offering.consumer)
        .collect();
    assert_eq!(imported.len(), 2);

    let connections = state.offer_connections().await;
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].source_model_uuid, offering.consumer);
    assert_eq!(connections[0].username, "mary");
    assert_eq!(connections[0].offer_name, "offered");

    let proxies = state.remote_applications().await;
    assert_eq!(proxies.len(), 1);
    assert_eq!(proxies[0].name, "remote-apptoken");
    assert!(proxies[0].is_consumer_proxy);
    assert_eq!(proxies[0].source_model_uuid, offering.consumer);

    let declared = offering
        .fixture
        .credentials
        .check_relation_credential(&[second.credential], &relation_key())
        .unwrap();
    assert_eq!(declared.username, "mary");
}

#[tokio::test]
async fn test_register_rejects_differing_arguments() {
    let offering = offering().await;
    offering.register().await;

    let mut other_application = offering.register_arg();
    other_application.application_token = "other-token".to_string();
    let mut other_model = offering.register_arg();
    other_model.source_model_uuid = ModelUuid::new_v4();
    let mut other_relation_token = offering.register_arg();
    other_relation_token.relation_token = "rel-token-2".to_string();
    let entities = offering.fixture.state.remote_entities().await;

    let results = offering
        .api
        .register_remote_relations(&[other_application, other_model, other_relation_token])
        .await;
    assert_eq!(results.len(), 3);
    for result in results {
        assert_matches!(result.into_result(), Err(CmrError::NotValid { .. }));
    }
    assert_eq!(offering.fixture.state.remote_applications().await.len(), 1);
    assert_eq!(offering.fixture.state.relations().await.len(), 1);
    assert_eq!(offering.fixture.state.remote_entities().await, entities);
}

#[tokio::test]
async fn test_relation_calls_require_the_connected_user() {
    let offering = offering().await;
    offering.register().await;
    offering
        .fixture
        .state
        .enter_scope(&relation_key(), "offeredapp/0", settings(&[("foo", "bar")]))
        .await
        .unwrap();
    // Scoped to the relation, but held by someone other than the consumer.
    let fred = offering
        .fixture
        .credentials
        .mint_relation_credential("fred", offering.fixture.model_uuid(), &relation_key())
        .unwrap();

    let mut change = offering.change(&fred);
    change.changed_units = vec![RemoteRelationUnitChange {
        unit_id: 1,
        settings: settings(&[("foo", "bar")]),
        version: 1,
    }];
    let results = offering.api.publish_relation_changes(&[change]).await;
    assert_matches!(
        results[0].clone().into_result(),
        Err(CmrError::PermissionDenied { .. })
    );

    let ingress = IngressNetworksChangeEvent {
        relation_id: offering.relation_id(),
        application_id: RemoteEntityId::new(offering.consumer, "app-token"),
        ingress_required: true,
        networks: vec!["1.2.3.4/32".to_string()],
        credentials: vec![fred.clone()],
    };
    let results = offering.api.publish_ingress_network_changes(&[ingress]).await;
    assert!(results[0]
        .clone()
        .into_result()
        .unwrap_err()
        .is_permission_denied());

    let unit = RemoteRelationUnit {
        relation_id: offering.relation_id(),
        unit: "unit-offeredapp-0".to_string(),
        credentials: vec![fred.clone()],
    };
    let results = offering.api.relation_unit_settings(&[unit]).await;
    assert!(results[0]
        .clone()
        .into_result()
        .unwrap_err()
        .is_permission_denied());

    let results = offering
        .api
        .watch_relation_units(&[offering.entity_arg(&fred)])
        .await;
    assert!(results[0]
        .clone()
        .into_result()
        .unwrap_err()
        .is_permission_denied());

    let state = &offering.fixture.state;
    assert_eq!(
        state.units_in_scope(&relation_key()).await,
        vec!["offeredapp/0".to_string()]
    );
    assert!(state.ingress_networks(&relation_key()).await.is_err());
    assert_eq!(offering.api.resources().count(), 0);
}

#[tokio::test]
async fn test_register_requires_offer_credential() {
    let offering = offering().await;

    let mut no_credentials = offering.register_arg();
    no_credentials.credentials.clear();
    let mut wrong_offer = offering.register_arg();
    wrong_offer.credentials = vec![offering
        .fixture
        .credentials
        .mint_offer_credential(
            "mary",
            offering.fixture.model_uuid(),
            &OfferUrl::parse("mary/prod.other").unwrap(),
        )
        .unwrap()];
    let mut unknown_endpoint = offering.register_arg();
    unknown_endpoint.local_endpoint_name = "admin".to_string();

    let results = offering
        .api
        .register_remote_relations(&[no_credentials, wrong_offer, unknown_endpoint])
        .await;
    let errors: Vec<_> = results
        .into_iter()
        .map(|r| r.into_result().unwrap_err())
        .collect();
    assert!(errors[0].is_permission_denied());
    assert!(errors[1].is_permission_denied());
    assert!(errors[2].is_not_found());
    assert!(offering.fixture.state.relations().await.is_empty());
}

#[tokio::test]
async fn test_publish_change_for_unknown_relation_is_noop() {
    let offering = offering().await;
    let credential = offering.register().await;
    let before = offering.fixture.state.units_in_scope(&relation_key()).await;

    let mut change = offering.change(&credential);
    change.relation_id = RemoteEntityId::new(offering.consumer, "unknown-token");
    change.departed_units = vec![1];
    change.changed_units = vec![RemoteRelationUnitChange {
        unit_id: 2,
        settings: settings(&[("foo", "bar")]),
        version: 1,
    }];

    let results = offering.api.publish_relation_changes(&[change]).await;
    assert_eq!(results.len(), 1);
    assert!(results[0].error.is_none());
    assert_eq!(
        offering.fixture.state.units_in_scope(&relation_key()).await,
        before
    );
}

#[tokio::test]
async fn test_publish_changes_enter_update_and_leave_scope() {
    let offering = offering().await;
    let credential = offering.register().await;
    let state = &offering.fixture.state;
    let key = relation_key();

    let mut enter = offering.change(&credential);
    enter.changed_units = vec![RemoteRelationUnitChange {
        unit_id: 1,
        settings: settings(&[("foo", "bar")]),
        version: 1,
    }];
    let results = offering.api.publish_relation_changes(&[enter]).await;
    assert!(results[0].error.is_none());
    assert!(state
        .relation_unit_in_scope(&key, "remote-apptoken/1")
        .await
        .unwrap());
    assert_eq!(
        state
            .relation_unit_settings(&key, "remote-apptoken/1")
            .await
            .unwrap(),
        settings(&[("foo", "bar")])
    );

    let mut update = offering.change(&credential);
    update.changed_units = vec![RemoteRelationUnitChange {
        unit_id: 1,
        settings: settings(&[("foo", "baz")]),
        version: 2,
    }];
    offering.api.publish_relation_changes(&[update]).await;
    assert_eq!(
        state
            .relation_unit_settings(&key, "remote-apptoken/1")
            .await
            .unwrap(),
        settings(&[("foo", "baz")])
    );

    let mut depart = offering.change(&credential);
    depart.departed_units = vec![1];
    let results = offering.api.publish_relation_changes(&[depart]).await;
    assert!(results[0].error.is_none());
    assert!(!state
        .relation_unit_in_scope(&key, "remote-apptoken/1")
        .await
        .unwrap());
}

#[tokio::test]
async fn test_publish_checks_credentials_per_item() {
    let offering = offering().await;
    let credential = offering.register().await;

    let mut good = offering.change(&credential);
    good.changed_units = vec![RemoteRelationUnitChange {
        unit_id: 0,
        settings: settings(&[("foo", "bar")]),
        version: 0,
    }];
    let mut unscoped = offering.change(&offering.offer_credential());
    unscoped.changed_units = vec![RemoteRelationUnitChange {
        unit_id: 1,
        settings: settings(&[("foo", "bar")]),
        version: 0,
    }];

    let results = offering.api.publish_relation_changes(&[good, unscoped]).await;
    assert!(results[0].error.is_none());
    assert!(results[1]
        .clone()
        .into_result()
        .unwrap_err()
        .is_permission_denied());
    assert_eq!(
        offering.fixture.state.units_in_scope(&relation_key()).await,
        vec!["remote-apptoken/0".to_string()]
    );
}

#[tokio::test]
async fn test_dying_change_removes_relation_and_proxy() {
    let offering = offering().await;
    let credential = offering.register().await;
    let state = &offering.fixture.state;

    let mut enter = offering.change(&credential);
    enter.changed_units = vec![RemoteRelationUnitChange {
        unit_id: 1,
        settings: settings(&[("foo", "bar")]),
        version: 1,
    }];
    offering.api.publish_relation_changes(&[enter]).await;

    let mut dying = offering.change(&credential);
    dying.life = Life::Dying;
    dying.departed_units = vec![1];
    let results = offering.api.publish_relation_changes(&[dying.clone()]).await;
    assert!(results[0].error.is_none());
    assert!(state.relations().await.is_empty());
    assert!(state.remote_applications().await.is_empty());

    // Repeating the change once everything is gone still succeeds.
    let results = offering.api.publish_relation_changes(&[dying]).await;
    assert!(results[0].error.is_none());
}

#[tokio::test]
async fn test_relation_unit_settings_enforces_string_values() {
    let offering = offering().await;
    let credential = offering.register().await;
    let state = &offering.fixture.state;
    let key = relation_key();

    state
        .enter_scope(&key, "offeredapp/0", settings(&[("foo", "bar")]))
        .await
        .unwrap();
    let mut structured = settings(&[("foo", "bar")]);
    structured.insert("count".to_string(), json!(3));
    state
        .enter_scope(&key, "offeredapp/1", structured)
        .await
        .unwrap();

    let unit = |name: &str| RemoteRelationUnit {
        relation_id: offering.relation_id(),
        unit: name.to_string(),
        credentials: vec![credential.clone()],
    };
    let results = offering
        .api
        .relation_unit_settings(&[unit("unit-offeredapp-0"), unit("unit-offeredapp-1")])
        .await;
    assert_eq!(results.len(), 2);
    let first = results[0].clone().into_result().unwrap();
    assert_eq!(first.get("foo").map(String::as_str), Some("bar"));
    let err = results[1].clone().into_result().unwrap_err();
    assert!(err.is_not_valid());
    assert!(err.to_string().contains("\"count\""));
}

#[tokio::test]
async fn test_watch_relation_units_reports_missing_relation_per_item() {
    let offering = offering().await;
    let credential = offering.register().await;
    let state = &offering.fixture.state;
    state
        .enter_scope(&relation_key(), "offeredapp/0", settings(&[("foo", "bar")]))
        .await
        .unwrap();

    let mut unknown = offering.entity_arg(&credential);
    unknown.relation_id = RemoteEntityId::new(offering.consumer, "unknown-token");
    let results = offering
        .api
        .watch_relation_units(&[offering.entity_arg(&credential), unknown])
        .await;
    assert_eq!(results.len(), 2);
    assert!(results[1].clone().into_result().unwrap_err().is_not_found());

    let watch = results[0].clone().into_result().unwrap();
    assert!(watch.changes.changed.contains_key("offeredapp/0"));

    state
        .replace_settings(&relation_key(), "offeredapp/0", settings(&[("foo", "baz")]))
        .await
        .unwrap();
    let change = offering.api.next_relation_units(&watch.watcher_id).await.unwrap();
    assert_eq!(change.changed["offeredapp/0"].version, 1);

    offering.api.stop_watcher(&watch.watcher_id).await.unwrap();
    assert!(offering
        .api
        .next_relation_units(&watch.watcher_id)
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_watch_requires_relation_credential() {
    let offering = offering().await;
    offering.register().await;

    let results = offering
        .api
        .watch_relations_status(&[offering.entity_arg(&offering.offer_credential())])
        .await;
    assert!(results[0]
        .clone()
        .into_result()
        .unwrap_err()
        .is_permission_denied());
    assert_eq!(offering.api.resources().count(), 0);
}

#[tokio::test]
async fn test_watch_relations_status_and_egress_addresses() {
    let offering = offering().await;
    let credential = offering.register().await;
    let state = &offering.fixture.state;
    let unit = state.add_unit("offeredapp", Some("0"), Some("10.0.0.1")).await;
    state
        .enter_scope(&relation_key(), &unit, settings(&[]))
        .await
        .unwrap();

    let status = offering
        .api
        .watch_relations_status(&[offering.entity_arg(&credential)])
        .await
        .remove(0)
        .into_result()
        .unwrap();
    assert_eq!(status.changes.len(), 1);
    assert_eq!(status.changes[0].life, Life::Alive);

    let egress = offering
        .api
        .watch_egress_addresses_for_relations(&[offering.entity_arg(&credential)])
        .await
        .remove(0)
        .into_result()
        .unwrap();
    assert_eq!(egress.changes, vec!["10.0.0.1/32".to_string()]);

    state.set_relation_suspended(&relation_key(), true).await.unwrap();
    let change = offering
        .api
        .next_relation_status(&status.watcher_id)
        .await
        .unwrap();
    assert!(change[0].suspended);
    assert_eq!(offering.api.resources().count(), 2);
}

#[tokio::test]
async fn test_publish_ingress_network_changes() {
    let offering = offering().await;
    let credential = offering.register().await;
    let event = |networks: Vec<&str>, required: bool| IngressNetworksChangeEvent {
        relation_id: offering.relation_id(),
        application_id: RemoteEntityId::new(offering.consumer, "app-token"),
        ingress_required: required,
        networks: networks.into_iter().map(str::to_string).collect(),
        credentials: vec![credential.clone()],
    };

    let results = offering
        .api
        .publish_ingress_network_changes(&[event(vec!["1.2.3.4/32"], true)])
        .await;
    assert!(results[0].error.is_none());
    assert_eq!(
        offering
            .fixture
            .state
            .ingress_networks(&relation_key())
            .await
            .unwrap(),
        vec!["1.2.3.4/32".to_string()]
    );

    let mut unknown = event(vec!["5.6.7.8/32"], true);
    unknown.relation_id = RemoteEntityId::new(offering.consumer, "unknown-token");
    let results = offering
        .api
        .publish_ingress_network_changes(&[event(vec!["1.2.3.4/32"], false), unknown])
        .await;
    assert!(results.iter().all(|r| r.error.is_none()));
    assert!(offering
        .fixture
        .state
        .ingress_networks(&relation_key())
        .await
        .unwrap()
        .is_empty());
}
