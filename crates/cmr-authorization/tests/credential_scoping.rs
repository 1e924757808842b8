//! Offer credentials graduate into relation credentials through attenuation

use cmr_authorization::CredentialContext;
use cmr_core::{CmrError, CredentialConfig, ModelUuid, OfferUrl, RelationKey};
use cmr_testkit::ManualClock;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn attenuated_offer_credential_is_scoped_to_one_relation() {
    let ctx = CredentialContext::new(ModelUuid::new_v4(), &CredentialConfig::default());
    let url = OfferUrl::parse("fred/prod.offered").unwrap();
    let offer = ctx
        .mint_offer_credential("mary", ctx.model_uuid(), &url)
        .unwrap();

    let relation = RelationKey::parse("offeredapp:local remote-apptoken:remote").unwrap();
    let attenuated = ctx.attenuate_to_relation(&offer, &relation).unwrap();

    let declared = ctx
        .check_relation_credential(&[attenuated.clone()], &relation)
        .unwrap();
    assert_eq!(declared.username, "mary");
    assert_eq!(declared.offer_url, Some(url));
    assert_eq!(declared.relation_key, Some(relation));

    for other in [
        "offeredapp:local remote-othertoken:remote",
        "db2:db django:db",
        "offeredapp:peer",
    ] {
        let other = RelationKey::parse(other).unwrap();
        let err = ctx
            .check_relation_credential(&[attenuated.clone()], &other)
            .unwrap_err();
        assert!(matches!(err, CmrError::PermissionDenied { .. }), "{other}: {err}");
    }
}

#[test]
fn attenuation_requires_a_valid_parent() {
    let ctx = CredentialContext::new(ModelUuid::new_v4(), &CredentialConfig::default());
    let stranger = CredentialContext::new(ctx.model_uuid(), &CredentialConfig::default());
    let url = OfferUrl::parse("fred/prod.offered").unwrap();
    let foreign = stranger
        .mint_offer_credential("mary", ctx.model_uuid(), &url)
        .unwrap();

    let relation = RelationKey::parse("offeredapp:local remote-apptoken:remote").unwrap();
    assert!(ctx
        .attenuate_to_relation(&foreign, &relation)
        .unwrap_err()
        .is_permission_denied());
}

#[test]
fn attenuated_credential_expires_on_its_own_schedule() {
    let clock = Arc::new(ManualClock::default());
    let config = CredentialConfig { ttl_secs: 60 };
    let ctx = CredentialContext::new(ModelUuid::new_v4(), &config).with_clock(clock.clone());
    let url = OfferUrl::parse("fred/prod.offered").unwrap();
    let offer = ctx
        .mint_offer_credential("mary", ctx.model_uuid(), &url)
        .unwrap();
    let relation = RelationKey::parse("offeredapp:local remote-apptoken:remote").unwrap();

    clock.advance(Duration::from_secs(45));
    let attenuated = ctx.attenuate_to_relation(&offer, &relation).unwrap();

    clock.advance(Duration::from_secs(30));
    assert!(ctx
        .check_offer_credential(&[offer.clone()], "offered")
        .unwrap_err()
        .is_permission_denied());
    assert!(ctx
        .check_relation_credential(&[attenuated.clone()], &relation)
        .is_ok());

    // Attenuating an expired parent fails rather than reviving it.
    assert!(ctx
        .attenuate_to_relation(&offer, &relation)
        .unwrap_err()
        .is_permission_denied());

    clock.advance(Duration::from_secs(31));
    assert!(ctx
        .check_relation_credential(&[attenuated], &relation)
        .unwrap_err()
        .is_permission_denied());
}
