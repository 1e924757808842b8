//! Declared caveats carried in a credential's authority block.

use cmr_core::{ModelUuid, OfferUrl, RelationKey};
use serde::{Deserialize, Serialize};

/// Attributes a credential asserts about its holder and scope
///
/// Verification establishes that the values are authentic; callers still
/// cross-check them against the request being authorized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredCaveats {
    pub source_model_uuid: ModelUuid,
    pub username: String,
    pub offer_url: Option<OfferUrl>,
    pub relation_key: Option<RelationKey>,
}

impl DeclaredCaveats {
    pub fn for_offer(username: &str, source_model_uuid: ModelUuid, offer_url: OfferUrl) -> Self {
        Self {
            source_model_uuid,
            username: username.to_string(),
            offer_url: Some(offer_url),
            relation_key: None,
        }
    }

    pub fn for_relation(
        username: &str,
        source_model_uuid: ModelUuid,
        relation_key: RelationKey,
    ) -> Self {
        Self {
            source_model_uuid,
            username: username.to_string(),
            offer_url: None,
            relation_key: Some(relation_key),
        }
    }
}
