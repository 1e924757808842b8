//! Endpoint, settings and model fixtures shared by the test suites.

use crate::backend::MemoryState;
use cmr_authorization::CredentialContext;
use cmr_core::params::Settings;
use cmr_core::{CredentialConfig, Endpoint, ModelUuid, RelationScope, Role};
use std::sync::Arc;

pub fn endpoint(application: &str, name: &str, role: Role, interface: &str) -> Endpoint {
    Endpoint {
        application_name: application.to_string(),
        name: name.to_string(),
        role,
        interface: interface.to_string(),
        limit: 0,
        scope: RelationScope::Global,
    }
}

/// Settings from string pairs
pub fn settings(pairs: &[(&str, &str)]) -> Settings {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
        .collect()
}

/// One model's store together with its credential context
#[derive(Debug, Clone)]
pub struct ModelFixture {
    pub state: MemoryState,
    pub credentials: Arc<CredentialContext>,
}

impl ModelFixture {
    pub fn new() -> Self {
        let model_uuid = ModelUuid::new_v4();
        Self {
            state: MemoryState::new(model_uuid),
            credentials: Arc::new(CredentialContext::new(
                model_uuid,
                &CredentialConfig::default(),
            )),
        }
    }

    pub fn model_uuid(&self) -> ModelUuid {
        self.credentials.model_uuid()
    }

    /// Offering model hosting `offeredapp`, offered as `offered`
    ///
    /// The application provides interface `http` on endpoint `local`, which
    /// the offer exposes under the same name.
    pub async fn offering() -> Self {
        let fixture = Self::new();
        fixture
            .state
            .add_application(
                "offeredapp",
                vec![endpoint("offeredapp", "local", Role::Provider, "http")],
            )
            .await;
        fixture
            .state
            .add_offer("offered", "offeredapp", &[("local", "local")])
            .await;
        fixture
    }
}

impl Default for ModelFixture {
    fn default() -> Self {
        Self::new()
    }
}
