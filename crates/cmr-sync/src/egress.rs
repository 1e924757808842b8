//! Publishes the addresses an offering model must admit for a relation.

use crate::remote::RemoteModelFacade;
use crate::worker::{closed_error, Dying};
use cmr_core::params::{Credential, IngressNetworksChangeEvent};
use cmr_core::{RemoteEntityId, Result, Watcher};
use std::sync::Arc;

pub struct EgressAddressWorker {
    relation_id: RemoteEntityId,
    application_id: RemoteEntityId,
    credentials: Vec<Credential>,
    remote: Arc<dyn RemoteModelFacade>,
}

impl EgressAddressWorker {
    pub fn new(
        relation_id: RemoteEntityId,
        application_id: RemoteEntityId,
        credentials: Vec<Credential>,
        remote: Arc<dyn RemoteModelFacade>,
    ) -> Self {
        Self {
            relation_id,
            application_id,
            credentials,
            remote,
        }
    }

    pub async fn run(self, mut watcher: Watcher<Vec<String>>, mut dying: Dying) -> Result<()> {
        loop {
            let networks = tokio::select! {
                _ = dying.wait() => return Ok(()),
                networks = watcher.next() => networks,
            };
            let Some(networks) = networks else {
                return Err(closed_error(&mut watcher, "egress address").await);
            };
            tracing::debug!(token = %self.relation_id.token, networks = ?networks, "publishing egress networks");
            self.remote
                .publish_ingress_network_change(IngressNetworksChangeEvent {
                    relation_id: self.relation_id.clone(),
                    application_id: self.application_id.clone(),
                    ingress_required: !networks.is_empty(),
                    networks,
                    credentials: self.credentials.clone(),
                })
                .await?;
        }
    }
}
