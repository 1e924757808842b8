//! Forwards life transitions of a relation observed in the other model.

use crate::worker::{closed_error, Dying};
use cmr_core::params::{RelationStatusChange, RemoteRelationChangeEvent};
use cmr_core::{Life, RemoteEntityId, Result, Watcher};
use tokio::sync::mpsc;

pub struct RelationStatusWorker {
    relation_id: RemoteEntityId,
    application_id: RemoteEntityId,
    changes: mpsc::Sender<RemoteRelationChangeEvent>,
}

impl RelationStatusWorker {
    pub fn new(
        relation_id: RemoteEntityId,
        application_id: RemoteEntityId,
        changes: mpsc::Sender<RemoteRelationChangeEvent>,
    ) -> Self {
        Self {
            relation_id,
            application_id,
            changes,
        }
    }

    /// Forward every change of life after the first status seen
    ///
    /// The first status is the baseline and is forwarded only when the
    /// relation is already on its way out.
    pub async fn run(
        self,
        mut watcher: Watcher<Vec<RelationStatusChange>>,
        mut dying: Dying,
    ) -> Result<()> {
        let mut last: Option<Life> = None;
        loop {
            let statuses = tokio::select! {
                _ = dying.wait() => return Ok(()),
                statuses = watcher.next() => statuses,
            };
            let Some(statuses) = statuses else {
                return Err(closed_error(&mut watcher, "relation status").await);
            };
            for status in statuses {
                let forward = match last {
                    None => !status.life.is_alive(),
                    Some(life) => life != status.life,
                };
                last = Some(status.life);
                if !forward {
                    continue;
                }
                tracing::debug!(relation = %status.key, life = ?status.life, "remote relation life changed");
                let event = RemoteRelationChangeEvent {
                    relation_id: self.relation_id.clone(),
                    application_id: self.application_id.clone(),
                    life: status.life,
                    departed_units: Vec::new(),
                    changed_units: Vec::new(),
                    credentials: Vec::new(),
                };
                tokio::select! {
                    _ = dying.wait() => return Ok(()),
                    sent = self.changes.send(event) => if sent.is_err() {
                        return Ok(());
                    },
                }
            }
        }
    }
}
