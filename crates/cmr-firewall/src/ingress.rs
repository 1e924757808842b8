//! Ingress address watcher.
//!
//! Aggregates the public addresses of an application's units that are in a
//! relation's scope into a sorted, deduplicated set of `/32` CIDRs. The
//! initial set is always emitted, even when empty; afterwards a value is
//! emitted only when the set differs from the last one sent.

use cmr_core::state::{ModelBackend, RelationBackend};
use cmr_core::{CmrError, RelationKey, Result, Watcher, WatcherSink};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Store capabilities the watcher reads
pub trait IngressState: ModelBackend + RelationBackend {}

impl<T: ModelBackend + RelationBackend + ?Sized> IngressState for T {}

/// Watch the ingress CIDRs needed for `application`'s side of `relation`
pub fn watch_ingress_addresses<S>(
    backend: Arc<S>,
    relation: RelationKey,
    application: String,
    capacity: usize,
) -> Watcher<Vec<String>>
where
    S: IngressState + ?Sized + 'static,
{
    Watcher::spawn(capacity, move |sink| {
        let (machine_tx, machine_rx) = mpsc::unbounded_channel();
        let watcher = IngressAddressWatcher {
            backend,
            relation,
            application,
            members: BTreeSet::new(),
            unit_machines: BTreeMap::new(),
            machines: BTreeMap::new(),
            machine_tx,
            machine_rx,
            last: None,
        };
        watcher.run(sink)
    })
}

struct IngressAddressWatcher<S: ?Sized> {
    backend: Arc<S>,
    relation: RelationKey,
    application: String,
    /// Units in scope, whether or not they currently resolve to an address
    members: BTreeSet<String>,
    /// In-scope units with an assigned machine
    unit_machines: BTreeMap<String, String>,
    machines: BTreeMap<String, MachineData>,
    machine_tx: mpsc::UnboundedSender<String>,
    machine_rx: mpsc::UnboundedReceiver<String>,
    last: Option<Vec<String>>,
}

struct MachineData {
    units: BTreeSet<String>,
    address: Option<String>,
    _watch: MachineWatch,
}

/// Forwards a machine's address notifications, tagged with its id
struct MachineWatch(JoinHandle<()>);

impl Drop for MachineWatch {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<S> IngressAddressWatcher<S>
where
    S: IngressState + ?Sized + 'static,
{
    async fn run(mut self, mut sink: WatcherSink<Vec<String>>) -> Result<()> {
        let mut scope = self
            .backend
            .watch_relation_units(&self.relation, &self.application)
            .await?;

        for unit in self.backend.all_units(&self.application).await? {
            if self
                .backend
                .relation_unit_in_scope(&self.relation, &unit.name)
                .await?
            {
                self.unit_joined(&unit.name).await?;
            }
        }
        if !self.emit_if_changed(&mut sink).await {
            return Ok(());
        }

        loop {
            tokio::select! {
                _ = sink.dying() => return Ok(()),
                change = scope.next() => {
                    let Some(change) = change else {
                        scope.wait().await?;
                        return Err(CmrError::internal(format!(
                            "relation units watcher for {} closed",
                            self.relation
                        )));
                    };
                    for unit in &change.departed {
                        self.unit_departed(unit);
                    }
                    for unit in change.changed.keys() {
                        self.unit_joined(unit).await?;
                    }
                }
                Some(machine) = self.machine_rx.recv() => {
                    self.machine_changed(&machine).await?;
                    self.resolve_unmapped().await?;
                }
            }
            if !self.emit_if_changed(&mut sink).await {
                return Ok(());
            }
        }
    }

    async fn unit_joined(&mut self, unit: &str) -> Result<()> {
        self.members.insert(unit.to_string());
        self.resolve(unit).await
    }

    /// Retry members that had no machine when they joined
    async fn resolve_unmapped(&mut self) -> Result<()> {
        let unmapped: Vec<String> = self
            .members
            .iter()
            .filter(|unit| !self.unit_machines.contains_key(*unit))
            .cloned()
            .collect();
        for unit in unmapped {
            self.resolve(&unit).await?;
        }
        Ok(())
    }

    async fn resolve(&mut self, unit: &str) -> Result<()> {
        if self.unit_machines.contains_key(unit) {
            return Ok(());
        }
        let info = match self.backend.unit(unit).await {
            Ok(info) => info,
            Err(err) if err.is_not_found() => {
                tracing::debug!(unit, relation = %self.relation, "unit in scope not found, no address yet");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let Some(machine) = info.machine_id else {
            tracing::debug!(unit, "unit not assigned to a machine, no address yet");
            return Ok(());
        };

        self.unit_machines.insert(unit.to_string(), machine.clone());
        if let Some(data) = self.machines.get_mut(&machine) {
            data.units.insert(unit.to_string());
            if data.address.is_none() {
                data.address = info.public_address;
            }
            return Ok(());
        }

        let watch = self.watch_machine(&machine).await?;
        self.machines.insert(
            machine,
            MachineData {
                units: BTreeSet::from([unit.to_string()]),
                address: info.public_address,
                _watch: watch,
            },
        );
        Ok(())
    }

    fn unit_departed(&mut self, unit: &str) {
        self.members.remove(unit);
        let Some(machine) = self.unit_machines.remove(unit) else {
            return;
        };
        let drop_machine = match self.machines.get_mut(&machine) {
            Some(data) => {
                data.units.remove(unit);
                data.units.is_empty()
            }
            None => false,
        };
        if drop_machine {
            self.machines.remove(&machine);
        }
    }

    async fn machine_changed(&mut self, machine: &str) -> Result<()> {
        let Some(units) = self.machines.get(machine).map(|data| data.units.clone()) else {
            return Ok(());
        };
        let mut address = None;
        for unit in units {
            match self.backend.unit(&unit).await {
                Ok(info) if info.public_address.is_some() => {
                    address = info.public_address;
                    break;
                }
                Ok(_) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        if let Some(data) = self.machines.get_mut(machine) {
            data.address = address;
        }
        Ok(())
    }

    async fn watch_machine(&self, machine: &str) -> Result<MachineWatch> {
        let mut watcher = self.backend.watch_machine_addresses(machine).await?;
        let tx = self.machine_tx.clone();
        let machine = machine.to_string();
        Ok(MachineWatch(tokio::spawn(async move {
            // The first notification is the watcher's initial state, already
            // reflected in the address read when the unit joined.
            if watcher.next().await.is_none() {
                return;
            }
            while watcher.next().await.is_some() {
                if tx.send(machine.clone()).is_err() {
                    return;
                }
            }
        })))
    }

    fn addresses(&self) -> Vec<String> {
        self.machines
            .values()
            .filter_map(|data| data.address.as_ref())
            .map(|address| format!("{address}/32"))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Returns false once the watcher is stopping
    async fn emit_if_changed(&mut self, sink: &mut WatcherSink<Vec<String>>) -> bool {
        let current = self.addresses();
        if self.last.as_ref() == Some(&current) {
            return true;
        }
        tracing::debug!(relation = %self.relation, addresses = ?current, "ingress addresses changed");
        self.last = Some(current.clone());
        sink.send(current).await
    }
}
