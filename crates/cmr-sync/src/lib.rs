//! Workers keeping relations with remote applications in sync.
//!
//! [`RemoteRelationsWorker`] runs one [`RemoteApplicationWorker`] per remote
//! application known to the model. Each of those registers new relations
//! with the offering model and runs children that carry unit scope,
//! relation life and egress addresses across the model boundary.

pub mod application_worker;
pub mod catacomb;
pub mod egress;
pub mod relation_status;
pub mod relation_units;
pub mod remote;
pub mod supervisor;
pub mod worker;

pub use application_worker::RemoteApplicationWorker;
pub use catacomb::Catacomb;
pub use remote::{
    poll_watcher, CrossModelRelationsClient, InProcessConnector, LocalModelFacade,
    RemoteModelConnector, RemoteModelFacade,
};
pub use supervisor::RemoteRelationsWorker;
pub use worker::{Dying, WorkerHandle};
