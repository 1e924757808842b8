//! Facades for cross-model relations.
//!
//! [`CrossModelRelationsApi`] is served by an offering model to the models
//! consuming its offers. [`RemoteRelationsApi`] is served by a model to its
//! own remote relations workers. Both return one result per request item,
//! in request order, and hand out watchers through a shared [`Resources`]
//! registry.

pub mod common;
pub mod crossmodelrelations;
pub mod remoterelations;
pub mod resources;

pub use crossmodelrelations::CrossModelRelationsApi;
pub use remoterelations::RemoteRelationsApi;
pub use resources::{Resource, ResourceKind, Resources};
