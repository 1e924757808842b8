//! Firewall support for cross-model relations.
//!
//! The offering side of a relation must admit traffic from the consuming
//! side's units; [`watch_ingress_addresses`] tracks which addresses those are.

pub mod ingress;

pub use ingress::{watch_ingress_addresses, IngressState};
