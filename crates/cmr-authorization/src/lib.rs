//! Bearer credentials for cross-model relations.
//!
//! An offering model hands consumers an offer-scoped credential. When a
//! consumer registers a relation the credential is attenuated to that one
//! relation key, and every later call on the relation is checked against it.

pub mod caveats;
pub mod credential;
pub mod errors;

pub use caveats::DeclaredCaveats;
pub use credential::CredentialContext;
pub use errors::CredentialError;
