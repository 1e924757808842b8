//! Core types for cross-model relations.
//!
//! Models refer to each other's relations and applications through opaque
//! tokens, authorize calls with attenuated bearer credentials, and observe
//! state through [`Watcher`]s. This crate holds the vocabulary shared by the
//! credential context, the facades, the firewall watcher and the workers.

pub mod config;
pub mod errors;
pub mod identifiers;
pub mod params;
pub mod state;
pub mod time;
pub mod watcher;

pub use config::{CmrConfig, CredentialConfig, SyncConfig};
pub use errors::{CmrError, ErrorCode, ErrorInfo, Result};
pub use identifiers::{
    consumer_proxy_name, unit_application, unit_name, unit_number, Endpoint, Life, ModelUuid,
    OfferUrl, RelationKey, RelationScope, RemoteEntityId, Role, Tag,
};
pub use state::Backend;
pub use time::{Clock, SystemClock};
pub use watcher::{Watcher, WatcherSink};
