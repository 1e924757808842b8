//! Testing infrastructure for cross-model relations.
//!
//! Provides an in-memory model store implementing every backend capability,
//! a manual clock, and fixtures for building offering and consuming models.
//!
//! ```toml
//! [dev-dependencies]
//! cmr-testkit = { path = "../cmr-testkit" }
//! ```

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

pub mod backend;
pub mod clock;
pub mod fixtures;

pub use backend::MemoryState;
pub use clock::ManualClock;
pub use fixtures::{endpoint, settings, ModelFixture};

use std::sync::Once;

static TRACING: Once = Once::new();

/// Install a fmt subscriber honouring `RUST_LOG`, once per test binary
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
