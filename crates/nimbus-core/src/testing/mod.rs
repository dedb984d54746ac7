//! Testing utilities shared by the nimbus crates.
//!
//! - [`MockClient`]: an in-memory remote tree implementing [`Client`](crate::Client)
//!   with scripted download failures, artificial latency and synchronous
//!   node-event delivery
//! - [`init_tracing`]: installs a test-friendly `tracing` subscriber once
//!
//! # Usage
//!
//! ```ignore
//! use nimbus_core::testing::{init_tracing, MockClient};
//!
//! #[test]
//! fn test_lookup() {
//!     init_tracing();
//!     let client = MockClient::new();
//!     let dir = client.add_directory(client.root(), "docs");
//!     let file = client.add_file(dir, "a.txt", b"hello".to_vec());
//!     // ... exercise code against `client` ...
//! }
//! ```

mod client;

pub use client::{MockClient, MockDownload};

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Installs a `tracing` subscriber honouring `RUST_LOG`, writing through the
/// test harness so output is captured per test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
