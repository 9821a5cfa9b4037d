//! # feedrelay Testkit
//!
//! Test utilities for feedrelay.
//!
//! This crate provides:
//! - [`MemoryChangeLog`], an in-memory change feed with resumable subscriptions
//! - [`RecordingBroker`], a broker that keeps every message
//! - [`RecordingCheckpointStore`], a checkpoint store that keeps its write history
//! - [`RelayHarness`] and other fixtures for scenario tests
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use feedrelay_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn relays_inserts() {
//!     let harness = RelayHarness::new();
//!     let relay = harness.relay(harness.config(&[OperationKind::Insert], 2)).unwrap();
//!     relay.start().await.unwrap();
//!     harness.log.insert(test_document("a1", 1));
//!     harness.expect_messages(1).await;
//!     relay.stop().await.unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod fixtures;
pub mod generators;
pub mod source;
pub mod store;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::broker::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::source::*;
    pub use crate::store::*;
    pub use feedrelay_core::OperationKind;
}

pub use broker::{RecordedMessage, RecordingBroker};
pub use fixtures::*;
pub use generators::*;
pub use source::{position, MemoryChangeLog};
pub use store::RecordingCheckpointStore;
