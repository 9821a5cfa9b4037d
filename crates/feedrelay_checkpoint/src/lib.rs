//! # feedrelay Checkpoint
//!
//! Checkpoint store trait and implementations for feedrelay.
//!
//! A checkpoint is the resume marker of one relay: the source position of the
//! most recently handled change event plus that event's document key. There is
//! exactly one checkpoint per relay identity. It is upserted on every write and
//! never deleted by the relay.
//!
//! ## Design Principles
//!
//! - Stores are keyed by relay identity, which is unique per store
//! - `save` is an upsert; no history is kept
//! - Source positions are opaque tokens; stores never interpret them
//! - Stores must be `Send + Sync` for use behind `Arc<dyn CheckpointStore>`
//!
//! ## Available Stores
//!
//! - [`InMemoryCheckpointStore`] - For testing and ephemeral relays
//! - [`FileCheckpointStore`] - One JSON document per identity in a directory
//!
//! ## Example
//!
//! ```rust
//! use feedrelay_checkpoint::{Checkpoint, CheckpointStore, InMemoryCheckpointStore, SourcePosition};
//!
//! # let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
//! # rt.block_on(async {
//! let store = InMemoryCheckpointStore::new();
//! let checkpoint = Checkpoint::new("orders-relay", "orders", SourcePosition::new("0000000000000002"));
//! store.save(&checkpoint).await.unwrap();
//! assert_eq!(store.load("orders-relay").await.unwrap(), Some(checkpoint));
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checkpoint;
mod error;
mod file;
mod memory;
mod store;

pub use checkpoint::{Checkpoint, SourcePosition};
pub use error::{CheckpointError, CheckpointResult};
pub use file::FileCheckpointStore;
pub use memory::InMemoryCheckpointStore;
pub use store::{validate_identity, CheckpointStore};
