//! Repository trait definitions (ports) and the in-memory store.
//!
//! These traits define the storage interface that the infrastructure layer
//! (keystep-infra) implements. The core crate never depends on any
//! specific storage technology.

pub mod memory;
pub mod workflow;

pub use memory::InMemoryCheckpointStore;
pub use workflow::{CheckpointStore, RunStatusUpdate};
