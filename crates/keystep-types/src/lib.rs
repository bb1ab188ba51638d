//! Shared domain types for keystep.
//!
//! This crate contains the types shared by the engine, the storage layer and
//! the CLI: workflow definitions, run and checkpoint records, engine
//! configuration, lifecycle events and the repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
