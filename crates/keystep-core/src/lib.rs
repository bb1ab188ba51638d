//! Execution engine and storage ports for keystep.
//!
//! This crate defines the "ports" (the `CheckpointStore` trait) that the
//! infrastructure layer implements, along with the graph compiler, the step
//! handler contract and the orchestrator. It depends only on `keystep-types`,
//! never on `keystep-infra` or any database crate.

pub mod event;
pub mod repository;
pub mod workflow;
