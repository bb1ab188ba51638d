//! Infrastructure layer for keystep.
//!
//! Contains the durable implementation of the `CheckpointStore` trait defined
//! in `keystep-core` (SQLite with WAL and split reader/writer pools), the
//! `config.toml` loader, and the data directory layout.

pub mod config;
pub mod filesystem;
pub mod sqlite;
