//! Workflow engine core: definition parsing, graph compilation, and durable execution.
//!
//! - `definition` -- YAML parsing, structural validation, filesystem load/save/discover
//! - `dag` -- graph compiler producing the level-ordered execution plan
//! - `handler` -- step handler contract and injected capabilities
//! - `registry` -- handler identifier -> handler mapping
//! - `builtin` -- `echo`, `merge`, `delay` and `prompt` handlers
//! - `retry` -- retry bound, backoff and fallback decisions
//! - `checkpoint` -- checkpoint manager over the store
//! - `executor` -- level-based orchestrator with cancellation and resume

pub mod builtin;
pub mod checkpoint;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod handler;
pub mod registry;
pub mod retry;
