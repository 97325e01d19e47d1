//! Shared types for the Warren agent runtime.
//!
//! Every other crate depends on this one: the error enum, the runtime
//! configuration tree (with global ⊕ agent layering), the tool result
//! contracts, token usage accounting, and the typed stream events the
//! orchestrator emits.

pub mod config;
pub mod error;
pub mod stream;
pub mod tool;
pub mod usage;

pub use error::{Error, Result};
