//! Durable file-backed stores shared by the runtime.
//!
//! All mutation of JSON/JSONL files goes through the per-path lock registry
//! in [`locks`], so concurrent writers to the same file serialize while
//! different files proceed in parallel. Audit lines pass through the secret
//! [`redaction`] scrubber before touching disk.

pub mod audit;
pub mod jsonl;
pub mod locks;
pub mod redaction;
pub mod usage_store;

pub use audit::AuditStore;
pub use locks::PathLocks;
pub use usage_store::{UsageQuery, UsageStore};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Seconds since the Unix epoch as a float (session timestamps).
pub fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
