//! reliq – reliable per-key FIFO message queues with at-least-once delivery.
//!
//! This crate exports
//!  * `core`   – message identifiers, the queue engine, blocking coordination,
//!               wire codec and snapshot persistence
//!  * `broker` – TCP server-side engine and a small request/reply client
//!  * `config` – TOML-driven runtime configuration
//!
//! Downstream applications can embed the broker engine (`start_broker`) or
//! drive a `QueueStore` directly as a library.

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod broker;
pub mod config;
pub mod core;
pub mod logging;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use crate::broker::server::serve as start_broker;
pub use crate::config::{load_config, Config};
pub use crate::core::store::QueueStore;
