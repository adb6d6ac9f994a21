//! TCP broker engine.
//!
//! - `server`: accept loop, per-connection tasks, command dispatch against
//!   the shared [`crate::core::store::QueueStore`].
//! - `client`: a small request/reply client used by the CLIs and the
//!   integration tests.

pub mod client;
pub mod server;

pub use self::server::serve;
