//! Ticket bridge core library.
//!
//! Continuously ingests ticket records from a ServiceNow instance, stores
//! them in PostgreSQL, keeps them reconciled against upstream changes, and
//! exposes them over HTTP with real-time push.
//!
//! Layout mirrors the runtime layering:
//! - `kernel`: infrastructure (task queue, worker pool, scheduler, change
//!   log, stream pipeline, real-time fan-out, configuration).
//! - `domains`: business logic (ticket synchronization and its job handlers).
//! - `server`: HTTP surface (axum app, routes).
//! - `common`: shared envelope and error types.

pub mod common;
pub mod domains;
pub mod kernel;
pub mod server;

pub use kernel::config::Config;
