//! Row storage for the task queue and dispatch engine.
//!
//! Every table, row type, and query function the engine persists through —
//! `Store` (tasks/runs), `AdvisoryQueue`, the `EventBus` outbox, task
//! groups/dependencies/artifacts, and the worker registry. Postgres via
//! `sqlx`, migrations loaded at runtime (never the compile-time
//! `sqlx::migrate!()` macro) so this crate builds without a live database.

pub mod config;
pub mod ids;
pub mod models;
pub mod pool;
pub mod queries;
