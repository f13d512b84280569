//! Business logic for the durable task queue and dispatch engine: task and
//! run lifecycle, dependency resolution, work claiming, background
//! resolvers, and worker liveness tracking, all built on top of
//! `taskforge-db`'s Postgres-backed storage primitives.

pub mod config;
pub mod credential;
pub mod dependency;
pub mod error;
pub mod event_bus;
pub mod lifecycle;
pub mod resolvers;
pub mod work_claimer;
pub mod worker_registry;

pub use config::EngineConfig;
pub use credential::{CredentialConfig, CredentialError, RunCredentialClaims};
pub use dependency::DependencyTracker;
pub use error::{EngineError, EngineResult};
pub use event_bus::{Event, EventSink, RecordingSink, Topic, TracingSink};
pub use lifecycle::{TaskDefinition, TaskLifecycle};
pub use resolvers::Resolvers;
pub use work_claimer::{ClaimedRun, PendingCountCache, WorkClaimer};
pub use worker_registry::WorkerRegistry;
