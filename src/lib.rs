//! Hodei Pipelines orchestration engine.
//!
//! Server-side core of a distributed CI-style job execution platform:
//! job queue with priority aging, pluggable pool placement, ephemeral
//! worker provisioning over an abstract instance-manager port, a
//! bidirectional worker session protocol with artifact transfer, and the
//! coordinator that drives job and worker lifecycles end to end.

pub mod artifacts;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod ids;
pub mod metrics;
pub mod pools;
pub mod protocol;
pub mod repository;
pub mod scheduler;
pub mod session;
pub mod workers;

// Re-export the types most callers touch.
pub use config::OrchestratorConfig;
pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorError};
pub use events::{DomainEvent, EventBus, EventKind};
pub use ids::{ArtifactId, ExecutionId, JobId, PoolId, WorkerId};
pub use scheduler::{Job, JobContent, JobStatus};
