//! Job scheduling: the queue, priority aging, and pool placement.
//!
//! - **JobQueue**: bounded in-memory queue with at-most-one entry per
//!   job id, effective-priority ranking and affinity-aware dispatch
//! - **PlacementScheduler**: concurrent utilization probes and pluggable
//!   pool-selection strategies
//! - **Job / Execution**: the job aggregate, its status machine and
//!   per-run execution records

pub mod job;
pub mod placement;
pub mod queue;
pub mod resources;

pub use job::{Execution, ExecutionStatus, Job, JobContent, JobStatus, RetryPolicy};
pub use placement::{PlacementError, PlacementScheduler, PlacementStrategy, ResourceMonitor};
pub use queue::{
    CandidateWorker, EnqueueOutcome, JobQueue, QueueError, QueuedJob, QueuedJobStatus, QueueStats,
    SchedulingStrategy,
};
pub use resources::{parse_memory, ResourceRequirements};
