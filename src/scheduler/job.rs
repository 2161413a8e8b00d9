//! Job definitions for the orchestration engine.
//!
//! This module defines the core job types:
//!
//! - `Job`: a unit of work submitted by a user, with its lifecycle status
//! - `JobContent`: the workload variant (shell commands or a script)
//! - `RetryPolicy`: retry budget and multiplicative backoff
//! - `Execution`: a single run of a job on a specific worker

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{ExecutionId, JobId, PoolId, WorkerId};

/// Default base priority for jobs.
pub const DEFAULT_PRIORITY: u16 = 500;

/// Lowest accepted base priority.
pub const MIN_PRIORITY: u16 = 1;

/// Highest accepted base priority.
pub const MAX_PRIORITY: u16 = 1000;

/// Attempted job status transition outside the allowed set.
#[derive(Debug, Error)]
#[error("invalid job transition {from} -> {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Job rejected at the admission boundary.
#[derive(Debug, Error)]
pub enum JobValidationError {
    #[error("job name must not be empty")]
    EmptyName,

    #[error("priority {0} outside accepted range {MIN_PRIORITY}..={MAX_PRIORITY}")]
    PriorityOutOfRange(u16),

    #[error("shell job must declare at least one command")]
    NoCommands,

    #[error("script job must not be empty")]
    EmptyScript,
}

/// The workload a job carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobContent {
    /// A sequence of shell commands executed in order.
    Shell {
        commands: Vec<String>,
        #[serde(default)]
        timeout: Option<Duration>,
    },
    /// A single script body handed to the worker's interpreter.
    Script {
        source: String,
        #[serde(default)]
        timeout: Option<Duration>,
    },
}

impl JobContent {
    /// Convenience constructor for a shell workload without timeout.
    pub fn shell(commands: Vec<String>) -> Self {
        Self::Shell {
            commands,
            timeout: None,
        }
    }

    /// Convenience constructor for a script workload without timeout.
    pub fn script(source: impl Into<String>) -> Self {
        Self::Script {
            source: source.into(),
            timeout: None,
        }
    }

    /// Returns the workload timeout, if one was declared.
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            Self::Shell { timeout, .. } | Self::Script { timeout, .. } => *timeout,
        }
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Returns whether the transition `self -> to` is allowed.
    ///
    /// `Running -> Queued` exists solely for retry re-admission.
    pub fn can_transition(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Queued)
                | (Pending, Cancelled)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Queued)
                | (Failed, Queued)
        )
    }

    /// Returns whether this status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Retry budget and backoff configuration for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Base delay before the first retry.
    pub retry_delay: Duration,
    /// Multiplier applied per attempt: `retry_delay * multiplier^attempt`.
    pub backoff_multiplier: f64,
    /// Whether a non-zero exit code is a retryable cause.
    pub retry_on_failure: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            retry_on_failure: false,
        }
    }
}

impl RetryPolicy {
    /// Returns the delay before retry number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        self.retry_delay.mul_f64(factor.max(0.0))
    }
}

/// A unit of work submitted by a user.
///
/// Jobs are created by admission, mutated only by the coordinator, and
/// destroyed by retention policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: JobId,
    /// Human-readable name.
    pub name: String,
    /// The workload to execute.
    pub content: JobContent,
    /// Key/value parameters exported into the execution environment.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Optional explicit target pool.
    #[serde(default)]
    pub pool_id: Option<PoolId>,
    /// Base priority, 1-1000.
    pub priority: u16,
    /// Retry budget and backoff.
    pub retry_policy: RetryPolicy,
    /// Free-form labels.
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// When this job was created.
    pub created_at: DateTime<Utc>,
    /// When this job was last mutated.
    pub updated_at: DateTime<Utc>,
    /// Principal that submitted the job, when known.
    #[serde(default)]
    pub created_by: Option<String>,
    /// Earliest time the job may be dispatched.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Hard deadline; past it the queued entry counts as expired.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Caller-estimated run duration, used for deadline pressure.
    #[serde(default)]
    pub estimated_duration: Option<Duration>,
    /// The execution currently bound to this job, if any.
    #[serde(default)]
    pub current_execution: Option<ExecutionId>,
    /// When the current/last execution started.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal execution outcome.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Lifecycle status.
    pub status: JobStatus,
}

impl Job {
    /// Creates a new pending job with default priority and retry policy.
    pub fn new(name: impl Into<String>, content: JobContent) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::random(),
            name: name.into(),
            content,
            parameters: HashMap::new(),
            pool_id: None,
            priority: DEFAULT_PRIORITY,
            retry_policy: RetryPolicy::default(),
            labels: HashMap::new(),
            created_at: now,
            updated_at: now,
            created_by: None,
            scheduled_at: None,
            deadline: None,
            estimated_duration: None,
            current_execution: None,
            started_at: None,
            completed_at: None,
            status: JobStatus::Pending,
        }
    }

    /// Sets the base priority.
    pub fn with_priority(mut self, priority: u16) -> Self {
        self.priority = priority;
        self
    }

    /// Pins the job to a specific pool.
    pub fn with_pool(mut self, pool_id: PoolId) -> Self {
        self.pool_id = Some(pool_id);
        self
    }

    /// Sets the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Sets the hard deadline.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets the estimated duration.
    pub fn with_estimated_duration(mut self, estimate: Duration) -> Self {
        self.estimated_duration = Some(estimate);
        self
    }

    /// Adds execution-environment parameters.
    pub fn with_parameters(mut self, parameters: HashMap<String, String>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Adds free-form labels.
    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    /// Records the submitting principal.
    pub fn with_created_by(mut self, principal: impl Into<String>) -> Self {
        self.created_by = Some(principal.into());
        self
    }

    /// Validates boundary constraints before admission.
    pub fn validate(&self) -> Result<(), JobValidationError> {
        if self.name.trim().is_empty() {
            return Err(JobValidationError::EmptyName);
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.priority) {
            return Err(JobValidationError::PriorityOutOfRange(self.priority));
        }
        match &self.content {
            JobContent::Shell { commands, .. } if commands.is_empty() => {
                Err(JobValidationError::NoCommands)
            }
            JobContent::Script { source, .. } if source.trim().is_empty() => {
                Err(JobValidationError::EmptyScript)
            }
            _ => Ok(()),
        }
    }

    /// Marks the job failed from any non-terminal state.
    ///
    /// This is the coordinator's failure path for jobs that never reach
    /// `Running` (placement or provisioning failures strand them in
    /// `Queued`); the public API still rejects the move via
    /// [`Job::transition`].
    pub(crate) fn mark_failed(&mut self) {
        if !self.status.is_terminal() {
            self.status = JobStatus::Failed;
            let now = Utc::now();
            self.completed_at = Some(now);
            self.updated_at = now;
        }
    }

    /// Moves the job to `to`, rejecting transitions outside the allowed set.
    pub fn transition(&mut self, to: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition(to) {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Status of a single execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Starting,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Starting => "starting",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A single run of a job on a specific worker.
///
/// Created when an assignment is dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub status: ExecutionStatus,
    /// Structured reason attached to failed or cancelled runs.
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl Execution {
    /// Creates a new execution in the `Starting` state.
    pub fn new(job_id: JobId, worker_id: WorkerId) -> Self {
        Self {
            id: ExecutionId::random(),
            job_id,
            worker_id,
            started_at: Utc::now(),
            completed_at: None,
            exit_code: None,
            status: ExecutionStatus::Starting,
            failure_reason: None,
        }
    }

    /// Marks the execution as completed with the given exit code.
    pub fn complete(&mut self, exit_code: i32) {
        self.status = ExecutionStatus::Completed;
        self.exit_code = Some(exit_code);
        self.completed_at = Some(Utc::now());
    }

    /// Marks the execution as failed with a structured reason.
    pub fn fail(&mut self, exit_code: Option<i32>, reason: impl Into<String>) {
        self.status = ExecutionStatus::Failed;
        self.exit_code = exit_code;
        self.failure_reason = Some(reason.into());
        self.completed_at = Some(Utc::now());
    }

    /// Marks the execution as cancelled.
    pub fn cancel(&mut self, reason: impl Into<String>) {
        self.status = ExecutionStatus::Cancelled;
        self.failure_reason = Some(reason.into());
        self.completed_at = Some(Utc::now());
    }

    /// Returns whether the execution has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_job() -> Job {
        Job::new("build", JobContent::shell(vec!["make".to_string()]))
    }

    #[test]
    fn test_job_defaults() {
        let job = shell_job();

        assert_eq!(job.priority, DEFAULT_PRIORITY);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_policy.max_retries, 0);
        assert!(job.current_execution.is_none());
        assert!(job.validate().is_ok());
    }

    #[test]
    fn test_allowed_transitions() {
        use JobStatus::*;

        assert!(Pending.can_transition(Queued));
        assert!(Pending.can_transition(Cancelled));
        assert!(Queued.can_transition(Running));
        assert!(Queued.can_transition(Cancelled));
        assert!(Running.can_transition(Completed));
        assert!(Running.can_transition(Failed));
        assert!(Running.can_transition(Cancelled));
        assert!(Running.can_transition(Queued));
        assert!(Failed.can_transition(Queued));
    }

    #[test]
    fn test_terminal_states_reject_transitions() {
        use JobStatus::*;

        for to in [Pending, Queued, Running, Completed, Failed, Cancelled] {
            assert!(!Completed.can_transition(to));
            assert!(!Cancelled.can_transition(to));
        }
        assert!(Completed.is_terminal());
        assert!(Cancelled.is_terminal());
        assert!(!Running.is_terminal());
    }

    #[test]
    fn test_transition_rejects_invalid_move() {
        let mut job = shell_job();

        let err = job.transition(JobStatus::Running).unwrap_err();
        assert_eq!(err.from, JobStatus::Pending);
        assert_eq!(err.to, JobStatus::Running);
        assert_eq!(job.status, JobStatus::Pending);

        job.transition(JobStatus::Queued).unwrap();
        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Completed).unwrap();
        assert!(job.transition(JobStatus::Queued).is_err());
    }

    #[test]
    fn test_validation_rejects_bad_jobs() {
        let job = Job::new("", JobContent::shell(vec!["true".to_string()]));
        assert!(matches!(job.validate(), Err(JobValidationError::EmptyName)));

        let job = shell_job().with_priority(0);
        assert!(matches!(
            job.validate(),
            Err(JobValidationError::PriorityOutOfRange(0))
        ));

        let job = shell_job().with_priority(1001);
        assert!(matches!(
            job.validate(),
            Err(JobValidationError::PriorityOutOfRange(1001))
        ));

        let job = Job::new("empty", JobContent::shell(vec![]));
        assert!(matches!(job.validate(), Err(JobValidationError::NoCommands)));

        let job = Job::new("empty", JobContent::script("  "));
        assert!(matches!(
            job.validate(),
            Err(JobValidationError::EmptyScript)
        ));
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy {
            max_retries: 2,
            retry_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            retry_on_failure: true,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn test_job_serialization_roundtrip() {
        let job = shell_job()
            .with_priority(750)
            .with_pool(PoolId::new("default"));

        let json = serde_json::to_string(&job).expect("serialization should work");
        let parsed: Job = serde_json::from_str(&json).expect("deserialization should work");

        assert_eq!(parsed.id, job.id);
        assert_eq!(parsed.priority, 750);
        assert_eq!(parsed.pool_id, Some(PoolId::new("default")));
        assert_eq!(parsed.content, job.content);
    }

    #[test]
    fn test_execution_lifecycle() {
        let mut execution = Execution::new(JobId::new("j1"), WorkerId::new("w1"));
        assert_eq!(execution.status, ExecutionStatus::Starting);
        assert!(!execution.is_terminal());

        execution.status = ExecutionStatus::Running;
        execution.complete(0);

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.exit_code, Some(0));
        assert!(execution.completed_at.is_some());
        assert!(execution.is_terminal());
    }

    #[test]
    fn test_execution_failure_carries_reason() {
        let mut execution = Execution::new(JobId::new("j1"), WorkerId::new("w1"));
        execution.fail(Some(2), "worker-disconnected");

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(
            execution.failure_reason.as_deref(),
            Some("worker-disconnected")
        );
    }
}
