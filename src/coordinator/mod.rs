//! Execution coordinator: the loop that glues queue, placement, worker
//! factory and sessions together.
//!
//! The coordinator pulls runnable jobs, places them on a pool, binds them
//! to an idle worker session (provisioning new workers when a pool has
//! none), relays status and log traffic, and drives the job state machine
//! to a terminal status with retry and cancellation handling. The loop is
//! single-flight; admissions, worker changes and a periodic tick wake it.

mod logs;

pub use logs::LogSink;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::artifacts::cache::{ArtifactCache, ArtifactKind, CompressionKind};
use crate::artifacts::transfer::chunk_stream;
use crate::events::{DomainEvent, EventBus};
use crate::ids::{ArtifactId, ExecutionId, JobId, PoolId, WorkerId};
use crate::protocol::{OrchestratorMessage, StatusEventType, WorkerMessage};
use crate::repository::{ExecutionRepository, JobRepository, RepositoryError};
use crate::scheduler::job::{
    Execution, Job, JobStatus, JobValidationError, TransitionError,
};
use crate::scheduler::placement::{PlacementError, PlacementScheduler};
use crate::scheduler::queue::{EnqueueOutcome, JobQueue, QueuedJob};
use crate::scheduler::resources::ResourceRequirements;
use crate::session::{SessionEvent, SessionRegistry};
use crate::workers::factory::{FactoryError, WorkerFactory};

/// Failure reason attached to executions lost to transport failures.
pub const WORKER_DISCONNECTED_REASON: &str = "worker-disconnected";

/// Errors surfaced by the coordinator's public operations.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("job {job_id} in status {status} cannot be cancelled")]
    NotCancellable { job_id: JobId, status: JobStatus },

    #[error("job {job_id} in status {status} cannot be retried")]
    NotRetryable { job_id: JobId, status: JobStatus },

    #[error(transparent)]
    Validation(#[from] JobValidationError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Tunables of the coordinator loop.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Wakeup interval when nothing else happens.
    pub tick_interval: Duration,
    /// How long a cancelled execution may take to produce a result
    /// before the worker is terminated forcibly.
    pub grace_period: Duration,
    /// How long an idle worker is retained for reuse; zero destroys
    /// workers as soon as their execution finishes.
    pub worker_reuse_window: Duration,
    /// Log lines retained per execution.
    pub log_tail_lines: usize,
    /// Chunk payload size for artifact streaming.
    pub artifact_chunk_size: usize,
    /// Compression applied to streamed artifact chunks.
    pub artifact_compression: CompressionKind,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            grace_period: Duration::from_secs(30),
            worker_reuse_window: Duration::from_secs(300),
            log_tail_lines: 100,
            artifact_chunk_size: crate::artifacts::transfer::DEFAULT_CHUNK_SIZE,
            artifact_compression: CompressionKind::Gzip,
        }
    }
}

/// An artifact staged as input for a job, streamed to workers on demand.
#[derive(Debug, Clone)]
pub struct StagedArtifact {
    pub artifact_id: ArtifactId,
    pub kind: ArtifactKind,
    pub data: Vec<u8>,
}

struct InFlight {
    entry: QueuedJob,
    worker_id: WorkerId,
}

enum DispatchOutcome {
    Dispatched,
    Requeued,
    Dropped,
}

/// The orchestration engine's driving component.
pub struct Coordinator {
    queue: Arc<JobQueue>,
    placement: Arc<PlacementScheduler>,
    factory: Arc<WorkerFactory>,
    sessions: Arc<SessionRegistry>,
    jobs: Arc<dyn JobRepository>,
    executions: Arc<dyn ExecutionRepository>,
    cache: Arc<ArtifactCache>,
    events: EventBus,
    logs: LogSink,
    config: CoordinatorConfig,
    inbox: Mutex<mpsc::Receiver<SessionEvent>>,
    in_flight: DashMap<ExecutionId, InFlight>,
    cancelling: DashMap<ExecutionId, String>,
    staged: DashMap<JobId, Vec<StagedArtifact>>,
    pending_provisions: DashMap<PoolId, usize>,
    shutdown: broadcast::Sender<()>,
}

impl Coordinator {
    /// Wires the coordinator over its collaborators. `inbox` must be the
    /// receiving end of the channel the session registry publishes on.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<JobQueue>,
        placement: Arc<PlacementScheduler>,
        factory: Arc<WorkerFactory>,
        sessions: Arc<SessionRegistry>,
        jobs: Arc<dyn JobRepository>,
        executions: Arc<dyn ExecutionRepository>,
        cache: Arc<ArtifactCache>,
        events: EventBus,
        inbox: mpsc::Receiver<SessionEvent>,
        config: CoordinatorConfig,
    ) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(1);
        let logs = LogSink::new(config.log_tail_lines);
        Arc::new(Self {
            queue,
            placement,
            factory,
            sessions,
            jobs,
            executions,
            cache,
            events,
            logs,
            config,
            inbox: Mutex::new(inbox),
            in_flight: DashMap::new(),
            cancelling: DashMap::new(),
            staged: DashMap::new(),
            pending_provisions: DashMap::new(),
            shutdown,
        })
    }

    /// The bus lifecycle observers subscribe on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Retained log tail of an execution.
    pub fn log_tail(&self, execution_id: &ExecutionId, n: usize) -> Vec<String> {
        self.logs.tail(execution_id, n)
    }

    /// Admits a job into the queue.
    ///
    /// Validation failures are surfaced synchronously; duplicate and
    /// queue-full rejections come back as the enqueue outcome.
    pub async fn submit_job(
        &self,
        mut job: Job,
        requirements: ResourceRequirements,
        affinity: HashMap<String, String>,
    ) -> Result<EnqueueOutcome, CoordinatorError> {
        job.validate()?;
        job.transition(JobStatus::Queued)?;

        let job_id = job.id.clone();
        let outcome = self.queue.enqueue(job.clone(), requirements, affinity);
        if outcome.is_success() {
            self.jobs.save(job).await?;
            self.events.publish(DomainEvent::JobQueued {
                job_id,
                at: Utc::now(),
            });
            crate::metrics::set_queue_depth(self.queue.len());
        }
        Ok(outcome)
    }

    /// Re-admits a failed job.
    pub async fn retry_job(
        &self,
        job_id: &JobId,
        requirements: ResourceRequirements,
        affinity: HashMap<String, String>,
    ) -> Result<EnqueueOutcome, CoordinatorError> {
        let mut job = self
            .jobs
            .find_by_id(job_id)
            .await?
            .ok_or_else(|| CoordinatorError::JobNotFound(job_id.clone()))?;
        if job.status != JobStatus::Failed {
            return Err(CoordinatorError::NotRetryable {
                job_id: job_id.clone(),
                status: job.status,
            });
        }
        job.transition(JobStatus::Queued)?;
        job.completed_at = None;

        let outcome = self.queue.enqueue(job.clone(), requirements, affinity);
        if outcome.is_success() {
            self.jobs.save(job).await?;
            self.events.publish(DomainEvent::JobQueued {
                job_id: job_id.clone(),
                at: Utc::now(),
            });
        }
        Ok(outcome)
    }

    /// Stages input artifacts for a job. Missing cache entries are
    /// streamed from here when the worker asks for them.
    pub fn stage_artifacts(&self, job_id: JobId, artifacts: Vec<StagedArtifact>) {
        self.staged.insert(job_id, artifacts);
    }

    /// Cancels a job.
    ///
    /// Queued jobs are dequeued and cancelled immediately. Running jobs
    /// get a `CancelExecution`; if no terminal result arrives within the
    /// grace period the worker is terminated forcibly. Cancelling a
    /// terminal job is a business-rule violation.
    pub async fn cancel_job(self: &Arc<Self>, job_id: &JobId) -> Result<(), CoordinatorError> {
        let mut job = self
            .jobs
            .find_by_id(job_id)
            .await?
            .ok_or_else(|| CoordinatorError::JobNotFound(job_id.clone()))?;

        match job.status {
            JobStatus::Pending | JobStatus::Queued => {
                self.queue.dequeue(job_id);
                job.transition(JobStatus::Cancelled)?;
                self.jobs.save(job).await?;
                self.finish_terminal(job_id, "cancelled");
                Ok(())
            }
            JobStatus::Running => {
                let execution_id = match job.current_execution.clone() {
                    Some(execution_id) => execution_id,
                    None => {
                        job.transition(JobStatus::Cancelled)?;
                        self.jobs.save(job).await?;
                        self.finish_terminal(job_id, "cancelled");
                        return Ok(());
                    }
                };

                let reason = "cancelled-by-request".to_string();
                self.cancelling.insert(execution_id.clone(), reason.clone());

                let worker_id = self
                    .in_flight
                    .get(&execution_id)
                    .map(|inflight| inflight.worker_id.clone());
                if let Some(session) = worker_id.and_then(|id| self.sessions.get(&id)) {
                    let _ = session
                        .send(OrchestratorMessage::CancelExecution {
                            execution_id: execution_id.clone(),
                            reason,
                        })
                        .await;
                }

                let this = Arc::clone(self);
                let grace = self.config.grace_period;
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    if this.in_flight.contains_key(&execution_id) {
                        warn!(execution_id = %execution_id, "grace period elapsed, forcing termination");
                        this.force_cancel(&execution_id).await;
                    }
                });
                Ok(())
            }
            status => Err(CoordinatorError::NotCancellable {
                job_id: job_id.clone(),
                status,
            }),
        }
    }

    /// Signals the run loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Runs the coordinator loop until `shutdown` is called.
    pub async fn run(self: Arc<Self>) {
        info!("coordinator started");
        let mut shutdown = self.shutdown.subscribe();

        loop {
            self.sweep_sessions().await;
            self.reap_idle_workers().await;
            self.dispatch_ready().await;

            let mut inbox = self.inbox.lock().await;
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = self.queue.wait_for_admission() => {}
                event = inbox.recv() => {
                    drop(inbox);
                    match event {
                        Some(event) => self.handle_session_event(event).await,
                        None => break,
                    }
                }
                _ = tokio::time::sleep(self.config.tick_interval) => {}
            }
        }

        info!("coordinator stopped");
    }

    /// Dispatches queued jobs to available workers, then decides whether
    /// new capacity is worth provisioning.
    async fn dispatch_ready(self: &Arc<Self>) {
        loop {
            let candidates = self.sessions.candidates();
            let entry = match self.queue.next_job(&candidates) {
                Some(entry) => entry,
                None => break,
            };
            match self.dispatch(entry).await {
                DispatchOutcome::Dispatched | DispatchOutcome::Dropped => continue,
                // Requeued entries would spin this loop; wait for the
                // next wakeup instead.
                DispatchOutcome::Requeued => break,
            }
        }

        self.maybe_provision().await;
        crate::metrics::set_queue_depth(self.queue.len());
        crate::metrics::set_active_sessions(self.sessions.len());
    }

    async fn dispatch(self: &Arc<Self>, mut entry: QueuedJob) -> DispatchOutcome {
        let pool = match self.placement.find_placement(&entry, None).await {
            Ok(pool) => pool,
            Err(error) => {
                warn!(job_id = %entry.job.id, %error, "placement failed");
                self.handle_placement_failure(entry, error).await;
                return DispatchOutcome::Dropped;
            }
        };

        let session = match self.sessions.idle_matching(&pool.id, &entry.affinity) {
            Some(session) => session,
            None => {
                // No live worker in the chosen pool yet; provision and
                // keep the entry queued until the worker registers.
                self.provision_for(&pool.id, &entry).await;
                self.queue.requeue(entry);
                return DispatchOutcome::Requeued;
            }
        };

        let execution = Execution::new(entry.job.id.clone(), session.worker_id.clone());
        let execution_id = execution.id.clone();

        if let Err(error) = entry.job.transition(JobStatus::Running) {
            error!(job_id = %entry.job.id, %error, "queued entry in unexpected status");
            return DispatchOutcome::Dropped;
        }
        entry.job.started_at = Some(Utc::now());
        entry.job.current_execution = Some(execution_id.clone());

        if session.assign(execution_id.clone()).is_err() {
            // Lost the race for this session; put the entry back.
            let _ = entry.job.transition(JobStatus::Queued);
            self.queue.requeue(entry);
            return DispatchOutcome::Requeued;
        }

        let mut env_vars = entry.job.parameters.clone();
        env_vars.insert("HODEI_JOB_ID".to_string(), entry.job.id.to_string());
        env_vars.insert("HODEI_EXECUTION_ID".to_string(), execution_id.to_string());

        let assignment = OrchestratorMessage::ExecutionAssignment {
            execution_id: execution_id.clone(),
            definition: entry.job.content.clone(),
            env_vars,
        };
        if session.send(assignment).await.is_err() {
            warn!(worker_id = %session.worker_id, "session channel closed during dispatch");
            session.release();
            self.sessions.disconnect(&session.worker_id);
            let _ = entry.job.transition(JobStatus::Queued);
            self.queue.requeue(entry);
            return DispatchOutcome::Requeued;
        }

        let _ = self.jobs.save(entry.job.clone()).await;
        let _ = self.executions.save(execution).await;

        self.events.publish(DomainEvent::AssignmentDispatched {
            job_id: entry.job.id.clone(),
            execution_id: execution_id.clone(),
            worker_id: session.worker_id.clone(),
            at: Utc::now(),
        });
        self.events.publish(DomainEvent::JobStarted {
            job_id: entry.job.id.clone(),
            execution_id: execution_id.clone(),
            worker_id: session.worker_id.clone(),
            at: Utc::now(),
        });

        debug!(job_id = %entry.job.id, execution_id = %execution_id, worker_id = %session.worker_id, "assignment dispatched");
        self.in_flight.insert(
            execution_id,
            InFlight {
                worker_id: session.worker_id.clone(),
                entry,
            },
        );
        DispatchOutcome::Dispatched
    }

    /// Provisions a worker for the highest-ranked waiting entry when its
    /// pool has no capacity pending.
    async fn maybe_provision(self: &Arc<Self>) {
        let entry = match self.queue.peek_next() {
            Some(entry) => entry,
            None => return,
        };

        let pool = match self.placement.find_placement(&entry, None).await {
            Ok(pool) => pool,
            Err(error) => {
                // Placement is retried on dispatch; only unplaceable
                // pinned jobs are drained here.
                if matches!(error, PlacementError::PoolNotFound(_)) {
                    if let Some(entry) = self.queue.dequeue(&entry.job.id) {
                        self.handle_placement_failure(entry, error).await;
                    }
                }
                return;
            }
        };

        if self.sessions.idle_matching(&pool.id, &entry.affinity).is_some() {
            return;
        }
        self.provision_for(&pool.id, &entry).await;
    }

    async fn provision_for(self: &Arc<Self>, pool_id: &PoolId, entry: &QueuedJob) {
        let pool = match self.placement_pool(pool_id) {
            Some(pool) => pool,
            None => return,
        };
        if self.factory.active_in_pool(pool_id).len() >= pool.max_workers {
            return;
        }

        {
            // One outstanding provision per pool; the registration event
            // clears the slot.
            let mut pending = self.pending_provisions.entry(pool_id.clone()).or_insert(0);
            if *pending > 0 {
                return;
            }
            *pending += 1;
        }

        match self
            .factory
            .create_worker(&entry.job.id, &pool, &entry.requirements)
            .await
        {
            Ok(worker) => {
                info!(worker_id = %worker.worker_id, pool_id = %pool_id, "provisioned worker for queued job");
            }
            Err(error) => {
                self.pending_provisions
                    .entry(pool_id.clone())
                    .and_modify(|n| *n = n.saturating_sub(1));
                self.handle_provision_failure(entry, error).await;
            }
        }
    }

    fn placement_pool(&self, pool_id: &PoolId) -> Option<crate::pools::pool::ResourcePool> {
        self.placement.registry().find_by_id(pool_id)
    }

    async fn handle_provision_failure(self: &Arc<Self>, entry: &QueuedJob, error: FactoryError) {
        let retryable = match &error {
            FactoryError::ProvisioningFailed { source, .. } => {
                crate::metrics::record_provision_failure(&provision_kind(source));
                source.is_retryable()
            }
            _ => false,
        };
        warn!(job_id = %entry.job.id, %error, retryable, "worker provisioning failed");

        let Some(entry) = self.queue.dequeue(&entry.job.id) else {
            return;
        };
        if retryable && entry.retry_count < entry.max_retries {
            self.schedule_retry(entry, error.to_string()).await;
        } else {
            self.fail_job(entry, None, error.to_string()).await;
        }
    }

    async fn handle_placement_failure(self: &Arc<Self>, entry: QueuedJob, error: PlacementError) {
        let retryable = matches!(
            error,
            PlacementError::NoActivePools
                | PlacementError::InsufficientCapacity { .. }
                | PlacementError::ProbeFailed { .. }
        );
        if retryable && entry.retry_count < entry.max_retries {
            self.schedule_retry(entry, error.to_string()).await;
        } else {
            self.fail_job(entry, None, error.to_string()).await;
        }
    }

    /// Builds the retry entry and re-admits it after the backoff delay.
    async fn schedule_retry(self: &Arc<Self>, entry: QueuedJob, reason: String) {
        let retried = match self.queue.retry(&entry) {
            Ok(retried) => retried,
            Err(_) => {
                self.fail_job(entry, None, reason).await;
                return;
            }
        };

        let _ = self.jobs.save(retried.job.clone()).await;

        let delay = entry.job.retry_policy.delay_for_attempt(entry.retry_count);
        info!(
            job_id = %entry.job.id,
            retry = retried.retry_count,
            delay_ms = delay.as_millis() as u64,
            reason,
            "scheduling retry"
        );

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let job_id = retried.job.id.clone();
            if this.queue.requeue(retried).is_success() {
                this.events.publish(DomainEvent::JobQueued {
                    job_id,
                    at: Utc::now(),
                });
            }
        });
    }

    async fn fail_job(
        self: &Arc<Self>,
        mut entry: QueuedJob,
        execution_id: Option<ExecutionId>,
        reason: String,
    ) {
        entry.job.mark_failed();
        let _ = self.jobs.save(entry.job.clone()).await;
        self.events.publish(DomainEvent::JobFailed {
            job_id: entry.job.id.clone(),
            execution_id,
            reason,
            at: Utc::now(),
        });
        self.finish_terminal(&entry.job.id, "failed");
    }

    fn finish_terminal(&self, job_id: &JobId, status: &str) {
        self.staged.remove(job_id);
        crate::metrics::record_job_terminal(status);
    }

    async fn handle_session_event(self: &Arc<Self>, event: SessionEvent) {
        match event {
            SessionEvent::Registered { worker_id, pool_id } => {
                self.pending_provisions
                    .entry(pool_id.clone())
                    .and_modify(|n| *n = n.saturating_sub(1));
                self.events.publish(DomainEvent::WorkerRegistered {
                    worker_id,
                    pool_id,
                    at: Utc::now(),
                });
                crate::metrics::set_active_sessions(self.sessions.len());
            }
            SessionEvent::Message { worker_id, message } => {
                self.handle_worker_message(worker_id, message).await;
            }
        }
    }

    async fn handle_worker_message(self: &Arc<Self>, worker_id: WorkerId, message: WorkerMessage) {
        match message {
            WorkerMessage::StatusUpdate {
                execution_id,
                event_type,
                message,
            } => {
                debug!(%worker_id, %execution_id, ?event_type, message, "status update");
                if event_type == StatusEventType::ExecutionStarted {
                    if let Ok(Some(mut execution)) =
                        self.executions.find_by_id(&execution_id).await
                    {
                        execution.status = crate::scheduler::job::ExecutionStatus::Running;
                        let _ = self.executions.save(execution).await;
                    }
                }
            }
            WorkerMessage::LogChunk {
                execution_id,
                stream,
                content,
                ..
            } => {
                self.logs.push(&execution_id, stream, &content);
            }
            WorkerMessage::ExecutionResult {
                execution_id,
                success,
                exit_code,
                details,
            } => {
                self.finish_execution(worker_id, execution_id, success, exit_code, details)
                    .await;
            }
            WorkerMessage::ArtifactCacheQuery {
                job_id,
                artifact_ids,
            } => {
                self.answer_cache_query(&worker_id, job_id, artifact_ids)
                    .await;
            }
            WorkerMessage::RegistrationRequest { .. } | WorkerMessage::Heartbeat { .. } => {
                warn!(%worker_id, "unexpected session-level message in coordinator inbox");
            }
        }
    }

    async fn finish_execution(
        self: &Arc<Self>,
        worker_id: WorkerId,
        execution_id: ExecutionId,
        success: bool,
        exit_code: i32,
        details: String,
    ) {
        let Some((_, inflight)) = self.in_flight.remove(&execution_id) else {
            warn!(%execution_id, "result for unknown execution");
            return;
        };
        let cancelled = self.cancelling.remove(&execution_id).map(|(_, reason)| reason);

        if let Ok(Some(mut execution)) = self.executions.find_by_id(&execution_id).await {
            if let Some(reason) = &cancelled {
                execution.cancel(reason.clone());
            } else if success {
                execution.complete(exit_code);
            } else {
                execution.fail(Some(exit_code), details.clone());
            }
            let elapsed = (Utc::now() - execution.started_at).num_milliseconds().max(0);
            crate::metrics::observe_execution_duration(elapsed as f64 / 1000.0);
            let _ = self.executions.save(execution).await;
        }

        if let Some(session) = self.sessions.get(&worker_id) {
            session.release();
        }

        let mut entry = inflight.entry;
        if let Some(reason) = cancelled {
            let _ = entry.job.transition(JobStatus::Cancelled);
            let _ = self.jobs.save(entry.job.clone()).await;
            self.events.publish(DomainEvent::JobCancelled {
                job_id: entry.job.id.clone(),
                at: Utc::now(),
            });
            info!(job_id = %entry.job.id, reason, "job cancelled");
            self.finish_terminal(&entry.job.id, "cancelled");
        } else if success {
            entry.job.completed_at = Some(Utc::now());
            let _ = entry.job.transition(JobStatus::Completed);
            let _ = self.jobs.save(entry.job.clone()).await;
            self.events.publish(DomainEvent::JobCompleted {
                job_id: entry.job.id.clone(),
                execution_id: execution_id.clone(),
                at: Utc::now(),
            });
            info!(job_id = %entry.job.id, exit_code, "job completed");
            self.finish_terminal(&entry.job.id, "completed");
        } else {
            self.handle_execution_failure(entry, execution_id, details, exit_code)
                .await;
        }

        self.release_worker_if_expired(&worker_id).await;
    }

    async fn handle_execution_failure(
        self: &Arc<Self>,
        mut entry: QueuedJob,
        execution_id: ExecutionId,
        reason: String,
        exit_code: i32,
    ) {
        let transport_loss = reason == WORKER_DISCONNECTED_REASON;
        let retryable = transport_loss || entry.job.retry_policy.retry_on_failure;

        if retryable && entry.retry_count < entry.max_retries {
            // Retry re-admission: RUNNING -> QUEUED.
            let _ = entry.job.transition(JobStatus::Queued);
            self.schedule_retry(entry, reason).await;
        } else {
            warn!(job_id = %entry.job.id, exit_code, reason, "job failed");
            self.fail_job(entry, Some(execution_id), reason).await;
        }
    }

    /// Answers an artifact cache query and streams the missing inputs.
    async fn answer_cache_query(
        self: &Arc<Self>,
        worker_id: &WorkerId,
        job_id: JobId,
        artifact_ids: Vec<ArtifactId>,
    ) {
        let Some(session) = self.sessions.get(worker_id) else {
            return;
        };

        let partition = self.cache.partition(&artifact_ids);
        crate::metrics::record_cache_lookup(partition.cached.len(), partition.missing.len());

        let response = OrchestratorMessage::ArtifactCacheResponse {
            job_id: job_id.clone(),
            cached: partition.cached,
            missing: partition.missing.clone(),
        };
        if session.send(response).await.is_err() {
            return;
        }

        for artifact_id in partition.missing {
            let staged = self.staged.get(&job_id).and_then(|artifacts| {
                artifacts
                    .iter()
                    .find(|artifact| artifact.artifact_id == artifact_id)
                    .cloned()
            });
            let Some(staged) = staged else {
                warn!(%job_id, %artifact_id, "no staged input for missing artifact");
                continue;
            };

            let mut chunks = Box::pin(chunk_stream(
                staged.artifact_id.clone(),
                staged.data.clone(),
                self.config.artifact_chunk_size,
                self.config.artifact_compression,
            ));
            let mut aborted = false;
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(chunk) => {
                        if session
                            .send(OrchestratorMessage::ArtifactChunk(chunk))
                            .await
                            .is_err()
                        {
                            aborted = true;
                            break;
                        }
                    }
                    Err(error) => {
                        error!(%artifact_id, %error, "artifact chunking failed");
                        aborted = true;
                        break;
                    }
                }
            }

            if !aborted {
                self.cache
                    .insert(staged.artifact_id, staged.kind, staged.data);
            }
        }
    }

    async fn force_cancel(self: &Arc<Self>, execution_id: &ExecutionId) {
        let Some((_, inflight)) = self.in_flight.remove(execution_id) else {
            return;
        };
        let reason = self
            .cancelling
            .remove(execution_id)
            .map(|(_, reason)| reason)
            .unwrap_or_else(|| "cancelled".to_string());

        if self.factory.destroy_worker(&inflight.worker_id).await.is_ok() {
            debug!(worker_id = %inflight.worker_id, "worker terminated after grace period");
        }
        self.sessions.disconnect(&inflight.worker_id);
        self.events.publish(DomainEvent::WorkerDisconnected {
            worker_id: inflight.worker_id.clone(),
            at: Utc::now(),
        });

        if let Ok(Some(mut execution)) = self.executions.find_by_id(execution_id).await {
            execution.cancel(format!("{reason}; grace period elapsed"));
            let _ = self.executions.save(execution).await;
        }

        let mut entry = inflight.entry;
        let _ = entry.job.transition(JobStatus::Cancelled);
        let _ = self.jobs.save(entry.job.clone()).await;
        self.events.publish(DomainEvent::JobCancelled {
            job_id: entry.job.id.clone(),
            at: Utc::now(),
        });
        self.finish_terminal(&entry.job.id, "cancelled");
    }

    /// Disconnects sessions that missed their heartbeats and fails their
    /// in-flight executions with the transport-loss cause.
    async fn sweep_sessions(self: &Arc<Self>) {
        let swept = self.sessions.sweep_stale(Utc::now());
        for (worker_id, in_flight_execution) in swept {
            self.events.publish(DomainEvent::WorkerDisconnected {
                worker_id: worker_id.clone(),
                at: Utc::now(),
            });
            if self.factory.get(&worker_id).is_some() {
                let _ = self.factory.destroy_worker(&worker_id).await;
            }

            let Some(execution_id) = in_flight_execution else {
                continue;
            };
            let Some((_, inflight)) = self.in_flight.remove(&execution_id) else {
                continue;
            };

            if let Ok(Some(mut execution)) = self.executions.find_by_id(&execution_id).await {
                execution.fail(None, WORKER_DISCONNECTED_REASON);
                let _ = self.executions.save(execution).await;
            }
            self.handle_execution_failure(
                inflight.entry,
                execution_id,
                WORKER_DISCONNECTED_REASON.to_string(),
                -1,
            )
            .await;
        }
    }

    /// Destroys workers idle past the reuse window.
    async fn reap_idle_workers(self: &Arc<Self>) {
        if self.config.worker_reuse_window.is_zero() {
            return;
        }
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.worker_reuse_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        for session in self.sessions.idle_since_before(cutoff) {
            info!(worker_id = %session.worker_id, "reaping worker idle past reuse window");
            self.sessions.disconnect(&session.worker_id);
            if self.factory.get(&session.worker_id).is_some() {
                let _ = self.factory.destroy_worker(&session.worker_id).await;
            }
            self.events.publish(DomainEvent::WorkerDisconnected {
                worker_id: session.worker_id.clone(),
                at: Utc::now(),
            });
        }
    }

    async fn release_worker_if_expired(self: &Arc<Self>, worker_id: &WorkerId) {
        if !self.config.worker_reuse_window.is_zero() {
            return;
        }
        self.sessions.disconnect(worker_id);
        if self.factory.get(worker_id).is_some() {
            let _ = self.factory.destroy_worker(worker_id).await;
        }
        self.events.publish(DomainEvent::WorkerDisconnected {
            worker_id: worker_id.clone(),
            at: Utc::now(),
        });
    }
}

fn provision_kind(error: &crate::workers::instance::ProvisioningError) -> String {
    use crate::workers::instance::ProvisioningError::*;
    match error {
        PoolNotFound(_) => "pool-not-found",
        InsufficientCapacity(_) => "insufficient-capacity",
        BackendUnavailable(_) => "backend-unavailable",
        QuotaExceeded(_) => "quota-exceeded",
        Timeout(_) => "timeout",
        BadSpec(_) => "bad-spec",
    }
    .to_string()
}
