//! In-memory job queue with priority aging and matching dispatch.
//!
//! The queue holds at most one `QueuedJob` per job id and hands out the
//! highest-ranked entry for which a candidate worker matches the job's
//! affinity labels and has free capacity. Ranking depends on the queue's
//! strategy:
//!
//! - `PriorityBased` (default): effective priority descending, then
//!   queued-at ascending
//! - `Fifo`: queued-at ascending, priority ignored
//! - `Deadline`: deadline ascending (missing deadlines last), ties broken
//!   by effective priority
//!
//! Entries past their deadline are expired and are always dequeued first.
//! All public operations run inside a single critical section.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

use crate::ids::{JobId, WorkerId};
use crate::scheduler::job::Job;
use crate::scheduler::resources::ResourceRequirements;

/// Ceiling for the age boost.
const MAX_AGE_BOOST: i64 = 300;

/// Boost granted per 10 full minutes of waiting.
const AGE_BOOST_STEP: i64 = 50;

/// Boost granted when the job is unlikely to meet its deadline.
const DEADLINE_BOOST: i64 = 200;

/// Boost granted once the deadline has passed.
const EXPIRED_BOOST: i64 = 500;

/// Effective priority clamp bounds.
const EFFECTIVE_MIN: i64 = 1;
const EFFECTIVE_MAX: i64 = 10_000;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Retry requested for an entry that has exhausted its budget.
    #[error("job {job_id} exhausted its retry budget ({max_retries})")]
    RetriesExhausted { job_id: JobId, max_retries: u32 },
}

/// Ranking strategy for `next_job`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingStrategy {
    PriorityBased,
    Fifo,
    Deadline,
}

impl Default for SchedulingStrategy {
    fn default() -> Self {
        Self::PriorityBased
    }
}

impl SchedulingStrategy {
    /// Parses a strategy name; unknown names fall back to the default.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "fifo" => Self::Fifo,
            "deadline" => Self::Deadline,
            _ => Self::PriorityBased,
        }
    }
}

/// Status of a queued entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueuedJobStatus {
    Waiting,
    Dispatching,
    Expired,
    Retrying,
}

/// A job admitted into the queue, wrapped with scheduling state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    /// The admitted job.
    pub job: Job,
    /// When this entry was (re)admitted.
    pub queued_at: DateTime<Utc>,
    /// Base priority copied from the job at admission.
    pub base_priority: u16,
    /// How many retries this entry has consumed.
    pub retry_count: u32,
    /// Retry budget copied from the job's policy.
    pub max_retries: u32,
    /// Hard deadline copied from the job.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Estimated run duration copied from the job.
    #[serde(default)]
    pub estimated_duration: Option<Duration>,
    /// CPU/memory the job asks for.
    pub requirements: ResourceRequirements,
    /// Labels a worker must carry to run this job.
    #[serde(default)]
    pub affinity: HashMap<String, String>,
    /// Scheduling status of the entry.
    pub status: QueuedJobStatus,
}

impl QueuedJob {
    /// Wraps a job for admission.
    pub fn new(
        job: Job,
        requirements: ResourceRequirements,
        affinity: HashMap<String, String>,
    ) -> Self {
        let base_priority = job.priority;
        let max_retries = job.retry_policy.max_retries;
        let deadline = job.deadline;
        let estimated_duration = job.estimated_duration;
        Self {
            job,
            queued_at: Utc::now(),
            base_priority,
            retry_count: 0,
            max_retries,
            deadline,
            estimated_duration,
            requirements,
            affinity,
            status: QueuedJobStatus::Waiting,
        }
    }

    /// Returns whether the deadline has passed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.deadline, Some(deadline) if deadline < now)
    }

    /// Effective priority at `now`:
    /// `base + ageBoost + deadlineBoost + expiredBoost`, clamped to
    /// [1, 10000].
    ///
    /// - `ageBoost = min(300, floor(minutesWaiting / 10) * 50)`
    /// - `deadlineBoost = 200` when `now + estimatedDuration` falls past
    ///   `deadline - 10min` and the deadline has not passed yet
    /// - `expiredBoost = 500` once the deadline has passed (replaces the
    ///   deadline boost)
    pub fn effective_priority_at(&self, now: DateTime<Utc>) -> i64 {
        let minutes_waiting = (now - self.queued_at).num_minutes().max(0);
        let age_boost = (minutes_waiting / 10 * AGE_BOOST_STEP).min(MAX_AGE_BOOST);

        let mut deadline_boost = 0;
        let mut expired_boost = 0;
        if let Some(deadline) = self.deadline {
            if deadline < now {
                expired_boost = EXPIRED_BOOST;
            } else {
                let estimate = self
                    .estimated_duration
                    .and_then(|d| chrono::Duration::from_std(d).ok())
                    .unwrap_or_else(chrono::Duration::zero);
                if now + estimate > deadline - chrono::Duration::minutes(10) {
                    deadline_boost = DEADLINE_BOOST;
                }
            }
        }

        (self.base_priority as i64 + age_boost + deadline_boost + expired_boost)
            .clamp(EFFECTIVE_MIN, EFFECTIVE_MAX)
    }

    /// Effective priority at the current instant.
    pub fn effective_priority(&self) -> i64 {
        self.effective_priority_at(Utc::now())
    }
}

/// Outcome of an enqueue attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The entry was admitted; carries the new queue size.
    Success(usize),
    /// An entry with the same job id is already queued.
    AlreadyQueued(JobId),
    /// The queue is at its configured capacity.
    QueueFull(usize),
}

impl EnqueueOutcome {
    /// Returns whether the entry was admitted.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// A worker eligible to receive work, as seen by the queue.
#[derive(Debug, Clone)]
pub struct CandidateWorker {
    pub worker_id: WorkerId,
    /// Labels/capabilities the worker advertises.
    pub labels: HashMap<String, String>,
    /// Executions currently bound to the worker.
    pub active_jobs: usize,
    /// Concurrency limit the worker registered with.
    pub max_concurrent_jobs: usize,
}

impl CandidateWorker {
    /// Returns whether the worker can take one more execution.
    pub fn has_capacity(&self) -> bool {
        self.active_jobs < self.max_concurrent_jobs
    }

    /// Returns whether the worker carries every affinity label of the job.
    pub fn matches(&self, affinity: &HashMap<String, String>) -> bool {
        affinity
            .iter()
            .all(|(key, value)| self.labels.get(key) == Some(value))
    }
}

/// Live statistics over the queue contents.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    /// Number of queued entries.
    pub total_jobs: usize,
    /// Entry counts bucketed by base priority class.
    pub priority_breakdown: HashMap<String, usize>,
    /// Id and admission time of the oldest entry.
    pub oldest_job: Option<(JobId, DateTime<Utc>)>,
    /// Mean waiting time of the current entries.
    pub average_wait: Duration,
}

/// Bounded in-memory job queue.
pub struct JobQueue {
    entries: Mutex<HashMap<JobId, QueuedJob>>,
    max_size: usize,
    strategy: SchedulingStrategy,
    admitted: Notify,
}

impl JobQueue {
    /// Creates a queue bounded at `max_size` entries.
    pub fn new(max_size: usize, strategy: SchedulingStrategy) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_size,
            strategy,
            admitted: Notify::new(),
        }
    }

    /// Returns the queue's ranking strategy.
    pub fn strategy(&self) -> SchedulingStrategy {
        self.strategy
    }

    /// Completes when a new entry has been admitted since the call.
    pub async fn wait_for_admission(&self) {
        self.admitted.notified().await;
    }

    /// Admits a job. Duplicates by job id and capacity overflow are
    /// rejected, not errors.
    pub fn enqueue(
        &self,
        job: Job,
        requirements: ResourceRequirements,
        affinity: HashMap<String, String>,
    ) -> EnqueueOutcome {
        let entry = QueuedJob::new(job, requirements, affinity);
        self.admit(entry)
    }

    /// Re-admits an already-wrapped entry (used for retries), subject to
    /// the same duplicate and capacity rules.
    pub fn requeue(&self, mut entry: QueuedJob) -> EnqueueOutcome {
        entry.status = QueuedJobStatus::Waiting;
        self.admit(entry)
    }

    fn admit(&self, entry: QueuedJob) -> EnqueueOutcome {
        let job_id = entry.job.id.clone();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if entries.contains_key(&job_id) {
            return EnqueueOutcome::AlreadyQueued(job_id);
        }
        if entries.len() >= self.max_size {
            return EnqueueOutcome::QueueFull(self.max_size);
        }

        entries.insert(job_id.clone(), entry);
        let size = entries.len();
        drop(entries);

        debug!(job_id = %job_id, queue_size = size, "job admitted");
        self.admitted.notify_waiters();
        EnqueueOutcome::Success(size)
    }

    /// Removes and returns the entry for `job_id`.
    pub fn dequeue(&self, job_id: &JobId) -> Option<QueuedJob> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(job_id)
    }

    /// Returns whether an entry for `job_id` is queued.
    pub fn contains(&self, job_id: &JobId) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(job_id)
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns the highest-ranked entry some candidate worker
    /// can run, or `None` when nothing matches.
    ///
    /// A candidate can run an entry when it carries all the entry's
    /// affinity labels and has free capacity. Entries whose `scheduled_at`
    /// lies in the future are skipped. Expired entries rank first under
    /// every strategy.
    pub fn next_job(&self, candidates: &[CandidateWorker]) -> Option<QueuedJob> {
        let now = Utc::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        let mut best: Option<&QueuedJob> = None;
        for entry in entries.values() {
            if let Some(at) = entry.job.scheduled_at {
                if at > now {
                    continue;
                }
            }
            let runnable = candidates
                .iter()
                .any(|worker| worker.has_capacity() && worker.matches(&entry.affinity));
            if !runnable {
                continue;
            }
            best = match best {
                None => Some(entry),
                Some(current) => {
                    if self.ranks_before(entry, current, now) {
                        Some(entry)
                    } else {
                        Some(current)
                    }
                }
            };
        }

        let job_id = best.map(|entry| entry.job.id.clone())?;
        let mut entry = entries.remove(&job_id)?;
        entry.status = if entry.is_expired(now) {
            QueuedJobStatus::Expired
        } else {
            QueuedJobStatus::Dispatching
        };
        Some(entry)
    }

    /// Returns a copy of the highest-ranked waiting entry without
    /// removing it, ignoring worker matching. Used to decide whether new
    /// capacity is worth provisioning.
    pub fn peek_next(&self) -> Option<QueuedJob> {
        let now = Utc::now();
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        let mut best: Option<&QueuedJob> = None;
        for entry in entries.values() {
            if let Some(at) = entry.job.scheduled_at {
                if at > now {
                    continue;
                }
            }
            best = match best {
                None => Some(entry),
                Some(current) if self.ranks_before(entry, current, now) => Some(entry),
                Some(current) => Some(current),
            };
        }
        best.cloned()
    }

    /// Returns whether `a` ranks strictly before `b` under the queue's
    /// strategy at `now`.
    fn ranks_before(&self, a: &QueuedJob, b: &QueuedJob, now: DateTime<Utc>) -> bool {
        // Expired entries always drain first.
        match (a.is_expired(now), b.is_expired(now)) {
            (true, false) => return true,
            (false, true) => return false,
            _ => {}
        }

        match self.strategy {
            SchedulingStrategy::PriorityBased => {
                let (pa, pb) = (a.effective_priority_at(now), b.effective_priority_at(now));
                if pa != pb {
                    return pa > pb;
                }
                a.queued_at < b.queued_at
            }
            SchedulingStrategy::Fifo => a.queued_at < b.queued_at,
            SchedulingStrategy::Deadline => match (a.deadline, b.deadline) {
                (Some(da), Some(db)) if da != db => da < db,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                _ => {
                    let (pa, pb) = (a.effective_priority_at(now), b.effective_priority_at(now));
                    if pa != pb {
                        return pa > pb;
                    }
                    a.queued_at < b.queued_at
                }
            },
        }
    }

    /// Builds a fresh retry entry from a dispatched one: retry count
    /// incremented, queued-at re-stamped, everything else preserved.
    ///
    /// The caller re-admits the returned entry (usually after a backoff
    /// delay) via [`JobQueue::requeue`].
    pub fn retry(&self, entry: &QueuedJob) -> Result<QueuedJob, QueueError> {
        if entry.retry_count >= entry.max_retries {
            return Err(QueueError::RetriesExhausted {
                job_id: entry.job.id.clone(),
                max_retries: entry.max_retries,
            });
        }

        let mut retried = entry.clone();
        retried.retry_count += 1;
        retried.queued_at = Utc::now();
        retried.status = QueuedJobStatus::Retrying;
        Ok(retried)
    }

    /// Computes statistics over the current contents. Values are derived
    /// live, never cached.
    pub fn stats(&self) -> QueueStats {
        let now = Utc::now();
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        let mut breakdown: HashMap<String, usize> = HashMap::new();
        let mut oldest: Option<(JobId, DateTime<Utc>)> = None;
        let mut total_wait_ms: i64 = 0;

        for entry in entries.values() {
            let class = match entry.base_priority {
                700..=u16::MAX => "high",
                300..=699 => "normal",
                _ => "low",
            };
            *breakdown.entry(class.to_string()).or_insert(0) += 1;

            if oldest
                .as_ref()
                .map(|(_, at)| entry.queued_at < *at)
                .unwrap_or(true)
            {
                oldest = Some((entry.job.id.clone(), entry.queued_at));
            }
            total_wait_ms += (now - entry.queued_at).num_milliseconds().max(0);
        }

        let total_jobs = entries.len();
        let average_wait = if total_jobs > 0 {
            Duration::from_millis((total_wait_ms / total_jobs as i64) as u64)
        } else {
            Duration::ZERO
        };

        QueueStats {
            total_jobs,
            priority_breakdown: breakdown,
            oldest_job: oldest,
            average_wait,
        }
    }
}
