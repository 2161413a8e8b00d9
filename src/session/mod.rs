//! Live worker sessions and their state machine.
//!
//! Each connected worker owns one long-lived bidirectional channel. The
//! orchestrator side is modeled as a `WorkerSession` whose outbound
//! direction is a bounded mpsc channel (one sender boundary, so
//! concurrent producers are serialized) and whose lifecycle follows
//!
//! `CONNECTING -> REGISTERED -> IDLE <-> BUSY -> (DRAINING) -> DISCONNECTED`
//!
//! A new registration under an existing worker id displaces the prior
//! session. Workers that stop sending traffic for three heartbeat
//! intervals are swept into `DISCONNECTED`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::{distr::Alphanumeric, RngExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::ids::{ExecutionId, PoolId, WorkerId};
use crate::protocol::{OrchestratorMessage, WorkerMessage};
use crate::scheduler::queue::CandidateWorker;

/// Bound of a session's outbound channel.
const OUTBOUND_BUFFER: usize = 64;

/// Length of issued session tokens.
const TOKEN_LENGTH: usize = 32;

/// Heartbeat intervals a worker may miss before being disconnected.
const MISSED_HEARTBEAT_FACTOR: u32 = 3;

/// Errors that can occur in the session layer.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No live session for the worker id.
    #[error("worker {0} has no live session")]
    NotRegistered(WorkerId),

    /// The worker's transport went away.
    #[error("session channel for worker {0} is closed")]
    ChannelClosed(WorkerId),

    /// Another live worker in the pool already uses the name.
    #[error("worker name '{name}' already registered in pool {pool_id}")]
    NameTaken { name: String, pool_id: PoolId },

    /// Attempted session transition outside the state machine.
    #[error("invalid session transition {from} -> {to} for worker {worker_id}")]
    InvalidTransition {
        worker_id: WorkerId,
        from: SessionState,
        to: SessionState,
    },
}

/// Connection state of a worker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Registered,
    Idle,
    Busy,
    Draining,
    Disconnected,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Connecting => "connecting",
            SessionState::Registered => "registered",
            SessionState::Idle => "idle",
            SessionState::Busy => "busy",
            SessionState::Draining => "draining",
            SessionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Orchestrator-side view of one connected worker.
#[derive(Debug)]
pub struct WorkerSession {
    pub worker_id: WorkerId,
    pub pool_id: PoolId,
    pub worker_name: String,
    pub connected_at: DateTime<Utc>,
    pub capabilities: HashMap<String, String>,
    pub max_concurrent_jobs: usize,
    pub session_token: String,
    state: RwLock<SessionState>,
    last_seen: RwLock<DateTime<Utc>>,
    state_changed_at: RwLock<DateTime<Utc>>,
    current_execution: RwLock<Option<ExecutionId>>,
    active_jobs: AtomicUsize,
    outbound: mpsc::Sender<OrchestratorMessage>,
}

impl WorkerSession {
    fn new(
        worker_id: WorkerId,
        pool_id: PoolId,
        worker_name: String,
        capabilities: HashMap<String, String>,
        max_concurrent_jobs: usize,
        session_token: String,
        outbound: mpsc::Sender<OrchestratorMessage>,
    ) -> Self {
        let now = Utc::now();
        Self {
            worker_id,
            pool_id,
            worker_name,
            connected_at: now,
            capabilities,
            max_concurrent_jobs,
            session_token,
            state: RwLock::new(SessionState::Connecting),
            last_seen: RwLock::new(now),
            state_changed_at: RwLock::new(now),
            current_execution: RwLock::new(None),
            active_jobs: AtomicUsize::new(0),
            outbound,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// When the session last saw traffic from the worker.
    pub fn last_seen(&self) -> DateTime<Utc> {
        *self.last_seen.read().unwrap_or_else(|e| e.into_inner())
    }

    /// When the session last changed state.
    pub fn state_changed_at(&self) -> DateTime<Utc> {
        *self.state_changed_at.read().unwrap_or_else(|e| e.into_inner())
    }

    /// The execution currently bound to the session.
    pub fn current_execution(&self) -> Option<ExecutionId> {
        self.current_execution
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Executions currently counted against the concurrency limit.
    pub fn active_jobs(&self) -> usize {
        self.active_jobs.load(Ordering::SeqCst)
    }

    /// Records traffic from the worker.
    pub fn touch(&self) {
        *self.last_seen.write().unwrap_or_else(|e| e.into_inner()) = Utc::now();
    }

    fn set_state(&self, to: SessionState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = to;
        *self
            .state_changed_at
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Utc::now();
    }

    fn transition(&self, to: SessionState) -> Result<(), SessionError> {
        use SessionState::*;
        let from = self.state();
        let allowed = match to {
            Disconnected => true,
            Draining => from != Disconnected,
            _ => matches!(
                (from, to),
                (Connecting, Registered) | (Registered, Idle) | (Idle, Busy) | (Busy, Idle)
            ),
        };
        if !allowed {
            return Err(SessionError::InvalidTransition {
                worker_id: self.worker_id.clone(),
                from,
                to,
            });
        }
        self.set_state(to);
        Ok(())
    }

    /// Sends a message on the session's outbound direction.
    pub async fn send(&self, message: OrchestratorMessage) -> Result<(), SessionError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| SessionError::ChannelClosed(self.worker_id.clone()))
    }

    /// Binds an execution to the session (`IDLE -> BUSY`).
    pub fn assign(&self, execution_id: ExecutionId) -> Result<(), SessionError> {
        self.transition(SessionState::Busy)?;
        *self
            .current_execution
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(execution_id);
        self.active_jobs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Releases the bound execution (`BUSY -> IDLE`); a draining session
    /// stays draining.
    pub fn release(&self) {
        *self
            .current_execution
            .write()
            .unwrap_or_else(|e| e.into_inner()) = None;
        let _ = self
            .active_jobs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            });
        if self.state() == SessionState::Busy {
            self.set_state(SessionState::Idle);
        }
    }

    /// Moves the session to draining: the current execution finishes,
    /// no new assignments are handed out.
    pub fn drain(&self) {
        if self.state() != SessionState::Disconnected {
            self.set_state(SessionState::Draining);
        }
    }

    /// Marks the session disconnected and returns the in-flight
    /// execution, if any.
    pub fn disconnect(&self) -> Option<ExecutionId> {
        self.set_state(SessionState::Disconnected);
        self.current_execution
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Returns whether the session may receive a new assignment.
    pub fn is_available(&self) -> bool {
        matches!(self.state(), SessionState::Idle)
            || (self.state() == SessionState::Busy
                && self.active_jobs() < self.max_concurrent_jobs)
    }
}

/// Session-layer notifications consumed by the coordinator.
#[derive(Debug)]
pub enum SessionEvent {
    /// A worker completed registration.
    Registered { worker_id: WorkerId, pool_id: PoolId },
    /// A non-session-local message arrived from a worker.
    Message {
        worker_id: WorkerId,
        message: WorkerMessage,
    },
}

/// Registry of live worker sessions.
pub struct SessionRegistry {
    sessions: DashMap<WorkerId, Arc<WorkerSession>>,
    heartbeat_interval: Duration,
    events: mpsc::Sender<SessionEvent>,
}

impl SessionRegistry {
    /// Creates a registry. Session events (registrations, forwarded
    /// worker messages) are delivered on `events`.
    pub fn new(heartbeat_interval: Duration, events: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            sessions: DashMap::new(),
            heartbeat_interval,
            events,
        }
    }

    /// The interval announced to registering workers.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    fn issue_token() -> String {
        rand::rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LENGTH)
            .map(char::from)
            .collect()
    }

    /// Registers a worker and returns its session plus the receiver of
    /// the outbound direction (drained by the transport).
    ///
    /// The first message on the receiver is the registration response. A
    /// prior session under the same worker id is displaced; a live
    /// session under the same name in the same pool rejects the
    /// registration.
    pub async fn register(
        &self,
        worker_id: WorkerId,
        pool_id: PoolId,
        worker_name: String,
        capabilities: HashMap<String, String>,
        max_concurrent_jobs: usize,
    ) -> Result<(Arc<WorkerSession>, mpsc::Receiver<OrchestratorMessage>), SessionError> {
        let name_taken = self.sessions.iter().any(|entry| {
            entry.worker_id != worker_id
                && entry.pool_id == pool_id
                && entry.worker_name == worker_name
                && entry.state() != SessionState::Disconnected
        });
        if name_taken {
            return Err(SessionError::NameTaken {
                name: worker_name,
                pool_id,
            });
        }

        if let Some(previous) = self.sessions.get(&worker_id).map(|entry| entry.clone()) {
            warn!(worker_id = %worker_id, "displacing existing session on re-registration");
            previous.disconnect();
        }

        let token = Self::issue_token();
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let session = Arc::new(WorkerSession::new(
            worker_id.clone(),
            pool_id.clone(),
            worker_name,
            capabilities,
            max_concurrent_jobs.max(1),
            token.clone(),
            tx,
        ));

        session.transition(SessionState::Registered)?;
        session
            .send(OrchestratorMessage::RegistrationResponse {
                success: true,
                message: "registered".to_string(),
                session_token: Some(token),
                heartbeat_interval_seconds: self.heartbeat_interval.as_secs().max(1),
            })
            .await?;
        session.transition(SessionState::Idle)?;

        self.sessions.insert(worker_id.clone(), session.clone());
        info!(worker_id = %worker_id, pool_id = %pool_id, "worker session registered");

        // Coordinator wakeups are best-effort; a full event channel only
        // delays dispatch until the next tick.
        let _ = self
            .events
            .try_send(SessionEvent::Registered { worker_id, pool_id });

        Ok((session, rx))
    }

    /// Routes an inbound worker message.
    ///
    /// Heartbeats are absorbed here; everything else is stamped as
    /// traffic and forwarded to the coordinator.
    pub async fn ingest(
        &self,
        worker_id: &WorkerId,
        message: WorkerMessage,
    ) -> Result<(), SessionError> {
        let session = self
            .get(worker_id)
            .ok_or_else(|| SessionError::NotRegistered(worker_id.clone()))?;
        session.touch();

        if let WorkerMessage::Heartbeat { active_jobs, .. } = &message {
            debug!(worker_id = %worker_id, active_jobs, "heartbeat");
            return Ok(());
        }

        self.events
            .send(SessionEvent::Message {
                worker_id: worker_id.clone(),
                message,
            })
            .await
            .map_err(|_| SessionError::ChannelClosed(worker_id.clone()))
    }

    /// Looks a session up by worker id.
    pub fn get(&self, worker_id: &WorkerId) -> Option<Arc<WorkerSession>> {
        self.sessions.get(worker_id).map(|entry| entry.clone())
    }

    /// Workers eligible for new assignments, as queue candidates.
    pub fn candidates(&self) -> Vec<CandidateWorker> {
        self.sessions
            .iter()
            .filter(|entry| entry.is_available())
            .map(|entry| CandidateWorker {
                worker_id: entry.worker_id.clone(),
                labels: entry.capabilities.clone(),
                active_jobs: entry.active_jobs(),
                max_concurrent_jobs: entry.max_concurrent_jobs,
            })
            .collect()
    }

    /// An idle session in the given pool, if one exists.
    pub fn idle_in_pool(&self, pool_id: &PoolId) -> Option<Arc<WorkerSession>> {
        self.sessions
            .iter()
            .find(|entry| entry.pool_id == *pool_id && entry.state() == SessionState::Idle)
            .map(|entry| entry.clone())
    }

    /// An idle session in the pool whose capabilities carry every
    /// required affinity label.
    pub fn idle_matching(
        &self,
        pool_id: &PoolId,
        affinity: &HashMap<String, String>,
    ) -> Option<Arc<WorkerSession>> {
        self.sessions
            .iter()
            .find(|entry| {
                entry.pool_id == *pool_id
                    && entry.state() == SessionState::Idle
                    && affinity
                        .iter()
                        .all(|(key, value)| entry.capabilities.get(key) == Some(value))
            })
            .map(|entry| entry.clone())
    }

    /// Sessions idle since before `cutoff` (worker-reuse reaping).
    pub fn idle_since_before(&self, cutoff: DateTime<Utc>) -> Vec<Arc<WorkerSession>> {
        self.sessions
            .iter()
            .filter(|entry| {
                entry.state() == SessionState::Idle && entry.state_changed_at() < cutoff
            })
            .map(|entry| entry.clone())
            .collect()
    }

    /// Moves a session to draining.
    pub fn drain(&self, worker_id: &WorkerId) -> Result<(), SessionError> {
        let session = self
            .get(worker_id)
            .ok_or_else(|| SessionError::NotRegistered(worker_id.clone()))?;
        session.drain();
        Ok(())
    }

    /// Disconnects and removes a session, returning its in-flight
    /// execution if any.
    pub fn disconnect(&self, worker_id: &WorkerId) -> Option<Option<ExecutionId>> {
        self.sessions
            .remove(worker_id)
            .map(|(_, session)| session.disconnect())
    }

    /// Sweeps sessions that missed three heartbeat intervals, removing
    /// them and returning `(worker_id, in_flight_execution)` pairs.
    pub fn sweep_stale(&self, now: DateTime<Utc>) -> Vec<(WorkerId, Option<ExecutionId>)> {
        let cutoff = now
            - chrono::Duration::from_std(self.heartbeat_interval * MISSED_HEARTBEAT_FACTOR)
                .unwrap_or_else(|_| chrono::Duration::seconds(90));

        let stale: Vec<WorkerId> = self
            .sessions
            .iter()
            .filter(|entry| entry.last_seen() < cutoff)
            .map(|entry| entry.worker_id.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|worker_id| {
                let (_, session) = self.sessions.remove(&worker_id)?;
                warn!(worker_id = %worker_id, "worker missed heartbeats, disconnecting session");
                Some((worker_id, session.disconnect()))
            })
            .collect()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns whether no sessions are registered.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (SessionRegistry, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (SessionRegistry::new(Duration::from_secs(30), tx), rx)
    }

    async fn register(
        registry: &SessionRegistry,
        id: &str,
        pool: &str,
        name: &str,
    ) -> (Arc<WorkerSession>, mpsc::Receiver<OrchestratorMessage>) {
        registry
            .register(
                WorkerId::new(id),
                PoolId::new(pool),
                name.to_string(),
                HashMap::new(),
                2,
            )
            .await
            .expect("registration should pass")
    }

    #[tokio::test]
    async fn test_registration_issues_token_and_goes_idle() {
        let (registry, mut events) = registry();
        let (session, mut rx) = register(&registry, "w1", "p1", "worker-a").await;

        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.session_token.len(), TOKEN_LENGTH);

        match rx.recv().await.unwrap() {
            OrchestratorMessage::RegistrationResponse {
                success,
                session_token,
                heartbeat_interval_seconds,
                ..
            } => {
                assert!(success);
                assert_eq!(session_token.unwrap().len(), TOKEN_LENGTH);
                assert_eq!(heartbeat_interval_seconds, 30);
            }
            other => panic!("expected registration response, got {other:?}"),
        }

        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::Registered { .. }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_name_in_pool_rejected() {
        let (registry, _events) = registry();
        let _first = register(&registry, "w1", "p1", "worker-a").await;

        let err = registry
            .register(
                WorkerId::new("w2"),
                PoolId::new("p1"),
                "worker-a".to_string(),
                HashMap::new(),
                1,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NameTaken { .. }));

        // Same name in another pool is fine.
        let _other = register(&registry, "w3", "p2", "worker-a").await;
    }

    #[tokio::test]
    async fn test_reregistration_displaces_previous_session() {
        let (registry, _events) = registry();
        let (first, _rx1) = register(&registry, "w1", "p1", "worker-a").await;

        let (second, _rx2) = register(&registry, "w1", "p1", "worker-a").await;

        assert_eq!(first.state(), SessionState::Disconnected);
        assert_eq!(second.state(), SessionState::Idle);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_assign_release_cycle() {
        let (registry, _events) = registry();
        let (session, _rx) = register(&registry, "w1", "p1", "worker-a").await;

        session.assign(ExecutionId::new("e1")).unwrap();
        assert_eq!(session.state(), SessionState::Busy);
        assert_eq!(session.active_jobs(), 1);
        assert_eq!(session.current_execution(), Some(ExecutionId::new("e1")));

        session.release();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.active_jobs(), 0);
        assert!(session.current_execution().is_none());
    }

    #[tokio::test]
    async fn test_draining_blocks_new_assignments() {
        let (registry, _events) = registry();
        let (session, _rx) = register(&registry, "w1", "p1", "worker-a").await;

        registry.drain(&session.worker_id).unwrap();
        assert_eq!(session.state(), SessionState::Draining);
        assert!(!session.is_available());
        assert!(session.assign(ExecutionId::new("e1")).is_err());
        assert!(registry.candidates().is_empty());

        // A draining session that releases stays draining.
        session.release();
        assert_eq!(session.state(), SessionState::Draining);
    }

    #[tokio::test]
    async fn test_heartbeat_absorbed_other_messages_forwarded() {
        let (registry, mut events) = registry();
        let (session, _rx) = register(&registry, "w1", "p1", "worker-a").await;
        // Drop the registration event.
        let _ = events.recv().await;

        registry
            .ingest(
                &session.worker_id,
                WorkerMessage::Heartbeat {
                    status: crate::protocol::ReportedStatus::Idle,
                    active_jobs: 0,
                    timestamp: Utc::now(),
                },
            )
            .await
            .unwrap();

        registry
            .ingest(
                &session.worker_id,
                WorkerMessage::ExecutionResult {
                    execution_id: ExecutionId::new("e1"),
                    success: true,
                    exit_code: 0,
                    details: String::new(),
                },
            )
            .await
            .unwrap();

        // Only the execution result reaches the coordinator.
        match events.recv().await.unwrap() {
            SessionEvent::Message { message, .. } => {
                assert!(matches!(message, WorkerMessage::ExecutionResult { .. }));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_sweep_disconnects_silent_workers() {
        let (registry, _events) = registry();
        let (session, _rx) = register(&registry, "w1", "p1", "worker-a").await;
        session.assign(ExecutionId::new("e1")).unwrap();

        // Nothing stale yet.
        assert!(registry.sweep_stale(Utc::now()).is_empty());

        // Pretend 91 seconds pass with no traffic (3 x 30s interval).
        let later = Utc::now() + chrono::Duration::seconds(91);
        let swept = registry.sweep_stale(later);

        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].0, WorkerId::new("w1"));
        assert_eq!(swept[0].1, Some(ExecutionId::new("e1")));
        assert!(registry.is_empty());
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_candidates_reflect_capacity() {
        let (registry, _events) = registry();
        let (session, _rx) = register(&registry, "w1", "p1", "worker-a").await;

        assert_eq!(registry.candidates().len(), 1);

        // max_concurrent_jobs = 2, one active: still a candidate.
        session.assign(ExecutionId::new("e1")).unwrap();
        let candidates = registry.candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].active_jobs, 1);
    }

    #[tokio::test]
    async fn test_idle_in_pool() {
        let (registry, _events) = registry();
        let (session, _rx) = register(&registry, "w1", "p1", "worker-a").await;

        assert!(registry.idle_in_pool(&PoolId::new("p1")).is_some());
        assert!(registry.idle_in_pool(&PoolId::new("p2")).is_none());

        session.assign(ExecutionId::new("e1")).unwrap();
        assert!(registry.idle_in_pool(&PoolId::new("p1")).is_none());
    }
}
