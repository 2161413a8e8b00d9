//! Domain events and the in-process event bus.
//!
//! Lifecycle events fan out to subscribers over a bounded broadcast
//! channel. A subscriber that falls behind loses the oldest events in
//! its backlog; drops are counted on the bus. Publication order is
//! preserved per publisher.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::ids::{ExecutionId, JobId, PoolId, WorkerId};

/// Default per-subscriber backlog bound.
pub const DEFAULT_EVENT_BACKLOG: usize = 1000;

/// Kind tag of a domain event, used for filtered subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    JobQueued,
    JobStarted,
    JobCompleted,
    JobFailed,
    JobCancelled,
    WorkerRegistered,
    WorkerDisconnected,
    PoolUtilizationChanged,
    AssignmentDispatched,
}

/// Immutable lifecycle event records. They carry ids and a timestamp;
/// no behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainEvent {
    JobQueued {
        job_id: JobId,
        at: DateTime<Utc>,
    },
    JobStarted {
        job_id: JobId,
        execution_id: ExecutionId,
        worker_id: WorkerId,
        at: DateTime<Utc>,
    },
    JobCompleted {
        job_id: JobId,
        execution_id: ExecutionId,
        at: DateTime<Utc>,
    },
    JobFailed {
        job_id: JobId,
        execution_id: Option<ExecutionId>,
        reason: String,
        at: DateTime<Utc>,
    },
    JobCancelled {
        job_id: JobId,
        at: DateTime<Utc>,
    },
    WorkerRegistered {
        worker_id: WorkerId,
        pool_id: PoolId,
        at: DateTime<Utc>,
    },
    WorkerDisconnected {
        worker_id: WorkerId,
        at: DateTime<Utc>,
    },
    PoolUtilizationChanged {
        pool_id: PoolId,
        at: DateTime<Utc>,
    },
    AssignmentDispatched {
        job_id: JobId,
        execution_id: ExecutionId,
        worker_id: WorkerId,
        at: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Returns the event's kind tag.
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::JobQueued { .. } => EventKind::JobQueued,
            DomainEvent::JobStarted { .. } => EventKind::JobStarted,
            DomainEvent::JobCompleted { .. } => EventKind::JobCompleted,
            DomainEvent::JobFailed { .. } => EventKind::JobFailed,
            DomainEvent::JobCancelled { .. } => EventKind::JobCancelled,
            DomainEvent::WorkerRegistered { .. } => EventKind::WorkerRegistered,
            DomainEvent::WorkerDisconnected { .. } => EventKind::WorkerDisconnected,
            DomainEvent::PoolUtilizationChanged { .. } => EventKind::PoolUtilizationChanged,
            DomainEvent::AssignmentDispatched { .. } => EventKind::AssignmentDispatched,
        }
    }
}

/// Process-wide publish/subscribe fan-out for domain events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    /// Creates a bus with the given per-subscriber backlog bound.
    pub fn new(backlog: usize) -> Self {
        let (sender, _) = broadcast::channel(backlog.max(1));
        Self {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publishes an event to every live subscriber. Best-effort: with no
    /// subscribers the event is discarded.
    pub fn publish(&self, event: DomainEvent) {
        debug!(kind = ?event.kind(), "domain event");
        let _ = self.sender.send(event);
    }

    /// Subscribes to every event kind.
    pub fn subscribe_all(&self) -> EventSubscriber {
        EventSubscriber {
            receiver: self.sender.subscribe(),
            filter: None,
            dropped: Arc::clone(&self.dropped),
        }
    }

    /// Subscribes to a single event kind.
    pub fn subscribe(&self, kind: EventKind) -> EventSubscriber {
        EventSubscriber {
            receiver: self.sender.subscribe(),
            filter: Some(kind),
            dropped: Arc::clone(&self.dropped),
        }
    }

    /// Total events dropped across all subscribers since creation.
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BACKLOG)
    }
}

/// One subscriber's view of the bus.
pub struct EventSubscriber {
    receiver: broadcast::Receiver<DomainEvent>,
    filter: Option<EventKind>,
    dropped: Arc<AtomicU64>,
}

impl EventSubscriber {
    /// Receives the next matching event.
    ///
    /// Returns `None` once the bus is gone. Backlog overflow drops the
    /// oldest events, bumps the bus drop counter, and keeps receiving.
    pub async fn recv(&mut self) -> Option<DomainEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.filter.is_none() || self.filter == Some(event.kind()) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                    crate::metrics::record_events_dropped(n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Receives without waiting; `None` when no matching event is ready.
    pub fn try_recv(&mut self) -> Option<DomainEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    if self.filter.is_none() || self.filter == Some(event.kind()) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                    crate::metrics::record_events_dropped(n);
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(job: &str) -> DomainEvent {
        DomainEvent::JobQueued {
            job_id: JobId::new(job),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new(16);
        let mut first = bus.subscribe_all();
        let mut second = bus.subscribe_all();

        bus.publish(queued("j1"));

        assert!(matches!(
            first.recv().await.unwrap(),
            DomainEvent::JobQueued { .. }
        ));
        assert!(matches!(
            second.recv().await.unwrap(),
            DomainEvent::JobQueued { .. }
        ));
    }

    #[tokio::test]
    async fn test_filtered_subscription() {
        let bus = EventBus::new(16);
        let mut failures = bus.subscribe(EventKind::JobFailed);

        bus.publish(queued("j1"));
        bus.publish(DomainEvent::JobFailed {
            job_id: JobId::new("j1"),
            execution_id: None,
            reason: "boom".to_string(),
            at: Utc::now(),
        });

        let event = failures.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::JobFailed);
        assert!(failures.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_order_preserved_per_publisher() {
        let bus = EventBus::new(64);
        let mut subscriber = bus.subscribe_all();

        for i in 0..10 {
            bus.publish(queued(&format!("j{i}")));
        }

        for i in 0..10 {
            match subscriber.recv().await.unwrap() {
                DomainEvent::JobQueued { job_id, .. } => {
                    assert_eq!(job_id, JobId::new(format!("j{i}")));
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest_and_counts() {
        let bus = EventBus::new(4);
        let mut slow = bus.subscribe_all();

        for i in 0..10 {
            bus.publish(queued(&format!("j{i}")));
        }

        // The oldest 6 events were dropped; the next receive surfaces j6.
        match slow.recv().await.unwrap() {
            DomainEvent::JobQueued { job_id, .. } => assert_eq!(job_id, JobId::new("j6")),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(bus.dropped_total(), 6);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(queued("nobody-listening"));
        assert_eq!(bus.dropped_total(), 0);
    }
}
