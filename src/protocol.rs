//! Worker ↔ orchestrator wire protocol.
//!
//! Messages are self-describing tagged records flowing over a long-lived
//! bidirectional channel; either side may send at any time subject to the
//! session state machine. Endpoints ignore fields they do not understand,
//! so records can grow across versions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifacts::transfer::ArtifactChunk;
use crate::ids::{ArtifactId, ExecutionId, JobId};
use crate::scheduler::job::JobContent;

/// Default interval workers are told to heartbeat at.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: u64 = 30;

/// Worker-reported state carried in heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportedStatus {
    Idle,
    Busy,
    Draining,
}

/// Milestones a worker reports while driving an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusEventType {
    StageStarted,
    StepStarted,
    StepCompleted,
    StageCompleted,
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionFailed,
}

/// Which output stream a log chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogStreamKind {
    Stdout,
    Stderr,
}

/// Messages a worker sends to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    RegistrationRequest {
        worker_name: String,
        #[serde(default)]
        capabilities: HashMap<String, String>,
        max_concurrent_jobs: usize,
    },
    Heartbeat {
        status: ReportedStatus,
        active_jobs: usize,
        timestamp: DateTime<Utc>,
    },
    StatusUpdate {
        execution_id: ExecutionId,
        event_type: StatusEventType,
        message: String,
    },
    LogChunk {
        execution_id: ExecutionId,
        stream: LogStreamKind,
        content: Vec<u8>,
        sequence: u64,
    },
    ExecutionResult {
        execution_id: ExecutionId,
        success: bool,
        exit_code: i32,
        details: String,
    },
    ArtifactCacheQuery {
        job_id: JobId,
        artifact_ids: Vec<ArtifactId>,
    },
}

/// Messages the orchestrator sends to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorMessage {
    RegistrationResponse {
        success: bool,
        message: String,
        #[serde(default)]
        session_token: Option<String>,
        heartbeat_interval_seconds: u64,
    },
    ExecutionAssignment {
        execution_id: ExecutionId,
        definition: JobContent,
        #[serde(default)]
        env_vars: HashMap<String, String>,
    },
    CancelExecution {
        execution_id: ExecutionId,
        reason: String,
    },
    ArtifactChunk(ArtifactChunk),
    ArtifactCacheResponse {
        job_id: JobId,
        cached: Vec<ArtifactId>,
        missing: Vec<ArtifactId>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_message_roundtrip() {
        let message = WorkerMessage::RegistrationRequest {
            worker_name: "worker-a".to_string(),
            capabilities: HashMap::from([("arch".to_string(), "arm64".to_string())]),
            max_concurrent_jobs: 4,
        };

        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"type\":\"registration_request\""));

        let parsed: WorkerMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            WorkerMessage::RegistrationRequest {
                worker_name,
                capabilities,
                max_concurrent_jobs,
            } => {
                assert_eq!(worker_name, "worker-a");
                assert_eq!(capabilities.get("arch").unwrap(), "arm64");
                assert_eq!(max_concurrent_jobs, 4);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_orchestrator_message_roundtrip() {
        let message = OrchestratorMessage::ExecutionAssignment {
            execution_id: ExecutionId::new("e1"),
            definition: JobContent::shell(vec!["make".to_string(), "make test".to_string()]),
            env_vars: HashMap::from([("CI".to_string(), "true".to_string())]),
        };

        let json = serde_json::to_string(&message).unwrap();
        let parsed: OrchestratorMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            OrchestratorMessage::ExecutionAssignment {
                execution_id,
                definition,
                env_vars,
            } => {
                assert_eq!(execution_id, ExecutionId::new("e1"));
                assert!(matches!(definition, JobContent::Shell { .. }));
                assert_eq!(env_vars.get("CI").unwrap(), "true");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let json = r#"{
            "type": "heartbeat",
            "status": "IDLE",
            "active_jobs": 0,
            "timestamp": "2026-01-01T00:00:00Z",
            "introduced_in_a_future_version": {"nested": true}
        }"#;

        let parsed: WorkerMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(
            parsed,
            WorkerMessage::Heartbeat {
                status: ReportedStatus::Idle,
                active_jobs: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_log_chunk_preserves_bytes() {
        let message = WorkerMessage::LogChunk {
            execution_id: ExecutionId::new("e1"),
            stream: LogStreamKind::Stderr,
            content: vec![0xde, 0xad, 0xbe, 0xef],
            sequence: 7,
        };

        let json = serde_json::to_string(&message).unwrap();
        let parsed: WorkerMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            WorkerMessage::LogChunk {
                content, sequence, ..
            } => {
                assert_eq!(content, vec![0xde, 0xad, 0xbe, 0xef]);
                assert_eq!(sequence, 7);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
