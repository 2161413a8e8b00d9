//! Instance-manager port consumed by the worker factory.
//!
//! Drivers provision backend-specific compute instances (containers,
//! cluster pods, local processes) and must honor this contract:
//! `provision_instance` returns once the backend has accepted the
//! workload, and `terminate_instance` is idempotent.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{PoolId, WorkerId};
use crate::pools::pool::ResourcePool;

/// Metadata key under which drivers record their own instance id.
pub const METADATA_INSTANCE_ID: &str = "instance-id";

/// Sizing class of a provisioned instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceType {
    Small,
    Medium,
    Large,
    Xlarge,
    Custom,
}

impl std::fmt::Display for InstanceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceType::Small => "small",
            InstanceType::Medium => "medium",
            InstanceType::Large => "large",
            InstanceType::Xlarge => "xlarge",
            InstanceType::Custom => "custom",
        };
        f.write_str(s)
    }
}

/// Backend-reported status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Failed,
    Terminated,
}

/// Errors a driver may raise.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("pool {0} not known to the backend")]
    PoolNotFound(PoolId),

    #[error("insufficient capacity: {0}")]
    InsufficientCapacity(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("provisioning timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid instance spec: {0}")]
    BadSpec(String),
}

impl ProvisioningError {
    /// Returns whether re-queueing the job may help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InsufficientCapacity(_) | Self::BackendUnavailable(_) | Self::Timeout(_)
        )
    }
}

/// What the factory asks a driver to start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub instance_type: InstanceType,
    /// Image or base environment for the worker process.
    pub image: String,
    /// Worker entrypoint command.
    pub command: Vec<String>,
    /// Environment injected into the worker process. Drivers must include
    /// the allocated worker id and the orchestrator endpoint so the
    /// worker can dial back.
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Spec metadata; carries the allocated worker id.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl InstanceSpec {
    /// Returns the worker id allocated for this spec, if present.
    pub fn worker_id(&self) -> Option<WorkerId> {
        self.metadata
            .get("worker-id")
            .map(|value| WorkerId::from(value.as_str()))
    }
}

/// A backend-accepted compute instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeInstance {
    /// Driver-specific instance id.
    pub id: String,
    pub worker_id: WorkerId,
    pub pool_id: PoolId,
    pub instance_type: InstanceType,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a scale reconciliation.
#[derive(Debug, Clone, Default)]
pub struct ScaleResult {
    /// The target count asked for.
    pub requested: usize,
    /// Instances present after reconciliation.
    pub actual: usize,
    /// Driver ids of newly provisioned instances.
    pub provisioned: Vec<String>,
    /// Error strings for instances that failed to start.
    pub failed: Vec<String>,
}

/// Port for backend-specific instance lifecycle management.
#[async_trait]
pub trait InstanceManager: Send + Sync {
    /// Starts an instance in `pool`. Returns once the backend accepted
    /// the workload; the worker process may still be booting.
    async fn provision_instance(
        &self,
        pool: &ResourcePool,
        spec: &InstanceSpec,
    ) -> Result<ComputeInstance, ProvisioningError>;

    /// Terminates an instance. Unknown instance ids succeed.
    async fn terminate_instance(&self, instance_id: &str) -> Result<(), ProvisioningError>;

    /// Reports the current status of an instance.
    async fn get_instance_status(
        &self,
        instance_id: &str,
    ) -> Result<InstanceStatus, ProvisioningError>;

    /// Lists the instances belonging to a pool.
    async fn list_instances(
        &self,
        pool_id: &PoolId,
    ) -> Result<Vec<ComputeInstance>, ProvisioningError>;

    /// Reconciles the pool toward `target_count` instances, provisioning
    /// from `template` or terminating surplus as needed.
    async fn scale_instances(
        &self,
        pool: &ResourcePool,
        target_count: usize,
        template: &InstanceSpec,
    ) -> Result<ScaleResult, ProvisioningError>;

    /// Instance sizing classes this driver can start.
    fn available_instance_types(&self) -> Vec<InstanceType>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ProvisioningError::BackendUnavailable("down".into()).is_retryable());
        assert!(ProvisioningError::InsufficientCapacity("full".into()).is_retryable());
        assert!(ProvisioningError::Timeout(Duration::from_secs(30)).is_retryable());

        assert!(!ProvisioningError::PoolNotFound(PoolId::new("p")).is_retryable());
        assert!(!ProvisioningError::BadSpec("no image".into()).is_retryable());
        assert!(!ProvisioningError::QuotaExceeded("10 max".into()).is_retryable());
    }

    #[test]
    fn test_spec_exposes_worker_id() {
        let spec = InstanceSpec {
            instance_type: InstanceType::Small,
            image: "hodei-worker:latest".to_string(),
            command: vec![],
            environment: HashMap::new(),
            labels: HashMap::new(),
            metadata: HashMap::from([("worker-id".to_string(), "w-9".to_string())]),
        };

        assert_eq!(spec.worker_id(), Some(WorkerId::new("w-9")));
    }

    #[test]
    fn test_instance_type_display() {
        assert_eq!(InstanceType::Small.to_string(), "small");
        assert_eq!(InstanceType::Xlarge.to_string(), "xlarge");
    }
}
