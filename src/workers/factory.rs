//! Worker factory: turns a job and a pool into a provisioned worker.
//!
//! The factory owns the worker configuration per backend type, derives
//! the instance sizing from the job's resource hints, builds the worker
//! command line and environment, and tracks every active worker until
//! `destroy_worker` releases it.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::ids::{JobId, PoolId, WorkerId};
use crate::pools::pool::ResourcePool;
use crate::scheduler::resources::ResourceRequirements;
use crate::workers::instance::{
    ComputeInstance, InstanceManager, InstanceSpec, InstanceStatus, InstanceType,
    ProvisioningError, METADATA_INSTANCE_ID,
};

const MIB: u64 = 1024 * 1024;

/// Errors that can occur in the worker factory.
#[derive(Debug, Error)]
pub enum FactoryError {
    /// No worker configuration registered for the pool's backend type.
    #[error("no worker configuration for pool type '{0}'")]
    MissingConfiguration(String),

    /// No instance manager registered for the pool's backend type.
    #[error("no instance manager for pool type '{0}'")]
    MissingManager(String),

    /// The driver rejected or failed the provisioning call.
    #[error("provisioning failed for job {job_id} in pool {pool_id}: {source}")]
    ProvisioningFailed {
        job_id: JobId,
        pool_id: PoolId,
        #[source]
        source: ProvisioningError,
    },

    /// The worker id is not tracked by this factory.
    #[error("worker {0} not found")]
    WorkerNotFound(WorkerId),
}

/// Per-backend configuration for spawning workers.
#[derive(Debug, Clone)]
pub struct WorkerConfiguration {
    /// Worker binary invoked inside the instance.
    pub worker_binary: String,
    /// Endpoint the worker dials back to.
    pub server_endpoint: String,
    /// Image or base environment for the instance.
    pub image: String,
    /// How long a provisioning call may take before it counts as failed.
    pub provisioning_timeout: Duration,
    /// Additional environment entries merged into every worker.
    pub extra_env: HashMap<String, String>,
}

impl WorkerConfiguration {
    /// Default configuration for a backend type. Timeouts follow the
    /// backend's expected startup cost: 60s kubernetes, 30s docker,
    /// 10s local.
    pub fn default_for(pool_type: &str, server_endpoint: impl Into<String>) -> Self {
        let provisioning_timeout = match pool_type {
            "kubernetes" => Duration::from_secs(60),
            "docker" => Duration::from_secs(30),
            _ => Duration::from_secs(10),
        };
        Self {
            worker_binary: "hodei-worker".to_string(),
            server_endpoint: server_endpoint.into(),
            image: "hodei/worker:latest".to_string(),
            provisioning_timeout,
            extra_env: HashMap::new(),
        }
    }
}

/// A provisioned worker tracked by the factory.
#[derive(Debug, Clone)]
pub struct WorkerInstance {
    pub worker_id: WorkerId,
    pub pool_id: PoolId,
    pub pool_type: String,
    pub instance_type: InstanceType,
    pub status: InstanceStatus,
    /// Driver-specific details, including the backend instance id.
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

/// Builds instance specs and owns the active-worker map.
pub struct WorkerFactory {
    configurations: HashMap<String, WorkerConfiguration>,
    managers: HashMap<String, Arc<dyn InstanceManager>>,
    active: DashMap<WorkerId, WorkerInstance>,
}

impl WorkerFactory {
    /// Creates a factory over per-backend configurations and drivers.
    pub fn new(
        configurations: HashMap<String, WorkerConfiguration>,
        managers: HashMap<String, Arc<dyn InstanceManager>>,
    ) -> Self {
        Self {
            configurations,
            managers,
            active: DashMap::new(),
        }
    }

    /// Derives the instance sizing class from resource hints.
    pub fn derive_instance_type(requirements: &ResourceRequirements) -> InstanceType {
        let memory = requirements.memory_bytes();
        if requirements.cpu_cores <= 1.0 && memory <= 2048 * MIB {
            InstanceType::Small
        } else if requirements.cpu_cores <= 2.0 && memory <= 4096 * MIB {
            InstanceType::Medium
        } else if requirements.cpu_cores <= 4.0 && memory <= 8192 * MIB {
            InstanceType::Large
        } else {
            InstanceType::Xlarge
        }
    }

    /// Builds the deterministic instance spec for a job on a pool.
    fn build_spec(
        &self,
        config: &WorkerConfiguration,
        job_id: &JobId,
        pool: &ResourcePool,
        requirements: &ResourceRequirements,
        worker_id: &WorkerId,
    ) -> InstanceSpec {
        let command = vec![
            config.worker_binary.clone(),
            "--server".to_string(),
            config.server_endpoint.clone(),
            "--pool-id".to_string(),
            pool.id.to_string(),
            "--tls".to_string(),
        ];

        let mut environment = HashMap::from([
            ("HODEI_JOB_ID".to_string(), job_id.to_string()),
            ("HODEI_POOL_ID".to_string(), pool.id.to_string()),
            ("HODEI_POOL_TYPE".to_string(), pool.pool_type.clone()),
            ("HODEI_LOG_LEVEL".to_string(), "INFO".to_string()),
            ("HODEI_WORKER_ID".to_string(), worker_id.to_string()),
            (
                "HODEI_SERVER_ENDPOINT".to_string(),
                config.server_endpoint.clone(),
            ),
        ]);
        environment.extend(config.extra_env.clone());

        InstanceSpec {
            instance_type: Self::derive_instance_type(requirements),
            image: config.image.clone(),
            command,
            environment,
            labels: HashMap::new(),
            metadata: HashMap::from([("worker-id".to_string(), worker_id.to_string())]),
        }
    }

    /// Provisions a worker for `job_id` on `pool` and starts tracking it.
    pub async fn create_worker(
        &self,
        job_id: &JobId,
        pool: &ResourcePool,
        requirements: &ResourceRequirements,
    ) -> Result<WorkerInstance, FactoryError> {
        let config = self
            .configurations
            .get(&pool.pool_type)
            .ok_or_else(|| FactoryError::MissingConfiguration(pool.pool_type.clone()))?;
        let manager = self
            .managers
            .get(&pool.pool_type)
            .ok_or_else(|| FactoryError::MissingManager(pool.pool_type.clone()))?;

        let worker_id = WorkerId::random();
        let spec = self.build_spec(config, job_id, pool, requirements, &worker_id);

        let provisioned = tokio::time::timeout(
            config.provisioning_timeout,
            manager.provision_instance(pool, &spec),
        )
        .await
        .unwrap_or(Err(ProvisioningError::Timeout(config.provisioning_timeout)));

        let instance: ComputeInstance = match provisioned {
            Ok(instance) => instance,
            Err(source) => {
                warn!(job_id = %job_id, pool_id = %pool.id, error = %source, "worker provisioning failed");
                return Err(FactoryError::ProvisioningFailed {
                    job_id: job_id.clone(),
                    pool_id: pool.id.clone(),
                    source,
                });
            }
        };

        let now = Utc::now();
        let worker = WorkerInstance {
            worker_id: worker_id.clone(),
            pool_id: pool.id.clone(),
            pool_type: pool.pool_type.clone(),
            instance_type: instance.instance_type,
            status: instance.status,
            metadata: HashMap::from([(METADATA_INSTANCE_ID.to_string(), instance.id)]),
            created_at: now,
            last_updated_at: now,
        };

        info!(worker_id = %worker_id, pool_id = %pool.id, "worker provisioned");
        self.active.insert(worker_id, worker.clone());
        Ok(worker)
    }

    /// Stops tracking a worker and terminates its backend instance.
    pub async fn destroy_worker(&self, worker_id: &WorkerId) -> Result<(), FactoryError> {
        let (_, worker) = self
            .active
            .remove(worker_id)
            .ok_or_else(|| FactoryError::WorkerNotFound(worker_id.clone()))?;

        if let Some(manager) = self.managers.get(&worker.pool_type) {
            if let Some(instance_id) = worker.metadata.get(METADATA_INSTANCE_ID) {
                if let Err(error) = manager.terminate_instance(instance_id).await {
                    warn!(worker_id = %worker_id, %error, "instance termination failed");
                }
            }
        }

        info!(worker_id = %worker_id, pool_id = %worker.pool_id, "worker destroyed");
        Ok(())
    }

    /// Returns the tracked worker for `worker_id`.
    pub fn get(&self, worker_id: &WorkerId) -> Option<WorkerInstance> {
        self.active.get(worker_id).map(|entry| entry.clone())
    }

    /// Returns all tracked workers.
    pub fn active_workers(&self) -> Vec<WorkerInstance> {
        self.active.iter().map(|entry| entry.clone()).collect()
    }

    /// Returns the tracked workers of one pool.
    pub fn active_in_pool(&self, pool_id: &PoolId) -> Vec<WorkerInstance> {
        self.active
            .iter()
            .filter(|entry| entry.pool_id == *pool_id)
            .map(|entry| entry.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::local::LocalInstanceManager;

    fn factory() -> WorkerFactory {
        let configurations = HashMap::from([(
            "local".to_string(),
            WorkerConfiguration::default_for("local", "https://orchestrator:7000"),
        )]);
        let managers: HashMap<String, Arc<dyn InstanceManager>> = HashMap::from([(
            "local".to_string(),
            Arc::new(LocalInstanceManager::new()) as Arc<dyn InstanceManager>,
        )]);
        WorkerFactory::new(configurations, managers)
    }

    #[test]
    fn test_instance_type_thresholds() {
        let small = ResourceRequirements::new(1.0, "2048Mi");
        let medium = ResourceRequirements::new(2.0, "4096Mi");
        let large = ResourceRequirements::new(4.0, "8192Mi");
        let xlarge = ResourceRequirements::new(8.0, "32Gi");

        assert_eq!(WorkerFactory::derive_instance_type(&small), InstanceType::Small);
        assert_eq!(WorkerFactory::derive_instance_type(&medium), InstanceType::Medium);
        assert_eq!(WorkerFactory::derive_instance_type(&large), InstanceType::Large);
        assert_eq!(WorkerFactory::derive_instance_type(&xlarge), InstanceType::Xlarge);

        // Memory pushes the class up even at low cpu.
        let wide = ResourceRequirements::new(0.5, "16Gi");
        assert_eq!(WorkerFactory::derive_instance_type(&wide), InstanceType::Xlarge);
    }

    #[test]
    fn test_default_timeouts_per_backend() {
        let k8s = WorkerConfiguration::default_for("kubernetes", "ep");
        let docker = WorkerConfiguration::default_for("docker", "ep");
        let local = WorkerConfiguration::default_for("local", "ep");

        assert_eq!(k8s.provisioning_timeout, Duration::from_secs(60));
        assert_eq!(docker.provisioning_timeout, Duration::from_secs(30));
        assert_eq!(local.provisioning_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_create_worker_builds_env_and_tracks() {
        let factory = factory();
        let pool = ResourcePool::new("local-pool", "local");
        let job_id = JobId::new("job-1");

        let worker = factory
            .create_worker(&job_id, &pool, &ResourceRequirements::default())
            .await
            .unwrap();

        assert_eq!(worker.pool_id, pool.id);
        assert_eq!(worker.status, InstanceStatus::Running);
        assert!(worker.metadata.contains_key(METADATA_INSTANCE_ID));
        assert_eq!(factory.active_workers().len(), 1);
        assert_eq!(factory.active_in_pool(&pool.id).len(), 1);
        assert!(factory.get(&worker.worker_id).is_some());
    }

    #[tokio::test]
    async fn test_spec_contents() {
        let factory = factory();
        let pool = ResourcePool::new("local-pool", "local");
        let config = WorkerConfiguration::default_for("local", "https://orchestrator:7000");
        let worker_id = WorkerId::new("w-1");

        let spec = factory.build_spec(
            &config,
            &JobId::new("job-1"),
            &pool,
            &ResourceRequirements::default(),
            &worker_id,
        );

        assert_eq!(
            spec.command,
            vec![
                "hodei-worker",
                "--server",
                "https://orchestrator:7000",
                "--pool-id",
                pool.id.as_str(),
                "--tls"
            ]
        );
        assert_eq!(spec.environment.get("HODEI_JOB_ID").unwrap(), "job-1");
        assert_eq!(
            spec.environment.get("HODEI_POOL_ID").unwrap(),
            pool.id.as_str()
        );
        assert_eq!(spec.environment.get("HODEI_POOL_TYPE").unwrap(), "local");
        assert_eq!(spec.environment.get("HODEI_LOG_LEVEL").unwrap(), "INFO");
        assert_eq!(spec.metadata.get("worker-id").unwrap(), "w-1");
    }

    #[tokio::test]
    async fn test_missing_configuration() {
        let factory = factory();
        let pool = ResourcePool::new("k8s-pool", "kubernetes");

        let err = factory
            .create_worker(&JobId::new("j"), &pool, &ResourceRequirements::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FactoryError::MissingConfiguration(_)));
    }

    #[tokio::test]
    async fn test_destroy_worker() {
        let factory = factory();
        let pool = ResourcePool::new("local-pool", "local");
        let worker = factory
            .create_worker(&JobId::new("j"), &pool, &ResourceRequirements::default())
            .await
            .unwrap();

        factory.destroy_worker(&worker.worker_id).await.unwrap();
        assert!(factory.get(&worker.worker_id).is_none());

        let err = factory.destroy_worker(&worker.worker_id).await.unwrap_err();
        assert!(matches!(err, FactoryError::WorkerNotFound(_)));
    }
}
