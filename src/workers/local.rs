//! In-process instance driver.
//!
//! Backs the "local" pool type and every test that needs provisioning
//! without a container daemon. Instances are tracked in a concurrent
//! map and report `Running` as soon as they are provisioned.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::ids::{PoolId, WorkerId};
use crate::pools::pool::ResourcePool;
use crate::workers::instance::{
    ComputeInstance, InstanceManager, InstanceSpec, InstanceStatus, InstanceType,
    ProvisioningError,
};

/// Driver that hosts worker instances inside the orchestrator process.
#[derive(Default)]
pub struct LocalInstanceManager {
    instances: DashMap<String, ComputeInstance>,
}

impl LocalInstanceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-terminated) instances.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Returns whether no instances are tracked.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[async_trait]
impl InstanceManager for LocalInstanceManager {
    async fn provision_instance(
        &self,
        pool: &ResourcePool,
        spec: &InstanceSpec,
    ) -> Result<ComputeInstance, ProvisioningError> {
        if spec.image.is_empty() {
            return Err(ProvisioningError::BadSpec(
                "image must not be empty".to_string(),
            ));
        }

        let running = self
            .instances
            .iter()
            .filter(|entry| entry.pool_id == pool.id)
            .count();
        if running >= pool.max_workers {
            return Err(ProvisioningError::InsufficientCapacity(format!(
                "pool {} already at {} workers",
                pool.id, pool.max_workers
            )));
        }

        let worker_id = spec
            .worker_id()
            .unwrap_or_else(WorkerId::random);
        let instance = ComputeInstance {
            id: format!("local-{}", Uuid::new_v4().simple()),
            worker_id,
            pool_id: pool.id.clone(),
            instance_type: spec.instance_type,
            status: InstanceStatus::Running,
            created_at: Utc::now(),
        };

        debug!(instance_id = %instance.id, pool_id = %pool.id, "local instance provisioned");
        self.instances.insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<(), ProvisioningError> {
        // Idempotent: terminating an unknown instance is not an error.
        if self.instances.remove(instance_id).is_some() {
            debug!(instance_id, "local instance terminated");
        }
        Ok(())
    }

    async fn get_instance_status(
        &self,
        instance_id: &str,
    ) -> Result<InstanceStatus, ProvisioningError> {
        Ok(self
            .instances
            .get(instance_id)
            .map(|entry| entry.status)
            .unwrap_or(InstanceStatus::Terminated))
    }

    async fn list_instances(
        &self,
        pool_id: &PoolId,
    ) -> Result<Vec<ComputeInstance>, ProvisioningError> {
        let mut instances: Vec<ComputeInstance> = self
            .instances
            .iter()
            .filter(|entry| entry.pool_id == *pool_id)
            .map(|entry| entry.clone())
            .collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(instances)
    }

    async fn scale_instances(
        &self,
        pool: &ResourcePool,
        target_count: usize,
        template: &InstanceSpec,
    ) -> Result<crate::workers::instance::ScaleResult, ProvisioningError> {
        let mut result = crate::workers::instance::ScaleResult {
            requested: target_count,
            ..Default::default()
        };

        let current = self.list_instances(&pool.id).await?;
        if current.len() < target_count {
            for _ in current.len()..target_count {
                let mut spec = template.clone();
                spec.metadata
                    .insert("worker-id".to_string(), WorkerId::random().to_string());
                match self.provision_instance(pool, &spec).await {
                    Ok(instance) => result.provisioned.push(instance.id),
                    Err(error) => result.failed.push(error.to_string()),
                }
            }
        } else {
            for instance in current.iter().skip(target_count) {
                self.terminate_instance(&instance.id).await?;
            }
        }

        result.actual = self.list_instances(&pool.id).await?.len();
        Ok(result)
    }

    fn available_instance_types(&self) -> Vec<InstanceType> {
        vec![InstanceType::Small, InstanceType::Medium, InstanceType::Custom]
    }
}
