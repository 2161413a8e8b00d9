//! Docker instance driver using the bollard crate.
//!
//! Workers run as containers. The driver injects the worker id and the
//! orchestrator endpoint into the container environment, labels the
//! container with its pool, and maps the container lifecycle onto the
//! instance-manager contract.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use chrono::Utc;
use tracing::{debug, warn};

use crate::ids::{PoolId, WorkerId};
use crate::pools::pool::ResourcePool;
use crate::workers::instance::{
    ComputeInstance, InstanceManager, InstanceSpec, InstanceStatus, InstanceType,
    ProvisioningError,
};

/// Container label carrying the owning pool id.
const LABEL_POOL_ID: &str = "io.hodei.pool-id";

/// Container label carrying the allocated worker id.
const LABEL_WORKER_ID: &str = "io.hodei.worker-id";

/// Seconds a container gets between SIGTERM and SIGKILL.
const STOP_GRACE_SECONDS: i64 = 10;

/// Instance driver backed by the local Docker daemon.
pub struct DockerInstanceManager {
    docker: Docker,
}

impl DockerInstanceManager {
    /// Connects to the local Docker daemon.
    pub fn connect() -> Result<Self, ProvisioningError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            ProvisioningError::BackendUnavailable(format!("failed to connect to docker: {e}"))
        })?;
        Ok(Self { docker })
    }

    /// Wraps an existing bollard client.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    fn is_not_found(error: &bollard::errors::Error) -> bool {
        matches!(
            error,
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            }
        )
    }

    fn map_state(state: Option<&str>) -> InstanceStatus {
        match state.unwrap_or_default() {
            "created" => InstanceStatus::Provisioning,
            "running" | "restarting" => InstanceStatus::Running,
            "paused" => InstanceStatus::Stopping,
            "exited" => InstanceStatus::Stopped,
            "removing" => InstanceStatus::Stopping,
            "dead" => InstanceStatus::Failed,
            _ => InstanceStatus::Failed,
        }
    }
}

#[async_trait]
impl InstanceManager for DockerInstanceManager {
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
        let worker_id = spec
            .worker_id()
            .ok_or_else(|| ProvisioningError::BadSpec("spec carries no worker id".to_string()))?;

        let env: Vec<String> = spec
            .environment
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        let mut labels: HashMap<String, String> = spec.labels.clone();
        labels.insert(LABEL_POOL_ID.to_string(), pool.id.to_string());
        labels.insert(LABEL_WORKER_ID.to_string(), worker_id.to_string());

        let container_config = Config {
            image: Some(spec.image.clone()),
            cmd: if spec.command.is_empty() {
                None
            } else {
                Some(spec.command.clone())
            },
            env: if env.is_empty() { None } else { Some(env) },
            labels: Some(labels),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: format!("hodei-worker-{worker_id}"),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| {
                ProvisioningError::BackendUnavailable(format!("failed to create container: {e}"))
            })?;

        self.docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| {
                ProvisioningError::BackendUnavailable(format!("failed to start container: {e}"))
            })?;

        debug!(container_id = %response.id, worker_id = %worker_id, "worker container started");
        Ok(ComputeInstance {
            id: response.id,
            worker_id,
            pool_id: pool.id.clone(),
            instance_type: spec.instance_type,
            status: InstanceStatus::Running,
            created_at: Utc::now(),
        })
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<(), ProvisioningError> {
        let stop_options = StopContainerOptions {
            t: STOP_GRACE_SECONDS,
        };
        if let Err(error) = self.docker.stop_container(instance_id, Some(stop_options)).await {
            if !Self::is_not_found(&error) {
                warn!(instance_id, %error, "failed to stop container, removing anyway");
            }
        }

        let remove_options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self
            .docker
            .remove_container(instance_id, Some(remove_options))
            .await
        {
            Ok(()) => Ok(()),
            // Already gone counts as terminated.
            Err(error) if Self::is_not_found(&error) => Ok(()),
            Err(error) => Err(ProvisioningError::BackendUnavailable(format!(
                "failed to remove container: {error}"
            ))),
        }
    }

    async fn get_instance_status(
        &self,
        instance_id: &str,
    ) -> Result<InstanceStatus, ProvisioningError> {
        let info = match self
            .docker
            .inspect_container(instance_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info,
            Err(error) if Self::is_not_found(&error) => return Ok(InstanceStatus::Terminated),
            Err(error) => {
                return Err(ProvisioningError::BackendUnavailable(format!(
                    "failed to inspect container: {error}"
                )))
            }
        };

        let state = info
            .state
            .and_then(|state| state.status)
            .map(|status| status.to_string());
        Ok(Self::map_state(state.as_deref()))
    }

    async fn list_instances(
        &self,
        pool_id: &PoolId,
    ) -> Result<Vec<ComputeInstance>, ProvisioningError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{LABEL_POOL_ID}={pool_id}")],
        );
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| {
                ProvisioningError::BackendUnavailable(format!("failed to list containers: {e}"))
            })?;

        let mut instances: Vec<ComputeInstance> = containers
            .into_iter()
            .filter_map(|container| {
                let id = container.id?;
                let labels = container.labels.unwrap_or_default();
                let worker_id = labels.get(LABEL_WORKER_ID)?;
                Some(ComputeInstance {
                    id,
                    worker_id: WorkerId::from(worker_id.as_str()),
                    pool_id: pool_id.clone(),
                    instance_type: InstanceType::Custom,
                    status: Self::map_state(container.state.as_deref()),
                    created_at: container
                        .created
                        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
                        .unwrap_or_else(Utc::now),
                })
            })
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
                let worker_id = WorkerId::random();
                spec.metadata
                    .insert("worker-id".to_string(), worker_id.to_string());
                spec.environment
                    .insert("HODEI_WORKER_ID".to_string(), worker_id.to_string());
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
        vec![
            InstanceType::Small,
            InstanceType::Medium,
            InstanceType::Large,
            InstanceType::Xlarge,
            InstanceType::Custom,
        ]
    }
}
