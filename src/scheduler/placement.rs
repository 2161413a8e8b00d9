//! Pool selection for queued jobs.
//!
//! The placement scheduler probes the utilization of every active pool
//! concurrently through per-backend resource monitors, filters the pools
//! that can satisfy the job's requirements, and lets the selected
//! strategy pick among the remaining candidates:
//!
//! - `roundrobin`: stateful cursor over candidates ordered by name
//! - `greedy`: best fit, the smallest free capacity that still fits
//! - `leastloaded`: lowest `max(cpuUsed/cpuTotal, memUsed/memTotal)`
//! - `binpacking`: first pool (by name) whose free capacity fits

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, warn};

use crate::ids::PoolId;
use crate::pools::pool::{ResourcePool, ResourcePoolUtilization};
use crate::pools::registry::PoolRegistry;
use crate::scheduler::queue::QueuedJob;
use crate::scheduler::resources::ResourceRequirements;

/// Errors that can occur during placement.
#[derive(Debug, Error)]
pub enum PlacementError {
    /// The registry holds no pool in `Active` status.
    #[error("no active resource pools")]
    NoActivePools,

    /// The job's pinned pool does not exist.
    #[error("target pool {0} not found")]
    PoolNotFound(PoolId),

    /// The job's pinned pool is not accepting placements.
    #[error("target pool {0} is not active")]
    PoolNotActive(PoolId),

    /// No pool can satisfy the requirements.
    #[error("insufficient capacity for cpu={cpu} memory={memory}")]
    InsufficientCapacity { cpu: f64, memory: String },

    /// No monitor registered for the pool's backend type.
    #[error("no resource monitor registered for pool type '{0}'")]
    NoMonitor(String),

    /// The named strategy is unknown.
    #[error("unknown placement strategy '{0}'")]
    UnknownStrategy(String),

    /// A utilization probe failed.
    #[error("utilization probe for pool {pool_id} failed: {message}")]
    ProbeFailed { pool_id: PoolId, message: String },
}

/// Probes the current utilization of a pool. May be network-bound; must
/// not mutate caller-visible state.
#[async_trait]
pub trait ResourceMonitor: Send + Sync {
    async fn utilization(
        &self,
        pool: &ResourcePool,
    ) -> Result<ResourcePoolUtilization, PlacementError>;
}

/// Monitor realization backed by a settable table of samples.
///
/// Pools without an explicit sample report their full declared capacity
/// as free (`default_cpu`/`default_memory_bytes`).
pub struct StaticResourceMonitor {
    samples: DashMap<PoolId, ResourcePoolUtilization>,
    default_cpu: f64,
    default_memory_bytes: u64,
}

impl StaticResourceMonitor {
    pub fn new(default_cpu: f64, default_memory_bytes: u64) -> Self {
        Self {
            samples: DashMap::new(),
            default_cpu,
            default_memory_bytes,
        }
    }

    /// Installs a sample for a pool, replacing any prior one.
    pub fn set(&self, sample: ResourcePoolUtilization) {
        self.samples.insert(sample.pool_id.clone(), sample);
    }
}

#[async_trait]
impl ResourceMonitor for StaticResourceMonitor {
    async fn utilization(
        &self,
        pool: &ResourcePool,
    ) -> Result<ResourcePoolUtilization, PlacementError> {
        Ok(self
            .samples
            .get(&pool.id)
            .map(|entry| entry.clone())
            .unwrap_or_else(|| {
                ResourcePoolUtilization::new(
                    pool.id.clone(),
                    self.default_cpu,
                    self.default_memory_bytes,
                )
            }))
    }
}

/// Strategy names accepted by `find_placement`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementStrategy {
    RoundRobin,
    Greedy,
    LeastLoaded,
    BinPacking,
}

impl PlacementStrategy {
    /// Parses a strategy name.
    pub fn from_name(name: &str) -> Result<Self, PlacementError> {
        match name.to_ascii_lowercase().as_str() {
            "roundrobin" => Ok(Self::RoundRobin),
            "greedy" => Ok(Self::Greedy),
            "leastloaded" => Ok(Self::LeastLoaded),
            "binpacking" => Ok(Self::BinPacking),
            other => Err(PlacementError::UnknownStrategy(other.to_string())),
        }
    }
}

/// A pool that survived the capacity filter, with its probed sample.
#[derive(Debug, Clone)]
pub struct PoolCandidate {
    pub pool: ResourcePool,
    pub utilization: ResourcePoolUtilization,
}

impl PoolCandidate {
    /// Returns whether this candidate satisfies `requirements`.
    fn fits(&self, requirements: &ResourceRequirements, max_jobs: Option<usize>) -> bool {
        if self.utilization.free_cpu() < requirements.cpu_cores {
            return false;
        }
        if self.utilization.free_memory_bytes() < requirements.memory_bytes() {
            return false;
        }
        if let Some(limit) = max_jobs {
            if self.utilization.running_jobs >= limit {
                return false;
            }
        }
        true
    }
}

/// Selects a pool for each job under a named strategy.
pub struct PlacementScheduler {
    registry: Arc<PoolRegistry>,
    monitors: HashMap<String, Arc<dyn ResourceMonitor>>,
    default_strategy: PlacementStrategy,
    round_robin_cursor: AtomicUsize,
}

impl PlacementScheduler {
    /// Creates a scheduler over the given registry and monitor table.
    ///
    /// Monitors are keyed by pool type; a pool whose type has no monitor
    /// is skipped during probing.
    pub fn new(
        registry: Arc<PoolRegistry>,
        monitors: HashMap<String, Arc<dyn ResourceMonitor>>,
        default_strategy: PlacementStrategy,
    ) -> Self {
        Self {
            registry,
            monitors,
            default_strategy,
            round_robin_cursor: AtomicUsize::new(0),
        }
    }

    /// The pool registry this scheduler selects from.
    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    /// Picks a pool for the queued job.
    ///
    /// When the job pins a pool, only that pool is considered. Otherwise
    /// all active pools are probed concurrently; pools whose probe fails
    /// are logged and skipped.
    pub async fn find_placement(
        &self,
        entry: &QueuedJob,
        strategy_name: Option<&str>,
    ) -> Result<ResourcePool, PlacementError> {
        let strategy = match strategy_name {
            Some(name) => PlacementStrategy::from_name(name)?,
            None => self.default_strategy,
        };

        let active = self.registry.find_active();
        if active.is_empty() {
            return Err(PlacementError::NoActivePools);
        }

        if let Some(pool_id) = &entry.job.pool_id {
            return self.place_in_pinned_pool(pool_id, entry).await;
        }

        let candidates = self.probe_candidates(active, entry).await;
        if candidates.is_empty() {
            return Err(PlacementError::InsufficientCapacity {
                cpu: entry.requirements.cpu_cores,
                memory: entry.requirements.memory.clone(),
            });
        }

        let chosen = self.select(strategy, &candidates);
        debug!(
            job_id = %entry.job.id,
            pool_id = %chosen.id,
            strategy = ?strategy,
            "placement selected"
        );
        Ok(chosen)
    }

    async fn place_in_pinned_pool(
        &self,
        pool_id: &PoolId,
        entry: &QueuedJob,
    ) -> Result<ResourcePool, PlacementError> {
        let pool = self
            .registry
            .find_by_id(pool_id)
            .ok_or_else(|| PlacementError::PoolNotFound(pool_id.clone()))?;
        if !pool.is_active() {
            return Err(PlacementError::PoolNotActive(pool_id.clone()));
        }

        let monitor = self
            .monitors
            .get(&pool.pool_type)
            .ok_or_else(|| PlacementError::NoMonitor(pool.pool_type.clone()))?;
        let utilization = monitor.utilization(&pool).await?;

        let candidate = PoolCandidate {
            pool: pool.clone(),
            utilization,
        };
        if !candidate.fits(&entry.requirements, pool.max_jobs) {
            return Err(PlacementError::InsufficientCapacity {
                cpu: entry.requirements.cpu_cores,
                memory: entry.requirements.memory.clone(),
            });
        }
        Ok(pool)
    }

    /// Probes all pools concurrently and keeps the ones that fit,
    /// ordered by pool name.
    async fn probe_candidates(
        &self,
        pools: Vec<ResourcePool>,
        entry: &QueuedJob,
    ) -> Vec<PoolCandidate> {
        let probes = pools.into_iter().map(|pool| async move {
            let monitor = match self.monitors.get(&pool.pool_type) {
                Some(monitor) => monitor,
                None => {
                    warn!(pool_id = %pool.id, pool_type = %pool.pool_type, "no monitor for pool type, skipping");
                    return None;
                }
            };
            match monitor.utilization(&pool).await {
                Ok(utilization) => Some(PoolCandidate { pool, utilization }),
                Err(error) => {
                    warn!(pool_id = %pool.id, %error, "utilization probe failed, skipping pool");
                    None
                }
            }
        });

        let mut candidates: Vec<PoolCandidate> = join_all(probes)
            .await
            .into_iter()
            .flatten()
            .filter(|candidate| {
                candidate.fits(&entry.requirements, candidate.pool.max_jobs)
            })
            .collect();
        candidates.sort_by(|a, b| a.pool.name.cmp(&b.pool.name));
        candidates
    }

    /// Applies the strategy to a non-empty candidate list.
    fn select(&self, strategy: PlacementStrategy, candidates: &[PoolCandidate]) -> ResourcePool {
        let chosen = match strategy {
            PlacementStrategy::RoundRobin => {
                let cursor = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed);
                &candidates[cursor % candidates.len()]
            }
            PlacementStrategy::Greedy => candidates
                .iter()
                .min_by(|a, b| {
                    a.utilization
                        .free_cpu()
                        .total_cmp(&b.utilization.free_cpu())
                        .then_with(|| {
                            a.utilization
                                .free_memory_bytes()
                                .cmp(&b.utilization.free_memory_bytes())
                        })
                })
                .unwrap_or(&candidates[0]),
            PlacementStrategy::LeastLoaded => candidates
                .iter()
                .min_by(|a, b| a.utilization.load().total_cmp(&b.utilization.load()))
                .unwrap_or(&candidates[0]),
            PlacementStrategy::BinPacking => &candidates[0],
        };
        chosen.pool.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{Job, JobContent};

    fn entry(cpu: f64, memory: &str) -> QueuedJob {
        let job = Job::new("test", JobContent::shell(vec!["true".to_string()]));
        QueuedJob::new(job, ResourceRequirements::new(cpu, memory), HashMap::new())
    }

    fn pinned_entry(pool_id: PoolId, cpu: f64) -> QueuedJob {
        let job = Job::new("test", JobContent::shell(vec!["true".to_string()])).with_pool(pool_id);
        QueuedJob::new(job, ResourceRequirements::new(cpu, "128Mi"), HashMap::new())
    }

    fn scheduler_with(
        registry: Arc<PoolRegistry>,
        monitor: Arc<StaticResourceMonitor>,
    ) -> PlacementScheduler {
        let monitors: HashMap<String, Arc<dyn ResourceMonitor>> =
            HashMap::from([("docker".to_string(), monitor as Arc<dyn ResourceMonitor>)]);
        PlacementScheduler::new(registry, monitors, PlacementStrategy::LeastLoaded)
    }

    fn registry_without_default() -> Arc<PoolRegistry> {
        // Tests that need a clean slate deactivate the bootstrap pool.
        let registry = PoolRegistry::new();
        let mut default_pool = registry.find_by_name("default").unwrap();
        default_pool.status = crate::pools::pool::PoolStatus::Inactive;
        registry.update(default_pool).unwrap();
        Arc::new(registry)
    }

    fn gib(n: u64) -> u64 {
        n * 1024 * 1024 * 1024
    }

    #[tokio::test]
    async fn test_no_active_pools() {
        let registry = registry_without_default();
        let monitor = Arc::new(StaticResourceMonitor::new(8.0, gib(16)));
        let scheduler = scheduler_with(registry, monitor);

        let err = scheduler.find_placement(&entry(1.0, "1Gi"), None).await.unwrap_err();
        assert!(matches!(err, PlacementError::NoActivePools));
    }

    #[tokio::test]
    async fn test_least_loaded_prefers_freer_pool() {
        let registry = registry_without_default();
        let p1 = ResourcePool::new("p1", "docker");
        let p2 = ResourcePool::new("p2", "docker");
        let monitor = Arc::new(StaticResourceMonitor::new(8.0, gib(16)));
        monitor.set(
            ResourcePoolUtilization::new(p1.id.clone(), 8.0, gib(16)).with_usage(2.0, gib(2), 1),
        );
        monitor.set(
            ResourcePoolUtilization::new(p2.id.clone(), 8.0, gib(16)).with_usage(7.0, gib(2), 1),
        );
        registry.save(p1.clone()).unwrap();
        registry.save(p2).unwrap();

        let scheduler = scheduler_with(registry, monitor);
        let chosen = scheduler
            .find_placement(&entry(2.0, "1Gi"), Some("leastloaded"))
            .await
            .unwrap();
        assert_eq!(chosen.id, p1.id);
    }

    #[tokio::test]
    async fn test_capacity_filter_rejects_small_pools() {
        let registry = registry_without_default();
        let p1 = ResourcePool::new("p1", "docker");
        let monitor = Arc::new(StaticResourceMonitor::new(8.0, gib(16)));
        monitor.set(
            ResourcePoolUtilization::new(p1.id.clone(), 4.0, gib(4)).with_usage(3.5, gib(3), 2),
        );
        registry.save(p1).unwrap();

        let scheduler = scheduler_with(registry, monitor);
        let err = scheduler
            .find_placement(&entry(2.0, "2Gi"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PlacementError::InsufficientCapacity { .. }));
    }

    #[tokio::test]
    async fn test_pinned_pool_must_be_active_and_fit() {
        let registry = registry_without_default();
        let pool = ResourcePool::new("pinned", "docker");
        let pool_id = pool.id.clone();
        let monitor = Arc::new(StaticResourceMonitor::new(8.0, gib(16)));
        monitor.set(
            ResourcePoolUtilization::new(pool_id.clone(), 2.0, gib(2)).with_usage(1.5, gib(1), 0),
        );
        registry.save(pool.clone()).unwrap();

        let scheduler = scheduler_with(registry.clone(), monitor);

        // Fits: 0.5 cores free, ask 0.25.
        let chosen = scheduler
            .find_placement(&pinned_entry(pool_id.clone(), 0.25), None)
            .await
            .unwrap();
        assert_eq!(chosen.id, pool_id);

        // Too big for the pinned pool: pinning never falls back.
        let err = scheduler
            .find_placement(&pinned_entry(pool_id.clone(), 4.0), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PlacementError::InsufficientCapacity { .. }));

        // Unknown pinned pool.
        let err = scheduler
            .find_placement(&pinned_entry(PoolId::new("ghost"), 0.25), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PlacementError::PoolNotFound(_)));
    }

    #[tokio::test]
    async fn test_round_robin_cycles_and_is_idempotent_on_singleton() {
        let registry = registry_without_default();
        let p1 = ResourcePool::new("a", "docker");
        let p2 = ResourcePool::new("b", "docker");
        let monitor = Arc::new(StaticResourceMonitor::new(8.0, gib(16)));
        registry.save(p1.clone()).unwrap();
        registry.save(p2.clone()).unwrap();

        let scheduler = scheduler_with(registry.clone(), monitor.clone());
        let first = scheduler
            .find_placement(&entry(1.0, "1Gi"), Some("roundrobin"))
            .await
            .unwrap();
        let second = scheduler
            .find_placement(&entry(1.0, "1Gi"), Some("roundrobin"))
            .await
            .unwrap();
        assert_ne!(first.id, second.id);

        // A single candidate is chosen every time.
        registry.delete(&p2.id).unwrap();
        for _ in 0..3 {
            let chosen = scheduler
                .find_placement(&entry(1.0, "1Gi"), Some("roundrobin"))
                .await
                .unwrap();
            assert_eq!(chosen.id, p1.id);
        }
    }

    #[tokio::test]
    async fn test_greedy_picks_tightest_fit() {
        let registry = registry_without_default();
        let big = ResourcePool::new("big", "docker");
        let tight = ResourcePool::new("tight", "docker");
        let monitor = Arc::new(StaticResourceMonitor::new(8.0, gib(16)));
        monitor.set(ResourcePoolUtilization::new(big.id.clone(), 16.0, gib(64)));
        monitor.set(
            ResourcePoolUtilization::new(tight.id.clone(), 8.0, gib(16)).with_usage(6.0, gib(12), 1),
        );
        registry.save(big).unwrap();
        registry.save(tight.clone()).unwrap();

        let scheduler = scheduler_with(registry, monitor);
        let chosen = scheduler
            .find_placement(&entry(1.0, "1Gi"), Some("greedy"))
            .await
            .unwrap();
        assert_eq!(chosen.id, tight.id);
    }

    #[tokio::test]
    async fn test_binpacking_takes_first_by_name() {
        let registry = registry_without_default();
        let alpha = ResourcePool::new("alpha", "docker");
        let beta = ResourcePool::new("beta", "docker");
        let monitor = Arc::new(StaticResourceMonitor::new(8.0, gib(16)));
        registry.save(beta).unwrap();
        registry.save(alpha.clone()).unwrap();

        let scheduler = scheduler_with(registry, monitor);
        let chosen = scheduler
            .find_placement(&entry(1.0, "1Gi"), Some("binpacking"))
            .await
            .unwrap();
        assert_eq!(chosen.id, alpha.id);
    }

    #[tokio::test]
    async fn test_unknown_strategy_rejected() {
        let registry = Arc::new(PoolRegistry::new());
        let monitor = Arc::new(StaticResourceMonitor::new(8.0, gib(16)));
        let scheduler = scheduler_with(registry, monitor);

        let err = scheduler
            .find_placement(&entry(1.0, "1Gi"), Some("wishful"))
            .await
            .unwrap_err();
        assert!(matches!(err, PlacementError::UnknownStrategy(_)));
    }

    #[tokio::test]
    async fn test_max_jobs_bound_filters_pool() {
        let registry = registry_without_default();
        let pool = ResourcePool::new("busy", "docker").with_max_jobs(2);
        let monitor = Arc::new(StaticResourceMonitor::new(8.0, gib(16)));
        monitor.set(
            ResourcePoolUtilization::new(pool.id.clone(), 8.0, gib(16)).with_usage(1.0, gib(1), 2),
        );
        registry.save(pool).unwrap();

        let scheduler = scheduler_with(registry, monitor);
        let err = scheduler.find_placement(&entry(1.0, "1Gi"), None).await.unwrap_err();
        assert!(matches!(err, PlacementError::InsufficientCapacity { .. }));
    }
}
