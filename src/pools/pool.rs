//! Resource pool definitions.
//!
//! A pool is a named capacity bucket served by a single backend type
//! ("docker", "kubernetes", "local", ...). Utilization samples are
//! produced by a resource monitor and consumed by the placement
//! scheduler.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::PoolId;

/// Well-known id and name of the system default pool.
pub const DEFAULT_POOL_NAME: &str = "default";

/// Lifecycle status of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolStatus {
    Inactive,
    Active,
    Draining,
    Failed,
}

impl std::fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PoolStatus::Inactive => "inactive",
            PoolStatus::Active => "active",
            PoolStatus::Draining => "draining",
            PoolStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A named capacity bucket served by one backend type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcePool {
    pub id: PoolId,
    /// Unique across the registry.
    pub name: String,
    /// Backend tag: "docker", "kubernetes", "local", ...
    pub pool_type: String,
    pub status: PoolStatus,
    /// Upper bound on concurrently provisioned workers.
    pub max_workers: usize,
    /// Optional upper bound on concurrently running jobs.
    #[serde(default)]
    pub max_jobs: Option<usize>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// System pools cannot be deleted.
    #[serde(default)]
    pub system_owned: bool,
}

impl ResourcePool {
    /// Creates an active pool with the given name and backend type.
    pub fn new(name: impl Into<String>, pool_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: PoolId::random(),
            name: name.into(),
            pool_type: pool_type.into(),
            status: PoolStatus::Active,
            max_workers: 10,
            max_jobs: None,
            labels: HashMap::new(),
            created_at: now,
            updated_at: now,
            system_owned: false,
        }
    }

    /// The system default pool created at bootstrap.
    pub fn default_pool() -> Self {
        let mut pool = Self::new(DEFAULT_POOL_NAME, "local");
        pool.id = PoolId::new(DEFAULT_POOL_NAME);
        pool.system_owned = true;
        pool
    }

    /// Sets the worker bound.
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Sets the running-job bound.
    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = Some(max_jobs);
        self
    }

    /// Adds labels.
    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    /// Sets the lifecycle status.
    pub fn with_status(mut self, status: PoolStatus) -> Self {
        self.status = status;
        self
    }

    /// Returns whether the pool accepts placements.
    pub fn is_active(&self) -> bool {
        self.status == PoolStatus::Active
    }
}

/// A point-in-time utilization sample for a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePoolUtilization {
    pub pool_id: PoolId,
    pub total_cpu: f64,
    pub used_cpu: f64,
    pub total_memory_bytes: u64,
    pub used_memory_bytes: u64,
    pub running_jobs: usize,
    pub sampled_at: DateTime<Utc>,
}

impl ResourcePoolUtilization {
    /// Creates a sample stamped with the current instant.
    pub fn new(pool_id: PoolId, total_cpu: f64, total_memory_bytes: u64) -> Self {
        Self {
            pool_id,
            total_cpu,
            used_cpu: 0.0,
            total_memory_bytes,
            used_memory_bytes: 0,
            running_jobs: 0,
            sampled_at: Utc::now(),
        }
    }

    /// Sets the consumed share of the sample.
    pub fn with_usage(mut self, used_cpu: f64, used_memory_bytes: u64, running_jobs: usize) -> Self {
        self.used_cpu = used_cpu;
        self.used_memory_bytes = used_memory_bytes;
        self.running_jobs = running_jobs;
        self
    }

    /// Free CPU cores.
    pub fn free_cpu(&self) -> f64 {
        (self.total_cpu - self.used_cpu).max(0.0)
    }

    /// Free memory in bytes.
    pub fn free_memory_bytes(&self) -> u64 {
        self.total_memory_bytes.saturating_sub(self.used_memory_bytes)
    }

    /// Load factor: the worse of the cpu and memory ratios, in [0, 1].
    pub fn load(&self) -> f64 {
        let cpu = if self.total_cpu > 0.0 {
            self.used_cpu / self.total_cpu
        } else {
            1.0
        };
        let mem = if self.total_memory_bytes > 0 {
            self.used_memory_bytes as f64 / self.total_memory_bytes as f64
        } else {
            1.0
        };
        cpu.max(mem).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_defaults() {
        let pool = ResourcePool::new("ci", "docker");

        assert_eq!(pool.status, PoolStatus::Active);
        assert!(pool.is_active());
        assert!(!pool.system_owned);
        assert_eq!(pool.max_workers, 10);
        assert!(pool.max_jobs.is_none());
    }

    #[test]
    fn test_default_pool_is_system_owned() {
        let pool = ResourcePool::default_pool();

        assert_eq!(pool.id, PoolId::new(DEFAULT_POOL_NAME));
        assert_eq!(pool.name, DEFAULT_POOL_NAME);
        assert!(pool.system_owned);
        assert!(pool.is_active());
    }

    #[test]
    fn test_utilization_free_and_load() {
        let sample = ResourcePoolUtilization::new(PoolId::new("p1"), 8.0, 16 * 1024 * 1024 * 1024)
            .with_usage(2.0, 4 * 1024 * 1024 * 1024, 3);

        assert_eq!(sample.free_cpu(), 6.0);
        assert_eq!(sample.free_memory_bytes(), 12 * 1024 * 1024 * 1024);
        assert!((sample.load() - 0.25).abs() < f64::EPSILON);
        assert_eq!(sample.running_jobs, 3);
    }

    #[test]
    fn test_load_takes_worse_ratio() {
        let sample = ResourcePoolUtilization::new(PoolId::new("p1"), 8.0, 1000)
            .with_usage(1.0, 900, 0);

        assert!((sample.load() - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_load_of_zero_capacity_is_full() {
        let sample = ResourcePoolUtilization::new(PoolId::new("p1"), 0.0, 0);
        assert!((sample.load() - 1.0).abs() < f64::EPSILON);
    }
}
