//! Keyed store for resource pools with a unique name index.
//!
//! The registry is bootstrapped with an undeletable system `default`
//! pool. Writes are serialized; listings return pools ordered by name so
//! callers observe a deterministic order. Capacity monitoring is not the
//! registry's concern; the placement scheduler probes it separately.

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;
use tracing::info;

use crate::ids::PoolId;
use crate::pools::pool::{PoolStatus, ResourcePool};

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No pool with the given id.
    #[error("pool {0} not found")]
    NotFound(PoolId),

    /// Another pool already owns the target name.
    #[error("pool name '{name}' already used by pool {owner}")]
    NameConflict { name: String, owner: PoolId },

    /// The system default pool cannot be deleted.
    #[error("pool {0} is system-owned and cannot be deleted")]
    SystemPoolProtected(PoolId),
}

/// In-memory pool registry with a secondary index by name.
pub struct PoolRegistry {
    inner: RwLock<Inner>,
}

struct Inner {
    pools: HashMap<PoolId, ResourcePool>,
    by_name: HashMap<String, PoolId>,
}

impl PoolRegistry {
    /// Creates a registry holding only the system default pool.
    pub fn new() -> Self {
        let default_pool = ResourcePool::default_pool();
        info!(pool_id = %default_pool.id, "bootstrapped default resource pool");

        let mut pools = HashMap::new();
        let mut by_name = HashMap::new();
        by_name.insert(default_pool.name.clone(), default_pool.id.clone());
        pools.insert(default_pool.id.clone(), default_pool);

        Self {
            inner: RwLock::new(Inner { pools, by_name }),
        }
    }

    /// Saves a new pool or replaces an existing one with the same id.
    ///
    /// Fails with `NameConflict` when a different pool owns the name.
    pub fn save(&self, pool: ResourcePool) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        if let Some(owner) = inner.by_name.get(&pool.name) {
            if *owner != pool.id {
                return Err(RegistryError::NameConflict {
                    name: pool.name.clone(),
                    owner: owner.clone(),
                });
            }
        }

        // Renaming has to drop the stale name index entry.
        if let Some(existing) = inner.pools.get(&pool.id) {
            if existing.name != pool.name {
                let old_name = existing.name.clone();
                inner.by_name.remove(&old_name);
            }
        }

        inner.by_name.insert(pool.name.clone(), pool.id.clone());
        inner.pools.insert(pool.id.clone(), pool);
        Ok(())
    }

    /// Updates an existing pool. Fails with `NotFound` when the id is
    /// unknown, `NameConflict` when the new name is taken.
    pub fn update(&self, pool: ResourcePool) -> Result<(), RegistryError> {
        {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            if !inner.pools.contains_key(&pool.id) {
                return Err(RegistryError::NotFound(pool.id.clone()));
            }
        }
        self.save(pool)
    }

    /// Looks a pool up by id.
    pub fn find_by_id(&self, id: &PoolId) -> Option<ResourcePool> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .pools
            .get(id)
            .cloned()
    }

    /// Looks a pool up by its unique name.
    pub fn find_by_name(&self, name: &str) -> Option<ResourcePool> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .by_name
            .get(name)
            .and_then(|id| inner.pools.get(id))
            .cloned()
    }

    /// Returns all pools in `Active` status, ordered by name.
    pub fn find_active(&self) -> Vec<ResourcePool> {
        let mut active: Vec<ResourcePool> = self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .pools
            .values()
            .filter(|pool| pool.status == PoolStatus::Active)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.name.cmp(&b.name));
        active
    }

    /// Returns pools carrying the label `key=value`, ordered by name.
    pub fn find_by_label(&self, key: &str, value: &str) -> Vec<ResourcePool> {
        let mut matching: Vec<ResourcePool> = self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .pools
            .values()
            .filter(|pool| pool.labels.get(key).map(String::as_str) == Some(value))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.name.cmp(&b.name));
        matching
    }

    /// Returns all pools, ordered by name.
    pub fn list(&self) -> Vec<ResourcePool> {
        let mut pools: Vec<ResourcePool> = self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .pools
            .values()
            .cloned()
            .collect();
        pools.sort_by(|a, b| a.name.cmp(&b.name));
        pools
    }

    /// Deletes a pool. The system default pool is protected.
    pub fn delete(&self, id: &PoolId) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        let pool = inner
            .pools
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        if pool.system_owned {
            return Err(RegistryError::SystemPoolProtected(id.clone()));
        }

        let name = pool.name.clone();
        inner.pools.remove(id);
        inner.by_name.remove(&name);
        Ok(())
    }

    /// Returns whether a pool with the given id exists.
    pub fn exists(&self, id: &PoolId) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .pools
            .contains_key(id)
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pools::pool::DEFAULT_POOL_NAME;

    #[test]
    fn test_bootstrap_creates_default_pool() {
        let registry = PoolRegistry::new();

        let pool = registry
            .find_by_name(DEFAULT_POOL_NAME)
            .expect("default pool should exist");
        assert!(pool.system_owned);
        assert!(registry.exists(&pool.id));
    }

    #[test]
    fn test_default_pool_cannot_be_deleted() {
        let registry = PoolRegistry::new();
        let pool = registry.find_by_name(DEFAULT_POOL_NAME).unwrap();

        let err = registry.delete(&pool.id).unwrap_err();
        assert!(matches!(err, RegistryError::SystemPoolProtected(_)));
        assert!(registry.exists(&pool.id));
    }

    #[test]
    fn test_save_and_find_roundtrip() {
        let registry = PoolRegistry::new();
        let pool = ResourcePool::new("ci", "docker");
        let id = pool.id.clone();

        registry.save(pool.clone()).unwrap();

        let found = registry.find_by_id(&id).expect("pool should exist");
        assert_eq!(found.name, "ci");
        assert_eq!(found.pool_type, "docker");
        assert_eq!(registry.find_by_name("ci").unwrap().id, id);
    }

    #[test]
    fn test_name_conflict_rejected() {
        let registry = PoolRegistry::new();
        registry.save(ResourcePool::new("ci", "docker")).unwrap();

        let err = registry
            .save(ResourcePool::new("ci", "kubernetes"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::NameConflict { .. }));
    }

    #[test]
    fn test_rename_updates_name_index() {
        let registry = PoolRegistry::new();
        let mut pool = ResourcePool::new("ci", "docker");
        registry.save(pool.clone()).unwrap();

        pool.name = "ci-x86".to_string();
        registry.update(pool.clone()).unwrap();

        assert!(registry.find_by_name("ci").is_none());
        assert_eq!(registry.find_by_name("ci-x86").unwrap().id, pool.id);

        // The released name is reusable.
        registry.save(ResourcePool::new("ci", "local")).unwrap();
    }

    #[test]
    fn test_update_unknown_pool_fails() {
        let registry = PoolRegistry::new();
        let err = registry.update(ResourcePool::new("ghost", "docker")).unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[test]
    fn test_listings_are_name_ordered() {
        let registry = PoolRegistry::new();
        registry.save(ResourcePool::new("zeta", "docker")).unwrap();
        registry.save(ResourcePool::new("alpha", "docker")).unwrap();

        let names: Vec<String> = registry.list().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["alpha", "default", "zeta"]);
    }

    #[test]
    fn test_find_active_excludes_other_statuses() {
        let registry = PoolRegistry::new();
        registry
            .save(ResourcePool::new("draining", "docker").with_status(PoolStatus::Draining))
            .unwrap();
        registry.save(ResourcePool::new("live", "docker")).unwrap();

        let names: Vec<String> = registry.find_active().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["default", "live"]);
    }

    #[test]
    fn test_find_by_label() {
        let registry = PoolRegistry::new();
        let labels = HashMap::from([("tier".to_string(), "gpu".to_string())]);
        registry
            .save(ResourcePool::new("gpu-pool", "kubernetes").with_labels(labels))
            .unwrap();

        let found = registry.find_by_label("tier", "gpu");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "gpu-pool");
        assert!(registry.find_by_label("tier", "cpu").is_empty());
    }

    #[test]
    fn test_delete_removes_pool_and_name() {
        let registry = PoolRegistry::new();
        let pool = ResourcePool::new("ci", "docker");
        let id = pool.id.clone();
        registry.save(pool).unwrap();

        registry.delete(&id).unwrap();
        assert!(!registry.exists(&id));
        assert!(registry.find_by_name("ci").is_none());
        assert!(matches!(
            registry.delete(&id),
            Err(RegistryError::NotFound(_))
        ));
    }
}
