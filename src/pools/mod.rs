//! Resource pools and their registry.

pub mod pool;
pub mod registry;

pub use pool::{PoolStatus, ResourcePool, ResourcePoolUtilization, DEFAULT_POOL_NAME};
pub use registry::{PoolRegistry, RegistryError};
