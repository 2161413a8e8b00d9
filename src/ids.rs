//! Opaque identifier types used across the orchestration engine.
//!
//! Identifiers are value-compared strings; the engine never interprets
//! their contents. Freshly generated ids are UUIDv4, but any non-empty
//! string handed in by a caller is a valid id.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps an existing identifier string.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Generates a fresh random identifier.
            pub fn random() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

id_type!(
    /// Identifies a job across its whole lifecycle.
    JobId
);

id_type!(
    /// Identifies a single run of a job on a specific worker.
    ExecutionId
);

id_type!(
    /// Identifies a worker instance and its session.
    WorkerId
);

id_type!(
    /// Identifies a resource pool.
    PoolId
);

id_type!(
    /// Content address (or provider-assigned id) of a cached artifact.
    ArtifactId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_compare_by_value() {
        let a = JobId::new("job-1");
        let b = JobId::from("job-1");
        let c = JobId::new("job-2");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_random_ids_are_unique() {
        assert_ne!(WorkerId::random(), WorkerId::random());
    }

    #[test]
    fn test_id_serializes_as_plain_string() {
        let id = PoolId::new("default");
        let json = serde_json::to_string(&id).expect("id should serialize");

        assert_eq!(json, "\"default\"");

        let parsed: PoolId = serde_json::from_str(&json).expect("id should deserialize");
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_display_matches_inner() {
        let id = ExecutionId::new("exec-42");
        assert_eq!(id.to_string(), "exec-42");
        assert_eq!(id.as_str(), "exec-42");
    }
}
