//! Resource requirements attached to queued jobs.
//!
//! Memory is declared as a string with a unit suffix (`512Mi`, `2Gi`,
//! `1G`, plain bytes). Parsing failures are tolerated: they yield 0 bytes
//! and a warning, so a malformed requirement never blocks admission.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Binary and decimal memory suffixes, largest first so `Gi` wins over `G`.
const SUFFIXES: &[(&str, u64)] = &[
    ("Ki", 1024),
    ("Mi", 1024 * 1024),
    ("Gi", 1024 * 1024 * 1024),
    ("Ti", 1024 * 1024 * 1024 * 1024),
    ("K", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
];

/// CPU and memory a job asks for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    /// Requested CPU in decimal cores (e.g. 0.5, 2.0).
    pub cpu_cores: f64,
    /// Requested memory with optional suffix (e.g. "512Mi").
    pub memory: String,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            cpu_cores: 1.0,
            memory: "1024Mi".to_string(),
        }
    }
}

impl ResourceRequirements {
    /// Creates requirements from cores and a memory string.
    pub fn new(cpu_cores: f64, memory: impl Into<String>) -> Self {
        Self {
            cpu_cores,
            memory: memory.into(),
        }
    }

    /// Returns the requested memory in bytes, 0 if the string is malformed.
    pub fn memory_bytes(&self) -> u64 {
        parse_memory(&self.memory)
    }
}

/// Parses a memory string into bytes.
///
/// Bare integers are bytes. Unknown suffixes or non-numeric values yield 0
/// with a warning.
pub fn parse_memory(value: &str) -> u64 {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        warn!(value, "empty memory requirement, treating as 0");
        return 0;
    }

    for (suffix, multiplier) in SUFFIXES {
        if let Some(number) = trimmed.strip_suffix(suffix) {
            return match number.trim().parse::<u64>() {
                Ok(n) => n.saturating_mul(*multiplier),
                Err(_) => {
                    warn!(value, "unparseable memory requirement, treating as 0");
                    0
                }
            };
        }
    }

    match trimmed.parse::<u64>() {
        Ok(n) => n,
        Err(_) => {
            warn!(value, "unparseable memory requirement, treating as 0");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_binary_suffixes() {
        assert_eq!(parse_memory("1Ki"), 1024);
        assert_eq!(parse_memory("2Mi"), 2 * 1024 * 1024);
        assert_eq!(parse_memory("3Gi"), 3 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("1Ti"), 1024_u64.pow(4));
    }

    #[test]
    fn test_parse_decimal_suffixes() {
        assert_eq!(parse_memory("1K"), 1_000);
        assert_eq!(parse_memory("5M"), 5_000_000);
        assert_eq!(parse_memory("2G"), 2_000_000_000);
        assert_eq!(parse_memory("1T"), 1_000_000_000_000);
    }

    #[test]
    fn test_parse_bare_bytes() {
        assert_eq!(parse_memory("4096"), 4096);
        assert_eq!(parse_memory(" 512 "), 512);
    }

    #[test]
    fn test_parse_failures_yield_zero() {
        assert_eq!(parse_memory(""), 0);
        assert_eq!(parse_memory("lots"), 0);
        assert_eq!(parse_memory("12Qi"), 0);
        assert_eq!(parse_memory("-5Mi"), 0);
    }

    #[test]
    fn test_requirements_memory_bytes() {
        let req = ResourceRequirements::new(2.0, "4096Mi");
        assert_eq!(req.memory_bytes(), 4096 * 1024 * 1024);

        let req = ResourceRequirements::default();
        assert_eq!(req.cpu_cores, 1.0);
        assert_eq!(req.memory_bytes(), 1024 * 1024 * 1024);
    }
}
