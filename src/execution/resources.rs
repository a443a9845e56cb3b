//! Resource limits for analysis containers.
//!
//! Limits come in named profiles so callers can pick a size class for a tool
//! without spelling out every cap.

use std::time::Duration;

use bollard::models::HostConfig;
use serde::{Deserialize, Serialize};

/// Execution resource limits for a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Memory limit in megabytes.
    pub memory_mb: u64,
    /// CPU cores available (e.g., 0.5, 1.0, 2.0).
    pub cpu_cores: f64,
    /// Maximum number of processes allowed.
    pub max_processes: u64,
    /// Timeout in seconds before the container is killed.
    pub timeout_seconds: u64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        // Same as the "standard" profile
        Self {
            memory_mb: 1024,
            cpu_cores: 1.0,
            max_processes: 256,
            timeout_seconds: 600, // 10 minutes
        }
    }
}

impl ExecutionLimits {
    /// Creates new execution limits with the given parameters.
    pub fn new(memory_mb: u64, cpu_cores: f64, max_processes: u64, timeout_seconds: u64) -> Self {
        Self {
            memory_mb,
            cpu_cores,
            max_processes,
            timeout_seconds,
        }
    }

    /// Returns memory limit in bytes.
    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb * 1024 * 1024) as i64
    }

    /// Returns CPU period in microseconds (fixed at 100ms).
    pub fn cpu_period(&self) -> i64 {
        100_000
    }

    /// Returns CPU quota based on cores allocated.
    ///
    /// Formula: quota = period * cores
    /// e.g., 1.0 core = 100000 quota (100% of one CPU)
    pub fn cpu_quota(&self) -> i64 {
        (self.cpu_period() as f64 * self.cpu_cores) as i64
    }

    /// Returns the timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Host configuration carrying these limits.
    pub fn host_config(&self) -> HostConfig {
        HostConfig {
            memory: Some(self.memory_bytes()),
            cpu_period: Some(self.cpu_period()),
            cpu_quota: Some(self.cpu_quota()),
            pids_limit: Some(self.max_processes as i64),
            ..Default::default()
        }
    }
}

/// Get execution limits for a named profile.
///
/// Supported profiles:
/// - "light" - linters and secret scanners over small trees
/// - "standard" - most analysis tools
/// - "heavy" - dependency resolvers and whole-program analyzers
///
/// Unknown profiles default to "standard".
///
/// # Example
///
/// ```
/// use docker_exec::execution::limits_for_profile;
///
/// let limits = limits_for_profile("heavy");
/// assert_eq!(limits.memory_mb, 4096);
/// assert_eq!(limits.timeout_seconds, 1800);
/// ```
pub fn limits_for_profile(profile: &str) -> ExecutionLimits {
    match profile.to_lowercase().as_str() {
        "light" => ExecutionLimits {
            memory_mb: 512,
            cpu_cores: 0.5,
            max_processes: 128,
            timeout_seconds: 300, // 5 minutes
        },
        "heavy" => ExecutionLimits {
            memory_mb: 4096,
            cpu_cores: 2.0,
            max_processes: 1024,
            timeout_seconds: 1800, // 30 minutes
        },
        _ => ExecutionLimits::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_light_limits() {
        let limits = limits_for_profile("light");
        assert_eq!(limits.memory_mb, 512);
        assert_eq!(limits.cpu_cores, 0.5);
        assert_eq!(limits.max_processes, 128);
        assert_eq!(limits.timeout_seconds, 300);
    }

    #[test]
    fn test_heavy_limits() {
        let limits = limits_for_profile("heavy");
        assert_eq!(limits.memory_mb, 4096);
        assert_eq!(limits.cpu_cores, 2.0);
        assert_eq!(limits.max_processes, 1024);
        assert_eq!(limits.timeout_seconds, 1800);
    }

    #[test]
    fn test_case_insensitive() {
        assert_eq!(limits_for_profile("HEAVY"), limits_for_profile("heavy"));
        assert_eq!(limits_for_profile("Light"), limits_for_profile("light"));
    }

    #[test]
    fn test_unknown_defaults_to_standard() {
        assert_eq!(limits_for_profile("unknown"), limits_for_profile("standard"));
        assert_eq!(limits_for_profile("standard"), ExecutionLimits::default());
    }

    #[test]
    fn test_memory_bytes_conversion() {
        let limits = ExecutionLimits::new(512, 1.0, 100, 300);
        assert_eq!(limits.memory_bytes(), 512 * 1024 * 1024);
    }

    #[test]
    fn test_cpu_quota_calculation() {
        let limits = ExecutionLimits::new(512, 2.0, 100, 300);
        assert_eq!(limits.cpu_period(), 100_000);
        assert_eq!(limits.cpu_quota(), 200_000); // 2 cores = 2 * period
    }

    #[test]
    fn test_host_config_carries_limits() {
        let limits = ExecutionLimits::new(256, 0.5, 64, 60);
        let host = limits.host_config();
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.cpu_quota, Some(50_000));
        assert_eq!(host.pids_limit, Some(64));
        assert_eq!(limits.timeout(), Duration::from_secs(60));
    }
}
