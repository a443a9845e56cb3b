//! Daemon endpoint configuration and the lazily-built connection handle.
//!
//! The connector never touches the network while it is being constructed.
//! The bollard handle is built on first use; if that fails, the failure is
//! cached and every operation reports it as [`DockerError::DaemonUnreachable`].

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use bollard::{Docker, API_DEFAULT_VERSION};

use crate::error::DockerError;

/// Environment variable selecting the daemon endpoint.
pub const DOCKER_HOST_ENV: &str = "DOCKER_HOST";

/// Environment variable naming the directory with `key.pem`, `cert.pem` and
/// `ca.pem` for `https://` endpoints.
pub const DOCKER_CERT_PATH_ENV: &str = "DOCKER_CERT_PATH";

/// Endpoint used when `DOCKER_HOST` is not set.
#[cfg(not(windows))]
pub const DEFAULT_ENDPOINT: &str = "unix:///var/run/docker.sock";

/// Endpoint used when `DOCKER_HOST` is not set.
#[cfg(windows)]
pub const DEFAULT_ENDPOINT: &str = "npipe:////./pipe/docker_engine";

/// Request timeout applied to every daemon call (bollard's own default).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Connection settings for the Docker daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Daemon address, e.g. `unix:///var/run/docker.sock` or `tcp://host:2375`.
    pub endpoint: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// TLS material directory, required for `https://` endpoints.
    pub cert_path: Option<PathBuf>,
}

impl DaemonConfig {
    /// Creates a configuration for an explicit endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: DEFAULT_TIMEOUT,
            cert_path: None,
        }
    }

    /// Reads the endpoint from `DOCKER_HOST`, falling back to [`DEFAULT_ENDPOINT`],
    /// and the TLS directory from `DOCKER_CERT_PATH`.
    ///
    /// Call this once at the composition root and pass the value down.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but with a custom variable lookup.
    ///
    /// Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let endpoint = read(DOCKER_HOST_ENV).unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let config = Self::new(endpoint);
        match read(DOCKER_CERT_PATH_ENV) {
            Some(dir) => config.with_cert_path(dir),
            None => config,
        }
    }

    /// Sets the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the TLS material directory.
    pub fn with_cert_path(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cert_path = Some(dir.into());
        self
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ENDPOINT)
    }
}

/// Shared connection handle to the Docker daemon.
///
/// Safe to share across tasks: the underlying bollard client is cloned per
/// request and holds no per-container state.
#[derive(Debug)]
pub struct DaemonConnector {
    config: DaemonConfig,
    docker: OnceLock<Result<Docker, String>>,
}

impl DaemonConnector {
    /// Creates a connector. Never fails; connection problems surface on first use.
    pub fn connect(config: DaemonConfig) -> Self {
        tracing::debug!(endpoint = %config.endpoint, "Configured Docker daemon endpoint");
        Self {
            config,
            docker: OnceLock::new(),
        }
    }

    /// Returns the endpoint this connector was constructed with.
    pub fn resolved_endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// Returns the configuration this connector was constructed with.
    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Returns the bollard handle, building it on first call.
    pub fn docker(&self) -> Result<&Docker, DockerError> {
        self.docker
            .get_or_init(|| build_docker(&self.config))
            .as_ref()
            .map_err(|reason| DockerError::DaemonUnreachable(reason.clone()))
    }
}

fn build_docker(config: &DaemonConfig) -> Result<Docker, String> {
    let endpoint = config.endpoint.as_str();
    let timeout = config.timeout.as_secs();

    let result = if endpoint.starts_with("unix://") {
        connect_unix(endpoint, timeout)
    } else if endpoint.starts_with("tcp://") || endpoint.starts_with("http://") {
        Docker::connect_with_http(endpoint, timeout, API_DEFAULT_VERSION)
            .map_err(|e| format!("failed to connect to {endpoint}: {e}"))
    } else if let Some(address) = endpoint.strip_prefix("https://") {
        match &config.cert_path {
            Some(dir) => connect_tls(address, dir, timeout),
            None => Err(format!(
                "{endpoint} needs TLS material; set {DOCKER_CERT_PATH_ENV}"
            )),
        }
    } else if endpoint.starts_with("npipe://") {
        connect_named_pipe(endpoint, timeout)
    } else {
        Err(format!("unsupported endpoint scheme in '{endpoint}'"))
    };

    if let Err(reason) = &result {
        tracing::warn!(endpoint = %endpoint, error = %reason, "Docker client unavailable");
    }
    result
}

fn connect_tls(address: &str, dir: &Path, timeout: u64) -> Result<Docker, String> {
    Docker::connect_with_ssl(
        address,
        &dir.join("key.pem"),
        &dir.join("cert.pem"),
        &dir.join("ca.pem"),
        timeout,
        API_DEFAULT_VERSION,
    )
    .map_err(|e| format!("failed to connect to https://{address}: {e}"))
}

#[cfg(unix)]
fn connect_unix(endpoint: &str, timeout: u64) -> Result<Docker, String> {
    Docker::connect_with_unix(endpoint, timeout, API_DEFAULT_VERSION)
        .map_err(|e| format!("failed to connect to {endpoint}: {e}"))
}

#[cfg(not(unix))]
fn connect_unix(endpoint: &str, _timeout: u64) -> Result<Docker, String> {
    Err(format!("unix sockets are not supported on this platform: '{endpoint}'"))
}

#[cfg(windows)]
fn connect_named_pipe(endpoint: &str, timeout: u64) -> Result<Docker, String> {
    Docker::connect_with_named_pipe(endpoint, timeout, API_DEFAULT_VERSION)
        .map_err(|e| format!("failed to connect to {endpoint}: {e}"))
}

#[cfg(not(windows))]
fn connect_named_pipe(endpoint: &str, _timeout: u64) -> Result<Docker, String> {
    Err(format!("named pipes are only supported on Windows: '{endpoint}'"))
}
