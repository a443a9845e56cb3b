//! Docker execution layer.
//!
//! This module provides the container execution client: a capability surface
//! over a Docker daemon ([`DockerApi`]), its live bollard implementation
//! ([`DockerClient`]), an expectation-based double for tests
//! ([`MockDocker`]) and a runner for disposable analysis containers.
//!
//! # Architecture
//!
//! Container handles follow this lifecycle, driven by the caller:
//! ```text
//! CREATE → START → WAIT/LOGS → REMOVE
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use docker_exec::execution::{Cancellation, ContainerRunner, DaemonConfig, DockerClient, RunSpec};
//!
//! let client = Arc::new(DockerClient::new(DaemonConfig::from_env()));
//! let runner = ContainerRunner::new(client);
//!
//! let spec = RunSpec::new("python:3.12-slim")
//!     .with_cmd(vec!["python".into(), "-c".into(), "print('hello')".into()]);
//! let output = runner.run(&spec, &Cancellation::new()).await?;
//! println!("{}", output.logs);
//! ```

pub mod api;
pub mod cancel;
pub mod connector;
pub mod container;
pub mod docker_client;
pub mod mock;
pub mod resources;

pub use api::{ByteStream, DockerApi, PingInfo, WaitHandle, WaitResult};
pub use cancel::Cancellation;
pub use connector::{
    DaemonConfig, DaemonConnector, DEFAULT_ENDPOINT, DOCKER_CERT_PATH_ENV, DOCKER_HOST_ENV,
};
pub use container::{normalize_reference, ContainerRunner, PullPolicy, RunOutput, RunSpec};
pub use docker_client::DockerClient;
pub use mock::MockDocker;
pub use resources::{limits_for_profile, ExecutionLimits};
