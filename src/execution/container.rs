//! Runs one disposable analysis container to completion.
//!
//! [`ContainerRunner`] drives a container through
//! ensure-image → create → start → wait + logs → remove using only
//! [`DockerApi`], so the same code runs against the daemon and against
//! [`MockDocker`](crate::execution::MockDocker). The container is removed on
//! every path once it has been created: success, non-zero exit, failure,
//! timeout and cancellation.

use std::collections::HashMap;
use std::sync::Arc;

use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, WaitContainerOptions,
};
use bollard::image::{CreateImageOptions, ListImagesOptions};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DockerError;
use crate::execution::api::{DockerApi, WaitResult};
use crate::execution::cancel::Cancellation;
use crate::execution::resources::ExecutionLimits;

/// Label set on every container created by the runner.
pub const MANAGED_LABEL: &str = "docker-exec.managed";

/// When to pull the image before creating the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
pub enum PullPolicy {
    /// Always pull, refreshing mutable tags.
    Always,
    /// Pull only when no local image matches the reference.
    #[default]
    #[value(name = "missing")]
    IfMissing,
    /// Never pull; creation fails if the image is absent.
    Never,
}

/// Configuration for one analysis container.
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Container name. A unique one is generated when unset.
    pub name: Option<String>,
    /// Image to run.
    pub image: String,
    /// Command to run in the container.
    pub cmd: Option<Vec<String>>,
    /// Environment variables (`KEY=VALUE`).
    pub env: Vec<String>,
    /// Working directory inside the container.
    pub working_dir: Option<String>,
    /// Volume mounts (host:container format).
    pub volumes: Vec<String>,
    /// User to run as (e.g., "1000:1000").
    pub user: Option<String>,
    /// Network mode (e.g., "none", "bridge", "host").
    pub network_mode: Option<String>,
    /// Resource limits and timeout.
    pub limits: ExecutionLimits,
    /// Image pull behaviour.
    pub pull_policy: PullPolicy,
}

impl RunSpec {
    /// Creates a spec for `image` with default limits and no network.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            name: None,
            image: image.into(),
            cmd: None,
            env: Vec::new(),
            working_dir: None,
            volumes: Vec::new(),
            user: None,
            network_mode: Some("none".to_string()),
            limits: ExecutionLimits::default(),
            pull_policy: PullPolicy::default(),
        }
    }

    /// Sets the container name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the command to run in the container.
    pub fn with_cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = Some(cmd);
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.env
            .push(format!("{}={}", key.as_ref(), value.as_ref()));
        self
    }

    /// Sets the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds a volume mount.
    pub fn with_volume(mut self, volume: impl Into<String>) -> Self {
        self.volumes.push(volume.into());
        self
    }

    /// Sets the user to run as.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Sets the network mode.
    pub fn with_network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = Some(mode.into());
        self
    }

    /// Sets explicit resource limits.
    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the pull policy.
    pub fn with_pull_policy(mut self, policy: PullPolicy) -> Self {
        self.pull_policy = policy;
        self
    }

    /// Builds the daemon-side container configuration.
    pub fn container_config(&self) -> Config<String> {
        let mut host_config = self.limits.host_config();
        host_config.network_mode = self.network_mode.clone();
        if !self.volumes.is_empty() {
            host_config.binds = Some(self.volumes.clone());
        }

        Config {
            image: Some(self.image.clone()),
            cmd: self.cmd.clone(),
            env: if self.env.is_empty() {
                None
            } else {
                Some(self.env.clone())
            },
            working_dir: self.working_dir.clone(),
            user: self.user.clone(),
            labels: Some(HashMap::from([(
                MANAGED_LABEL.to_string(),
                "true".to_string(),
            )])),
            host_config: Some(host_config),
            tty: Some(false),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        }
    }
}

/// Outcome of a container that ran to completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutput {
    /// Id of the (now removed) container.
    pub container_id: String,
    /// Image the container ran.
    pub image: String,
    /// Exit code of the container's main process.
    pub exit_code: i64,
    /// Error the daemon attached to the wait result, if any.
    pub error: Option<String>,
    /// Combined stdout and stderr.
    pub logs: String,
    /// When the container was started.
    pub started_at: DateTime<Utc>,
    /// When the wait and log collection finished.
    pub finished_at: DateTime<Utc>,
}

impl RunOutput {
    /// Returns true for a zero exit code without a wait error.
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }
}

/// Appends `:latest` to references that carry neither a tag nor a digest.
///
/// The daemon pulls every tag of a repository when none is given.
pub fn normalize_reference(image: &str) -> String {
    let image = image.trim();
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    if image.contains('@') || last_segment.contains(':') {
        image.to_string()
    } else {
        format!("{image}:latest")
    }
}

/// Runs analysis containers through a [`DockerApi`].
#[derive(Clone)]
pub struct ContainerRunner {
    api: Arc<dyn DockerApi>,
}

impl ContainerRunner {
    pub fn new(api: Arc<dyn DockerApi>) -> Self {
        Self { api }
    }

    /// Makes `image` available locally according to `policy`.
    ///
    /// Returns true if a pull was performed.
    pub async fn ensure_image(
        &self,
        image: &str,
        policy: PullPolicy,
        cancel: &Cancellation,
    ) -> Result<bool, DockerError> {
        let reference = normalize_reference(image);
        match policy {
            PullPolicy::Never => return Ok(false),
            PullPolicy::IfMissing => {
                let options = ListImagesOptions {
                    filters: HashMap::from([("reference".to_string(), vec![reference.clone()])]),
                    ..Default::default()
                };
                if !self.api.image_list(options).await?.is_empty() {
                    debug!(image = %reference, "Image present locally");
                    return Ok(false);
                }
            }
            PullPolicy::Always => {}
        }

        info!(image = %reference, "Pulling image");
        let progress = self
            .api
            .image_pull(CreateImageOptions {
                from_image: reference,
                ..Default::default()
            })
            .await?;
        progress.drain(cancel).await?;
        Ok(true)
    }

    /// Runs `spec` to completion and removes the container.
    ///
    /// A non-zero exit is reported in [`RunOutput::exit_code`], not as an error.
    pub async fn run(&self, spec: &RunSpec, cancel: &Cancellation) -> Result<RunOutput, DockerError> {
        if spec.image.trim().is_empty() {
            return Err(DockerError::InvalidConfig(
                "image reference must not be empty".to_string(),
            ));
        }
        if cancel.is_cancelled() {
            return Err(DockerError::Cancelled);
        }

        self.ensure_image(&spec.image, spec.pull_policy, cancel)
            .await?;

        let name = spec
            .name
            .clone()
            .unwrap_or_else(|| format!("docker-exec-{}", Uuid::new_v4().simple()));
        let created = self
            .api
            .container_create(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                spec.container_config(),
            )
            .await?;
        let id = created.id;
        info!(container = %id, name = %name, image = %spec.image, "Created analysis container");

        let started_at = Utc::now();
        let outcome = self.execute(&id, spec, cancel).await;
        let finished_at = Utc::now();
        let removal = self.remove(&id).await;

        match (outcome, removal) {
            (Ok((wait, logs)), Ok(())) => {
                info!(container = %id, exit_code = wait.status_code, "Analysis container finished");
                Ok(RunOutput {
                    container_id: id,
                    image: spec.image.clone(),
                    exit_code: wait.status_code,
                    error: wait.error,
                    logs: String::from_utf8_lossy(&logs).into_owned(),
                    started_at,
                    finished_at,
                })
            }
            (Ok(_), Err(cleanup)) => Err(cleanup),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(cleanup)) => {
                warn!(container = %id, error = %cleanup, "Failed to remove container after failed run");
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        id: &str,
        spec: &RunSpec,
        cancel: &Cancellation,
    ) -> Result<(WaitResult, Vec<u8>), DockerError> {
        self.api.container_start(id, None).await?;

        // Waiting begins before logs are attached so the exit is never missed.
        let wait = self.api.container_wait(
            id,
            Some(WaitContainerOptions {
                condition: "not-running".to_string(),
            }),
        );
        let logs = self
            .api
            .container_logs(
                id,
                LogsOptions {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                },
            )
            .await?;

        let seconds = spec.limits.timeout_seconds;
        // The first failure ends both: a followed log stream outlives a failed wait.
        let both = async { tokio::try_join!(wait.result(cancel), logs.read_to_end(cancel)) };
        tokio::time::timeout(spec.limits.timeout(), both)
            .await
            .map_err(|_| {
                warn!(container = %id, seconds, "Analysis container timed out");
                DockerError::Timeout { seconds }
            })?
    }

    async fn remove(&self, id: &str) -> Result<(), DockerError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.api.container_remove(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(DockerError::ContainerNotFound { .. }) => {
                debug!(container = %id, "Container already removed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
