//! CLI command definitions for docker-exec.
//!
//! This is the composition root: the daemon endpoint is resolved here (flag,
//! then `DOCKER_HOST`, then the platform default) and handed to the client
//! as an explicit [`DaemonConfig`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bollard::container::ListContainersOptions;
use bollard::image::{CreateImageOptions, ListImagesOptions};
use clap::Parser;
use tracing::{info, warn};

use crate::error::DockerError;
use crate::execution::connector::DEFAULT_ENDPOINT;
use crate::execution::container::MANAGED_LABEL;
use crate::execution::{
    limits_for_profile, normalize_reference, Cancellation, ContainerRunner, DaemonConfig,
    DockerApi, DockerClient, PullPolicy, RunSpec,
};

/// Run disposable analysis containers against a Docker daemon.
#[derive(Parser, Debug)]
#[command(name = "docker-exec")]
#[command(about = "Run disposable analysis containers against a Docker daemon")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Docker daemon endpoint (unix://, tcp://, http://, https:// or npipe://).
    #[arg(long, env = "DOCKER_HOST", default_value = DEFAULT_ENDPOINT, global = true)]
    pub docker_host: String,

    /// Directory with key.pem, cert.pem and ca.pem for https:// endpoints.
    #[arg(long, env = "DOCKER_CERT_PATH", global = true)]
    pub cert_path: Option<PathBuf>,

    /// Per-request timeout for daemon calls, in seconds.
    #[arg(long, env = "DOCKER_EXEC_TIMEOUT", default_value = "120", global = true)]
    pub timeout: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Check that the daemon responds and print its version.
    Ping,

    /// List local images.
    Images(ImagesArgs),

    /// List containers.
    Ps(PsArgs),

    /// Pull an image and print its progress.
    Pull(PullArgs),

    /// Run a disposable container to completion and print its output.
    Run(RunArgs),
}

/// Arguments for `docker-exec images`.
#[derive(Parser, Debug)]
pub struct ImagesArgs {
    /// Include intermediate images.
    #[arg(short, long)]
    pub all: bool,
}

/// Arguments for `docker-exec ps`.
#[derive(Parser, Debug)]
pub struct PsArgs {
    /// Include stopped containers.
    #[arg(short, long)]
    pub all: bool,

    /// Only containers created by `docker-exec run`.
    #[arg(long)]
    pub managed: bool,
}

/// Arguments for `docker-exec pull`.
#[derive(Parser, Debug)]
pub struct PullArgs {
    /// Image reference; `:latest` is assumed without a tag.
    pub image: String,
}

/// Arguments for `docker-exec run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Image to run.
    pub image: String,

    /// Command and arguments (after `--`).
    #[arg(last = true)]
    pub cmd: Vec<String>,

    /// Environment variables (KEY=VALUE), repeatable.
    #[arg(short, long = "env")]
    pub env: Vec<String>,

    /// Working directory inside the container.
    #[arg(short, long)]
    pub workdir: Option<String>,

    /// Volume mounts (host:container[:ro]), repeatable.
    #[arg(short, long = "volume")]
    pub volumes: Vec<String>,

    /// Network mode.
    #[arg(long, default_value = "none")]
    pub network: String,

    /// User to run as (e.g. 1000:1000).
    #[arg(short, long)]
    pub user: Option<String>,

    /// Container name; generated when omitted.
    #[arg(long)]
    pub name: Option<String>,

    /// Resource profile (light, standard, heavy).
    #[arg(long, default_value = "standard")]
    pub profile: String,

    /// Memory limit in MB, overriding the profile.
    #[arg(long)]
    pub memory_mb: Option<u64>,

    /// CPU cores, overriding the profile.
    #[arg(long)]
    pub cpus: Option<f64>,

    /// Run timeout in seconds, overriding the profile.
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// When to pull the image.
    #[arg(long, value_enum, default_value_t = PullPolicy::IfMissing)]
    pub pull: PullPolicy,

    /// Print the run result as JSON instead of raw logs.
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    /// Builds the run specification from the arguments.
    pub fn to_spec(&self) -> anyhow::Result<RunSpec> {
        let mut limits = limits_for_profile(&self.profile);
        if let Some(memory_mb) = self.memory_mb {
            limits.memory_mb = memory_mb;
        }
        if let Some(cpus) = self.cpus {
            anyhow::ensure!(cpus > 0.0, "--cpus must be positive");
            limits.cpu_cores = cpus;
        }
        if let Some(timeout) = self.timeout_secs {
            limits.timeout_seconds = timeout;
        }

        let mut spec = RunSpec::new(&self.image)
            .with_network_mode(&self.network)
            .with_limits(limits)
            .with_pull_policy(self.pull);
        for pair in &self.env {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("invalid --env '{pair}', expected KEY=VALUE"))?;
            spec = spec.with_env(key, value);
        }
        for volume in &self.volumes {
            spec = spec.with_volume(volume);
        }
        if !self.cmd.is_empty() {
            spec = spec.with_cmd(self.cmd.clone());
        }
        if let Some(dir) = &self.workdir {
            spec = spec.with_working_dir(dir);
        }
        if let Some(user) = &self.user {
            spec = spec.with_user(user);
        }
        if let Some(name) = &self.name {
            spec = spec.with_name(name);
        }
        Ok(spec)
    }
}

impl Cli {
    /// Daemon configuration resolved from flags and environment.
    pub fn daemon_config(&self) -> DaemonConfig {
        let config =
            DaemonConfig::new(&self.docker_host).with_timeout(Duration::from_secs(self.timeout));
        match &self.cert_path {
            Some(dir) => config.with_cert_path(dir),
            None => config,
        }
    }
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<i32> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// Returns the process exit code: the container's exit code for `run`,
/// zero otherwise.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<i32> {
    let client = Arc::new(DockerClient::new(cli.daemon_config()));

    match cli.command {
        Commands::Ping => run_ping(&*client).await?,
        Commands::Images(args) => run_images(&*client, args).await?,
        Commands::Ps(args) => run_ps(&*client, args).await?,
        Commands::Pull(args) => run_pull(&*client, args).await?,
        Commands::Run(args) => return run_container(client, args).await,
    }
    Ok(0)
}

async fn run_ping(client: &DockerClient) -> anyhow::Result<()> {
    let ping = client
        .ping()
        .await
        .with_context(|| format!("Docker daemon at {} did not respond", client.resolved_endpoint()))?;

    println!("endpoint:    {}", client.resolved_endpoint());
    println!("status:      {}", ping.status);
    println!("version:     {}", ping.version.as_deref().unwrap_or("unknown"));
    println!("api version: {}", ping.api_version.as_deref().unwrap_or("unknown"));
    println!("os:          {}", ping.os.as_deref().unwrap_or("unknown"));
    Ok(())
}

async fn run_images(client: &dyn DockerApi, args: ImagesArgs) -> anyhow::Result<()> {
    let images = client
        .image_list(ListImagesOptions {
            all: args.all,
            ..Default::default()
        })
        .await
        .context("Failed to list images")?;

    for image in &images {
        let size_mb = image.size as f64 / (1024.0 * 1024.0);
        if image.repo_tags.is_empty() {
            println!("{:<60} {:>10.1} MB", "<none>", size_mb);
        }
        for tag in &image.repo_tags {
            println!("{:<60} {:>10.1} MB", tag, size_mb);
        }
    }
    info!(count = images.len(), "Listed images");
    Ok(())
}

async fn run_ps(client: &dyn DockerApi, args: PsArgs) -> anyhow::Result<()> {
    let mut filters = HashMap::new();
    if args.managed {
        filters.insert("label".to_string(), vec![format!("{MANAGED_LABEL}=true")]);
    }
    let containers = client
        .container_list(Some(ListContainersOptions {
            all: args.all,
            filters,
            ..Default::default()
        }))
        .await
        .context("Failed to list containers")?;

    for container in &containers {
        let id = container.id.as_deref().unwrap_or_default();
        let short_id = &id[..id.len().min(12)];
        let name = container
            .names
            .as_ref()
            .and_then(|names| names.first())
            .map(|name| name.trim_start_matches('/'))
            .unwrap_or_default();
        println!(
            "{:<12} {:<30} {:<40} {}",
            short_id,
            name,
            container.image.as_deref().unwrap_or_default(),
            container.status.as_deref().unwrap_or_default()
        );
    }
    info!(count = containers.len(), "Listed containers");
    Ok(())
}

async fn run_pull(client: &dyn DockerApi, args: PullArgs) -> anyhow::Result<()> {
    if args.image.trim().is_empty() {
        let err = DockerError::InvalidConfig("image reference must not be empty".to_string());
        return Err(err.into());
    }
    let reference = normalize_reference(&args.image);
    let cancel = cancel_on_ctrl_c();
    let mut progress = client
        .image_pull(CreateImageOptions {
            from_image: reference.clone(),
            ..Default::default()
        })
        .await
        .with_context(|| format!("Failed to pull {reference}"))?;

    while let Some(chunk) = progress.next_chunk(&cancel).await {
        let chunk = chunk.with_context(|| format!("Failed to pull {reference}"))?;
        for line in String::from_utf8_lossy(&chunk).lines() {
            println!("{}", describe_progress(line));
        }
    }
    Ok(())
}

/// Renders one JSON progress line as `id: status progress`.
fn describe_progress(line: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        return line.to_string();
    };
    let field = |name: &str| value.get(name).and_then(|v| v.as_str()).unwrap_or_default();
    let mut out = String::new();
    if !field("id").is_empty() {
        out.push_str(field("id"));
        out.push_str(": ");
    }
    out.push_str(field("status"));
    if !field("progress").is_empty() {
        out.push(' ');
        out.push_str(field("progress"));
    }
    out
}

async fn run_container(client: Arc<DockerClient>, args: RunArgs) -> anyhow::Result<i32> {
    let spec = args.to_spec()?;
    let runner = ContainerRunner::new(client);
    let cancel = cancel_on_ctrl_c();

    let output = runner
        .run(&spec, &cancel)
        .await
        .with_context(|| format!("Failed to run {}", spec.image))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print!("{}", output.logs);
    }
    if let Some(error) = &output.error {
        warn!(container = %output.container_id, error = %error, "Container reported an error");
    }
    Ok(i32::try_from(output.exit_code).unwrap_or(1))
}

/// A cancellation signal fired by Ctrl-C.
fn cancel_on_ctrl_c() -> Cancellation {
    let cancel = Cancellation::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            trigger.cancel();
        }
    });
    cancel
}
