//! Docker API wrapper using the bollard crate.
//!
//! [`DockerClient`] is the live implementation of [`DockerApi`]. It forwards
//! every call to the daemon behind a [`DaemonConnector`] and translates
//! bollard errors into [`DockerError`].

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::{ContainerCreateResponse, ContainerSummary, ContainerWaitResponse, ImageSummary};
use bollard::Docker;
use futures::StreamExt;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::DockerError;
use crate::execution::api::{ByteStream, DockerApi, PingInfo, WaitHandle, WaitResult};
use crate::execution::connector::{DaemonConfig, DaemonConnector};

/// What a request was about, so a 404 maps to the right not-found kind.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Subject<'a> {
    Daemon,
    Image(&'a str),
    Container(&'a str),
}

/// Translates a bollard error into the execution error taxonomy.
pub(crate) fn classify(err: BollardError, subject: Subject<'_>) -> DockerError {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => match (status_code, subject) {
            (404, Subject::Container(id)) => DockerError::ContainerNotFound { id: id.to_string() },
            (404, Subject::Image(image)) => DockerError::ImageNotFound {
                image: image.to_string(),
            },
            (400, _) => DockerError::InvalidConfig(message),
            (409, _) => DockerError::Conflict(message),
            (status, _) => DockerError::Daemon { status, message },
        },
        // Refused connections and missing sockets surface from the legacy
        // hyper client, not as IO errors.
        transport @ (BollardError::HyperLegacyError { .. }
        | BollardError::HyperResponseError { .. }
        | BollardError::HttpClientError { .. }
        | BollardError::IOError { .. }
        | BollardError::RequestTimeoutError) => {
            DockerError::DaemonUnreachable(transport.to_string())
        }
        other => DockerError::Stream(other.to_string()),
    }
}

/// Converts the wait stream's first item into a wait result.
///
/// bollard reports a non-zero exit as `DockerContainerWaitError`; that is
/// still a completed wait, not a failure of the wait itself.
fn wait_outcome(
    item: Option<Result<ContainerWaitResponse, BollardError>>,
    id: &str,
) -> Result<WaitResult, DockerError> {
    match item {
        Some(Ok(response)) => Ok(WaitResult {
            status_code: response.status_code,
            error: response.error.and_then(|e| e.message).filter(|m| !m.is_empty()),
        }),
        Some(Err(BollardError::DockerContainerWaitError { error, code })) => Ok(WaitResult {
            status_code: code,
            error: Some(error).filter(|m| !m.is_empty()),
        }),
        Some(Err(e)) => Err(classify(e, Subject::Container(id))),
        None => Err(DockerError::Stream(format!(
            "wait stream for container '{id}' ended without a status"
        ))),
    }
}

/// Docker client wrapper for container operations.
#[derive(Debug)]
pub struct DockerClient {
    connector: DaemonConnector,
}

impl DockerClient {
    /// Creates a client for the given daemon configuration.
    ///
    /// Never fails: an unreachable daemon is reported by the first operation.
    pub fn new(config: DaemonConfig) -> Self {
        Self::from_connector(DaemonConnector::connect(config))
    }

    /// Creates a client using `DOCKER_HOST` or the platform default endpoint.
    pub fn from_env() -> Self {
        Self::new(DaemonConfig::from_env())
    }

    /// Creates a client around an existing connector.
    pub fn from_connector(connector: DaemonConnector) -> Self {
        Self { connector }
    }

    /// The endpoint the client was built for.
    pub fn resolved_endpoint(&self) -> &str {
        self.connector.resolved_endpoint()
    }

    fn docker(&self) -> Result<&Docker, DockerError> {
        self.connector.docker()
    }
}

#[async_trait]
impl DockerApi for DockerClient {
    async fn ping(&self) -> Result<PingInfo, DockerError> {
        let docker = self.docker()?;
        let status = docker
            .ping()
            .await
            .map_err(|e| classify(e, Subject::Daemon))?;
        let version = docker
            .version()
            .await
            .map_err(|e| classify(e, Subject::Daemon))?;

        Ok(PingInfo {
            status,
            version: version.version,
            api_version: version.api_version,
            os: version.os,
        })
    }

    async fn image_list(
        &self,
        options: ListImagesOptions<String>,
    ) -> Result<Vec<ImageSummary>, DockerError> {
        self.docker()?
            .list_images(Some(options))
            .await
            .map_err(|e| classify(e, Subject::Daemon))
    }

    async fn image_pull(
        &self,
        options: CreateImageOptions<'static, String>,
    ) -> Result<ByteStream, DockerError> {
        if options.from_image.trim().is_empty() {
            return Err(DockerError::InvalidConfig(
                "image reference must not be empty".to_string(),
            ));
        }
        let docker = self.docker()?;
        let image = options.from_image.clone();
        debug!(image = %image, "Pulling image");

        let progress = docker.create_image(Some(options), None, None).map(move |item| {
            let info = item.map_err(|e| classify(e, Subject::Image(&image)))?;
            let mut line = serde_json::to_vec(&info)
                .map_err(|e| DockerError::Stream(format!("Failed to encode pull progress: {e}")))?;
            line.push(b'\n');
            Ok(line)
        });

        Ok(ByteStream::new(progress))
    }

    async fn container_create(
        &self,
        options: Option<CreateContainerOptions<String>>,
        config: Config<String>,
    ) -> Result<ContainerCreateResponse, DockerError> {
        let image = match config.image.as_deref().map(str::trim) {
            Some(image) if !image.is_empty() => image.to_string(),
            _ => {
                return Err(DockerError::InvalidConfig(
                    "container config must name an image".to_string(),
                ))
            }
        };

        let response = self
            .docker()?
            .create_container(options, config)
            .await
            .map_err(|e| classify(e, Subject::Image(&image)))?;

        for warning in &response.warnings {
            warn!(container = %response.id, warning = %warning, "Daemon warning on create");
        }
        debug!(container = %response.id, image = %image, "Created container");
        Ok(response)
    }

    async fn container_start(
        &self,
        id: &str,
        options: Option<StartContainerOptions<String>>,
    ) -> Result<(), DockerError> {
        match self.docker()?.start_container(id, options).await {
            Ok(()) => {
                debug!(container = %id, "Started container");
                Ok(())
            }
            // 304: already started. Daemon semantics, not an error.
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container = %id, "Container was already running");
                Ok(())
            }
            Err(e) => Err(classify(e, Subject::Container(id))),
        }
    }

    fn container_wait(
        &self,
        id: &str,
        options: Option<WaitContainerOptions<String>>,
    ) -> WaitHandle {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return WaitHandle::ready(Err(DockerError::Stream(
                "container_wait must be called from within a Tokio runtime".to_string(),
            )));
        };
        let docker = match self.docker() {
            Ok(docker) => docker.clone(),
            Err(e) => return WaitHandle::ready(Err(e)),
        };
        let id = id.to_string();
        let (tx, rx) = oneshot::channel();

        let task = runtime.spawn(async move {
            let mut stream = docker.wait_container(&id, options);
            let outcome = wait_outcome(stream.next().await, &id);
            debug!(container = %id, outcome = ?outcome, "Wait completed");
            // The receiver is gone if the caller dropped the handle.
            let _ = tx.send(outcome);
        });

        WaitHandle::from_task(rx, task)
    }

    async fn container_logs(
        &self,
        id: &str,
        options: LogsOptions<String>,
    ) -> Result<ByteStream, DockerError> {
        let docker = self.docker()?;
        // The log stream only reports a missing container once polled, and a
        // followed stream may never yield; check existence up front.
        docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| classify(e, Subject::Container(id)))?;

        let owned_id = id.to_string();
        let chunks = docker.logs(id, Some(options)).map(move |item| {
            item.map(|output| output.into_bytes().to_vec())
                .map_err(|e| classify(e, Subject::Container(&owned_id)))
        });

        Ok(ByteStream::new(chunks))
    }

    async fn container_remove(
        &self,
        id: &str,
        options: Option<RemoveContainerOptions>,
    ) -> Result<(), DockerError> {
        self.docker()?
            .remove_container(id, options)
            .await
            .map_err(|e| classify(e, Subject::Container(id)))?;
        debug!(container = %id, "Removed container");
        Ok(())
    }

    async fn container_list(
        &self,
        options: Option<ListContainersOptions<String>>,
    ) -> Result<Vec<ContainerSummary>, DockerError> {
        self.docker()?
            .list_containers(options)
            .await
            .map_err(|e| classify(e, Subject::Daemon))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::cancel::Cancellation;

    fn server_error(status_code: u16) -> BollardError {
        BollardError::DockerResponseServerError {
            status_code,
            message: format!("status {status_code}"),
        }
    }

    #[test]
    fn test_classify_not_found_by_subject() {
        assert_eq!(
            classify(server_error(404), Subject::Container("abc")),
            DockerError::ContainerNotFound { id: "abc".to_string() }
        );
        assert_eq!(
            classify(server_error(404), Subject::Image("alpine:3")),
            DockerError::ImageNotFound {
                image: "alpine:3".to_string()
            }
        );
        assert!(matches!(
            classify(server_error(404), Subject::Daemon),
            DockerError::Daemon { status: 404, .. }
        ));
    }

    #[test]
    fn test_classify_bad_request_and_conflict() {
        assert!(matches!(
            classify(server_error(400), Subject::Daemon),
            DockerError::InvalidConfig(_)
        ));
        assert!(matches!(
            classify(server_error(409), Subject::Container("abc")),
            DockerError::Conflict(_)
        ));
        assert!(matches!(
            classify(server_error(500), Subject::Container("abc")),
            DockerError::Daemon { status: 500, .. }
        ));
    }

    #[test]
    fn test_classify_transport_failures_as_unreachable() {
        let err = classify(
            BollardError::IOError {
                err: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            },
            Subject::Daemon,
        );
        assert!(err.is_retryable());

        let err = classify(BollardError::RequestTimeoutError, Subject::Daemon);
        assert!(matches!(err, DockerError::DaemonUnreachable(_)));
    }

    #[test]
    fn test_wait_outcome_treats_non_zero_exit_as_result() {
        let outcome = wait_outcome(
            Some(Err(BollardError::DockerContainerWaitError {
                error: String::new(),
                code: 2,
            })),
            "abc",
        );
        assert_eq!(outcome, Ok(WaitResult::exited(2)));
    }

    #[test]
    fn test_wait_outcome_success_and_missing_container() {
        let ok = wait_outcome(
            Some(Ok(ContainerWaitResponse {
                status_code: 0,
                error: None,
            })),
            "abc",
        );
        assert!(ok.unwrap().success());

        let missing = wait_outcome(Some(Err(server_error(404))), "abc");
        assert_eq!(
            missing,
            Err(DockerError::ContainerNotFound { id: "abc".to_string() })
        );

        let empty = wait_outcome(None, "abc");
        assert!(matches!(empty, Err(DockerError::Stream(_))));
    }

    #[test]
    fn test_client_construction_is_total() {
        let client = DockerClient::new(DaemonConfig::new("ftp://not-a-daemon"));
        assert_eq!(client.resolved_endpoint(), "ftp://not-a-daemon");
    }

    #[tokio::test]
    async fn test_operations_on_unbuildable_client_report_unreachable() {
        let client = DockerClient::new(DaemonConfig::new("ftp://not-a-daemon"));

        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, DockerError::DaemonUnreachable(_)));

        let err = client.container_list(None).await.unwrap_err();
        assert!(matches!(err, DockerError::DaemonUnreachable(_)));

        let wait = client
            .container_wait("abc", None)
            .result(&Cancellation::new())
            .await;
        assert!(matches!(wait, Err(DockerError::DaemonUnreachable(_))));
    }

    #[tokio::test]
    async fn test_refused_connection_reports_unreachable() {
        // Nothing listens on port 1.
        let client = DockerClient::new(DaemonConfig::new("tcp://127.0.0.1:1"));

        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, DockerError::DaemonUnreachable(_)), "got {err:?}");
        assert!(err.is_retryable());

        let err = client
            .image_list(ListImagesOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DockerError::DaemonUnreachable(_)), "got {err:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_socket_reports_unreachable() {
        let client = DockerClient::new(DaemonConfig::new("unix:///nonexistent/docker.sock"));

        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, DockerError::DaemonUnreachable(_)), "got {err:?}");
    }

    #[test]
    fn test_wait_outside_runtime_delivers_error() {
        let client = DockerClient::new(DaemonConfig::new("tcp://127.0.0.1:1"));
        let handle = client.container_wait("abc", None);

        let result = futures::executor::block_on(handle.result(&Cancellation::new()));
        assert!(matches!(result, Err(DockerError::Stream(_))), "got {result:?}");
    }

    #[tokio::test]
    async fn test_empty_references_are_rejected_before_the_daemon() {
        let client = DockerClient::new(DaemonConfig::new("ftp://not-a-daemon"));

        let err = client
            .image_pull(CreateImageOptions {
                from_image: "  ".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DockerError::InvalidConfig(_)));

        let err = client
            .container_create(None, Config::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DockerError::InvalidConfig(_)));
    }
}
