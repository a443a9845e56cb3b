//! The container execution interface.
//!
//! [`DockerApi`] is the capability surface orchestration code depends on.
//! It is implemented by [`DockerClient`](crate::execution::DockerClient)
//! against a live daemon and by [`MockDocker`](crate::execution::MockDocker)
//! for tests. Option structs and models are bollard's own types and are
//! forwarded to the daemon verbatim.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::{ContainerCreateResponse, ContainerSummary, ImageSummary};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::DockerError;
use crate::execution::cancel::Cancellation;

/// Daemon identity and health as reported by `ping`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingInfo {
    /// Raw ping reply, normally `OK`.
    pub status: String,
    /// Engine version, if reported.
    pub version: Option<String>,
    /// API version negotiated by the daemon, if reported.
    pub api_version: Option<String>,
    /// Daemon operating system, if reported.
    pub os: Option<String>,
}

/// Exit status delivered when a container stops running.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitResult {
    /// Process exit code.
    pub status_code: i64,
    /// Error reported by the daemon while waiting, if any.
    pub error: Option<String>,
}

impl WaitResult {
    /// A result for a container that exited with `status_code` and no wait error.
    pub fn exited(status_code: i64) -> Self {
        Self {
            status_code,
            error: None,
        }
    }

    /// Returns true for a zero exit code without a wait error.
    pub fn success(&self) -> bool {
        self.status_code == 0 && self.error.is_none()
    }
}

type WaitFuture = Pin<Box<dyn Future<Output = Result<WaitResult, DockerError>> + Send>>;

/// Single-consumer completion handle returned by [`DockerApi::container_wait`].
///
/// The wait request is already in flight when the handle is returned; the
/// caller blocks only when it consumes the result. Dropping the handle
/// abandons the wait and aborts any background request.
pub struct WaitHandle {
    delivery: WaitFuture,
    task: Option<JoinHandle<()>>,
}

impl WaitHandle {
    /// A handle whose result is already known.
    pub fn ready(result: Result<WaitResult, DockerError>) -> Self {
        Self {
            delivery: Box::pin(futures::future::ready(result)),
            task: None,
        }
    }

    /// A handle that never completes on its own.
    pub fn pending() -> Self {
        Self {
            delivery: Box::pin(futures::future::pending()),
            task: None,
        }
    }

    /// A handle fed by a background task through a oneshot channel.
    pub(crate) fn from_task(
        rx: oneshot::Receiver<Result<WaitResult, DockerError>>,
        task: JoinHandle<()>,
    ) -> Self {
        let delivery = async move {
            rx.await.unwrap_or_else(|_| {
                Err(DockerError::Stream(
                    "wait task ended without delivering a result".to_string(),
                ))
            })
        };
        Self {
            delivery: Box::pin(delivery),
            task: Some(task),
        }
    }

    /// Waits for the result, or returns [`DockerError::Cancelled`] if `cancel` fires first.
    pub async fn result(mut self, cancel: &Cancellation) -> Result<WaitResult, DockerError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DockerError::Cancelled),
            result = &mut self.delivery => result,
        }
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl fmt::Debug for WaitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitHandle")
            .field("background", &self.task.is_some())
            .finish_non_exhaustive()
    }
}

type ChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, DockerError>> + Send>>;

/// A readable-once stream of byte chunks (container logs, pull progress).
///
/// Dropping the stream releases the underlying daemon connection.
pub struct ByteStream {
    inner: ChunkStream,
}

impl ByteStream {
    /// Wraps any chunk stream.
    pub fn new(stream: impl Stream<Item = Result<Vec<u8>, DockerError>> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(stream),
        }
    }

    /// A stream yielding `bytes` as a single chunk.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Self::new(futures::stream::empty());
        }
        Self::new(futures::stream::iter([Ok(bytes)]))
    }

    /// Reads the next chunk. Returns `None` once the stream is exhausted and
    /// `Some(Err(Cancelled))` if `cancel` fires first.
    pub async fn next_chunk(
        &mut self,
        cancel: &Cancellation,
    ) -> Option<Result<Vec<u8>, DockerError>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Some(Err(DockerError::Cancelled)),
            chunk = self.inner.next() => chunk,
        }
    }

    /// Reads the whole stream into memory.
    pub async fn read_to_end(mut self, cancel: &Cancellation) -> Result<Vec<u8>, DockerError> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.next_chunk(cancel).await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf)
    }

    /// Consumes the stream, discarding its contents but not its errors.
    pub async fn drain(mut self, cancel: &Cancellation) -> Result<(), DockerError> {
        while let Some(chunk) = self.next_chunk(cancel).await {
            chunk?;
        }
        Ok(())
    }
}

impl Stream for ByteStream {
    type Item = Result<Vec<u8>, DockerError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStream").finish_non_exhaustive()
    }
}

/// Capability surface over a container daemon.
///
/// Callers issue create → start → wait/logs → remove for a handle in that
/// order; implementations do not enforce it.
#[async_trait]
pub trait DockerApi: Send + Sync {
    /// Checks the daemon responds and reports its identity.
    async fn ping(&self) -> Result<PingInfo, DockerError>;

    /// Lists local images. An empty list is a valid result.
    async fn image_list(
        &self,
        options: ListImagesOptions<String>,
    ) -> Result<Vec<ImageSummary>, DockerError>;

    /// Starts pulling `options.from_image` and returns its progress stream.
    ///
    /// The caller must drain the stream: pull failures may arrive as the
    /// final chunk after partial progress output.
    async fn image_pull(&self, options: CreateImageOptions<'static, String>)
        -> Result<ByteStream, DockerError>;

    /// Creates a container. On failure nothing is left behind to remove.
    async fn container_create(
        &self,
        options: Option<CreateContainerOptions<String>>,
        config: Config<String>,
    ) -> Result<ContainerCreateResponse, DockerError>;

    /// Starts a created container.
    async fn container_start(
        &self,
        id: &str,
        options: Option<StartContainerOptions<String>>,
    ) -> Result<(), DockerError>;

    /// Begins waiting for a container and returns immediately.
    ///
    /// Every failure, including an unknown container, is delivered through
    /// the returned handle. Live implementations drive the request on the
    /// current Tokio runtime; called outside one, the handle delivers an error.
    fn container_wait(&self, id: &str, options: Option<WaitContainerOptions<String>>)
        -> WaitHandle;

    /// Opens the container's log stream. With `follow` set the stream stays
    /// open until the container stops or the stream is dropped.
    async fn container_logs(
        &self,
        id: &str,
        options: LogsOptions<String>,
    ) -> Result<ByteStream, DockerError>;

    /// Removes a container. Running containers require `force`.
    async fn container_remove(
        &self,
        id: &str,
        options: Option<RemoveContainerOptions>,
    ) -> Result<(), DockerError>;

    /// Lists containers. An empty list is a valid result.
    async fn container_list(
        &self,
        options: Option<ListContainersOptions<String>>,
    ) -> Result<Vec<ContainerSummary>, DockerError>;
}
