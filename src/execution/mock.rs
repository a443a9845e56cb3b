//! Expectation-based test double for [`DockerApi`].
//!
//! Program each operation before exercising the code under test:
//!
//! ```ignore
//! use docker_exec::execution::mock::{op, MockDocker};
//!
//! let mock = MockDocker::new();
//! mock.on::<op::ContainerCreate>().returns(Ok(ContainerCreateResponse::default()));
//! mock.on::<op::ContainerLogs>().returns(Ok("some text".into()));
//! ```
//!
//! Resolution per operation: values registered with
//! [`returns_once`](Expectation::returns_once) are replayed first, in
//! registration order, each exactly once. After that the value registered with
//! [`returns`](Expectation::returns) repeats for every further call. Only one
//! repeating value may be registered per operation.
//!
//! Calling an operation with nothing left to replay panics. That is a setup
//! mistake in the test, never one of the [`DockerError`] kinds a test may
//! program on purpose.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::{CreateImageOptions, ListImagesOptions};
use bollard::models::{ContainerCreateResponse, ContainerSummary, ImageSummary};
use futures::StreamExt;

use crate::error::DockerError;
use crate::execution::api::{ByteStream, DockerApi, PingInfo, WaitHandle, WaitResult};

/// Programmed content of a pull or log stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptedStream {
    chunks: Vec<Vec<u8>>,
    error: Option<DockerError>,
    stay_open: bool,
}

impl ScriptedStream {
    /// An empty stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk.
    pub fn chunk(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.chunks.push(bytes.into());
        self
    }

    /// Ends the stream with `err` after the chunks.
    pub fn then_fail(mut self, err: DockerError) -> Self {
        self.error = Some(err);
        self
    }

    /// Keeps the stream open after the chunks, like a followed log of a
    /// container that never stops.
    pub fn then_stay_open(mut self) -> Self {
        self.stay_open = true;
        self
    }

    fn into_byte_stream(self) -> ByteStream {
        let items = self
            .chunks
            .into_iter()
            .map(Ok)
            .chain(self.error.into_iter().map(Err));
        let stream = futures::stream::iter(items);
        if self.stay_open {
            ByteStream::new(stream.chain(futures::stream::pending()))
        } else {
            ByteStream::new(stream)
        }
    }
}

impl From<&str> for ScriptedStream {
    fn from(text: &str) -> Self {
        Self::new().chunk(text)
    }
}

impl From<String> for ScriptedStream {
    fn from(text: String) -> Self {
        Self::new().chunk(text)
    }
}

impl From<Vec<u8>> for ScriptedStream {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new().chunk(bytes)
    }
}

impl From<&[u8]> for ScriptedStream {
    fn from(bytes: &[u8]) -> Self {
        Self::new().chunk(bytes)
    }
}

/// Programmed delivery for `container_wait`.
///
/// The call itself always hands back a [`WaitHandle`]; this controls what the
/// handle delivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitDelivery {
    /// Deliver this result or error when the handle is consumed.
    Ready(Result<WaitResult, DockerError>),
    /// Never deliver; only cancellation ends the wait.
    Pending,
}

impl WaitDelivery {
    /// Deliver a wait result with the given exit code.
    pub fn exited(status_code: i64) -> Self {
        WaitDelivery::Ready(Ok(WaitResult::exited(status_code)))
    }

    /// Deliver `err` on the error arm.
    pub fn failed(err: DockerError) -> Self {
        WaitDelivery::Ready(Err(err))
    }
}

impl From<WaitResult> for WaitDelivery {
    fn from(result: WaitResult) -> Self {
        WaitDelivery::Ready(Ok(result))
    }
}

impl From<DockerError> for WaitDelivery {
    fn from(err: DockerError) -> Self {
        WaitDelivery::Ready(Err(err))
    }
}

mod sealed {
    use super::*;

    pub trait Sealed {}

    /// Typed storage for one programmed value.
    #[derive(Clone)]
    pub enum Slot {
        Ping(Result<PingInfo, DockerError>),
        ImageList(Result<Vec<ImageSummary>, DockerError>),
        ImagePull(Result<ScriptedStream, DockerError>),
        ContainerCreate(Result<ContainerCreateResponse, DockerError>),
        ContainerStart(Result<(), DockerError>),
        ContainerWait(WaitDelivery),
        ContainerLogs(Result<ScriptedStream, DockerError>),
        ContainerRemove(Result<(), DockerError>),
        ContainerList(Result<Vec<ContainerSummary>, DockerError>),
    }
}

use sealed::Slot;

/// An operation of [`DockerApi`] that can be programmed on [`MockDocker`].
///
/// Implemented only by the markers in [`op`].
pub trait Operation: sealed::Sealed {
    /// Which operation this marker stands for.
    const KIND: OperationKind;
    /// The value a test programs for this operation.
    type Output: Clone + Send + 'static;

    #[doc(hidden)]
    fn into_slot(output: Self::Output) -> Slot;
    #[doc(hidden)]
    fn from_slot(slot: Slot) -> Option<Self::Output>;
}

macro_rules! operations {
    ($($(#[$doc:meta])* $name:ident => $output:ty;)*) => {
        /// Identity of a [`DockerApi`] operation.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum OperationKind {
            $($name,)*
        }

        impl OperationKind {
            /// The operation's name.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(OperationKind::$name => stringify!($name),)*
                }
            }
        }

        /// Markers selecting the operation to program with [`MockDocker::on`].
        pub mod op {
            $(
                $(#[$doc])*
                #[derive(Debug, Clone, Copy)]
                pub struct $name;
            )*
        }

        $(
            impl sealed::Sealed for op::$name {}

            impl Operation for op::$name {
                const KIND: OperationKind = OperationKind::$name;
                type Output = $output;

                fn into_slot(output: Self::Output) -> Slot {
                    Slot::$name(output)
                }

                fn from_slot(slot: Slot) -> Option<Self::Output> {
                    match slot {
                        Slot::$name(output) => Some(output),
                        _ => None,
                    }
                }
            }
        )*
    };
}

operations! {
    /// `ping`
    Ping => Result<PingInfo, DockerError>;
    /// `image_list`
    ImageList => Result<Vec<ImageSummary>, DockerError>;
    /// `image_pull`; the stream content is replayed fresh on every call.
    ImagePull => Result<ScriptedStream, DockerError>;
    /// `container_create`
    ContainerCreate => Result<ContainerCreateResponse, DockerError>;
    /// `container_start`
    ContainerStart => Result<(), DockerError>;
    /// `container_wait`; programs what the returned handle delivers.
    ContainerWait => WaitDelivery;
    /// `container_logs`; the stream content is replayed fresh on every call.
    ContainerLogs => Result<ScriptedStream, DockerError>;
    /// `container_remove`
    ContainerRemove => Result<(), DockerError>;
    /// `container_list`
    ContainerList => Result<Vec<ContainerSummary>, DockerError>;
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded invocation on the double.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub operation: OperationKind,
    /// Container id, container name or image reference the call targeted.
    pub target: Option<String>,
}

#[derive(Default)]
struct Programmed {
    queued: VecDeque<Slot>,
    repeating: Option<Slot>,
}

#[derive(Default)]
struct MockState {
    programmed: HashMap<OperationKind, Programmed>,
    calls: Vec<MockCall>,
}

/// Expectation-based [`DockerApi`] implementation for tests.
#[derive(Default)]
pub struct MockDocker {
    state: Mutex<MockState>,
}

/// Builder returned by [`MockDocker::on`].
#[must_use = "an expectation is only registered by `returns` or `returns_once`"]
pub struct Expectation<'a, Op: Operation> {
    mock: &'a MockDocker,
    _op: PhantomData<Op>,
}

impl<'a, Op: Operation> Expectation<'a, Op> {
    /// Replays `output` for every call once queued values are used up.
    ///
    /// # Panics
    ///
    /// If the operation already has a repeating value.
    pub fn returns(self, output: Op::Output) -> &'a MockDocker {
        let mut state = self.mock.lock();
        let programmed = state.programmed.entry(Op::KIND).or_default();
        let duplicate = programmed.repeating.is_some();
        if !duplicate {
            programmed.repeating = Some(Op::into_slot(output));
        }
        drop(state);

        if duplicate {
            panic!(
                "MockDocker: {} already has a repeating expectation; queue extra values with returns_once",
                Op::KIND
            );
        }
        self.mock
    }

    /// Replays `output` for exactly one call, after earlier queued values.
    pub fn returns_once(self, output: Op::Output) -> &'a MockDocker {
        self.mock
            .lock()
            .programmed
            .entry(Op::KIND)
            .or_default()
            .queued
            .push_back(Op::into_slot(output));
        self.mock
    }
}

impl MockDocker {
    /// Creates a double with no expectations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts programming the operation `Op`.
    pub fn on<Op: Operation>(&self) -> Expectation<'_, Op> {
        Expectation {
            mock: self,
            _op: PhantomData,
        }
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    /// Number of calls made to `operation`.
    pub fn call_count(&self, operation: OperationKind) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.operation == operation)
            .count()
    }

    /// Operations called so far, in order.
    pub fn operations(&self) -> Vec<OperationKind> {
        self.lock().calls.iter().map(|call| call.operation).collect()
    }

    /// Panics if any value registered with `returns_once` was never consumed.
    pub fn assert_expectations_met(&self) {
        let state = self.lock();
        let mut pending: Vec<String> = state
            .programmed
            .iter()
            .filter(|(_, programmed)| !programmed.queued.is_empty())
            .map(|(kind, programmed)| format!("{kind} ({} left)", programmed.queued.len()))
            .collect();
        drop(state);

        if !pending.is_empty() {
            pending.sort();
            panic!(
                "MockDocker: unconsumed expectations: {}",
                pending.join(", ")
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn respond<Op: Operation>(&self, target: Option<&str>) -> Op::Output {
        let slot = {
            let mut state = self.lock();
            state.calls.push(MockCall {
                operation: Op::KIND,
                target: target.map(str::to_string),
            });
            state.programmed.get_mut(&Op::KIND).and_then(|programmed| {
                programmed
                    .queued
                    .pop_front()
                    .or_else(|| programmed.repeating.clone())
            })
        };

        let Some(slot) = slot else {
            panic!(
                "MockDocker: unexpected call to {} (target: {}); register it with on::<op::{}>()",
                Op::KIND,
                target.unwrap_or("-"),
                Op::KIND
            );
        };
        match Op::from_slot(slot) {
            Some(output) => output,
            None => unreachable!("slot stored under {} holds another operation", Op::KIND),
        }
    }
}

impl fmt::Debug for MockDocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockDocker")
            .field("calls", &self.lock().calls.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DockerApi for MockDocker {
    async fn ping(&self) -> Result<PingInfo, DockerError> {
        self.respond::<op::Ping>(None)
    }

    async fn image_list(
        &self,
        _options: ListImagesOptions<String>,
    ) -> Result<Vec<ImageSummary>, DockerError> {
        self.respond::<op::ImageList>(None)
    }

    async fn image_pull(
        &self,
        options: CreateImageOptions<'static, String>,
    ) -> Result<ByteStream, DockerError> {
        self.respond::<op::ImagePull>(Some(&options.from_image))
            .map(ScriptedStream::into_byte_stream)
    }

    async fn container_create(
        &self,
        options: Option<CreateContainerOptions<String>>,
        config: Config<String>,
    ) -> Result<ContainerCreateResponse, DockerError> {
        let target = options.map(|o| o.name).or(config.image);
        self.respond::<op::ContainerCreate>(target.as_deref())
    }

    async fn container_start(
        &self,
        id: &str,
        _options: Option<StartContainerOptions<String>>,
    ) -> Result<(), DockerError> {
        self.respond::<op::ContainerStart>(Some(id))
    }

    fn container_wait(
        &self,
        id: &str,
        _options: Option<WaitContainerOptions<String>>,
    ) -> WaitHandle {
        match self.respond::<op::ContainerWait>(Some(id)) {
            WaitDelivery::Ready(result) => WaitHandle::ready(result),
            WaitDelivery::Pending => WaitHandle::pending(),
        }
    }

    async fn container_logs(
        &self,
        id: &str,
        _options: LogsOptions<String>,
    ) -> Result<ByteStream, DockerError> {
        self.respond::<op::ContainerLogs>(Some(id))
            .map(ScriptedStream::into_byte_stream)
    }

    async fn container_remove(
        &self,
        id: &str,
        _options: Option<RemoveContainerOptions>,
    ) -> Result<(), DockerError> {
        self.respond::<op::ContainerRemove>(Some(id))
    }

    async fn container_list(
        &self,
        _options: Option<ListContainersOptions<String>>,
    ) -> Result<Vec<ContainerSummary>, DockerError> {
        self.respond::<op::ContainerList>(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::cancel::Cancellation;

    #[tokio::test]
    async fn test_queued_values_replay_before_repeating_value() {
        let mock = MockDocker::new();
        mock.on::<op::ContainerStart>().returns(Ok(()));
        mock.on::<op::ContainerStart>()
            .returns_once(Err(DockerError::ContainerNotFound { id: "a".to_string() }));

        assert!(mock.container_start("a", None).await.is_err());
        assert!(mock.container_start("a", None).await.is_ok());
        assert!(mock.container_start("a", None).await.is_ok());
        assert_eq!(mock.call_count(OperationKind::ContainerStart), 3);
    }

    #[tokio::test]
    async fn test_queued_values_are_fifo() {
        let mock = MockDocker::new();
        mock.on::<op::ContainerCreate>()
            .returns_once(Ok(ContainerCreateResponse {
                id: "first".to_string(),
                warnings: vec![],
            }));
        mock.on::<op::ContainerCreate>()
            .returns_once(Ok(ContainerCreateResponse {
                id: "second".to_string(),
                warnings: vec![],
            }));

        let first = mock.container_create(None, Config::default()).await.unwrap();
        let second = mock.container_create(None, Config::default()).await.unwrap();
        assert_eq!(first.id, "first");
        assert_eq!(second.id, "second");
        mock.assert_expectations_met();
    }

    #[tokio::test]
    #[should_panic(expected = "unexpected call to ContainerStart")]
    async fn test_exhausted_queue_without_repeating_value_panics() {
        let mock = MockDocker::new();
        mock.on::<op::ContainerStart>().returns_once(Ok(()));
        mock.container_start("a", None).await.unwrap();
        let _ = mock.container_start("a", None).await;
    }

    #[test]
    #[should_panic(expected = "already has a repeating expectation")]
    fn test_second_repeating_value_panics() {
        let mock = MockDocker::new();
        mock.on::<op::ContainerRemove>().returns(Ok(()));
        mock.on::<op::ContainerRemove>().returns(Ok(()));
    }

    #[test]
    #[should_panic(expected = "unconsumed expectations: ImageList (1 left)")]
    fn test_assert_expectations_met_reports_leftovers() {
        let mock = MockDocker::new();
        mock.on::<op::ImageList>().returns_once(Ok(vec![]));
        mock.assert_expectations_met();
    }

    #[test]
    fn test_unexpected_wait_panics_with_operation_name() {
        let mock = MockDocker::new();
        let panic = std::panic::catch_unwind(|| {
            let _ = mock.container_wait("abc", None);
        })
        .unwrap_err();
        let message = panic
            .downcast_ref::<String>()
            .cloned()
            .unwrap_or_default();
        assert!(message.contains("unexpected call to ContainerWait"));
        assert!(message.contains("abc"));
    }

    #[tokio::test]
    async fn test_calls_record_targets() {
        let mock = MockDocker::new();
        mock.on::<op::ContainerCreate>()
            .returns(Ok(ContainerCreateResponse::default()));
        mock.on::<op::ContainerRemove>().returns(Ok(()));

        let options = CreateContainerOptions {
            name: "scan-1".to_string(),
            platform: None,
        };
        mock.container_create(Some(options), Config::default())
            .await
            .unwrap();
        mock.container_remove("abc", None).await.unwrap();

        assert_eq!(
            mock.calls(),
            vec![
                MockCall {
                    operation: OperationKind::ContainerCreate,
                    target: Some("scan-1".to_string()),
                },
                MockCall {
                    operation: OperationKind::ContainerRemove,
                    target: Some("abc".to_string()),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_scripted_stream_replays_fresh_on_each_call() {
        let mock = MockDocker::new();
        mock.on::<op::ContainerLogs>()
            .returns(Ok(ScriptedStream::new().chunk("line 1\n").chunk("line 2\n")));
        let cancel = Cancellation::new();

        for _ in 0..2 {
            let logs = mock
                .container_logs("abc", LogsOptions::default())
                .await
                .unwrap();
            assert_eq!(logs.read_to_end(&cancel).await.unwrap(), b"line 1\nline 2\n");
        }
    }

    #[tokio::test]
    async fn test_scripted_pull_failure_after_partial_output() {
        let mock = MockDocker::new();
        mock.on::<op::ImagePull>().returns(Ok(ScriptedStream::new()
            .chunk("{\"status\":\"Pulling\"}\n")
            .then_fail(DockerError::ImageNotFound {
                image: "ghost".to_string(),
            })));

        let stream = mock
            .image_pull(CreateImageOptions {
                from_image: "ghost".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let err = stream.drain(&Cancellation::new()).await.unwrap_err();
        assert_eq!(
            err,
            DockerError::ImageNotFound {
                image: "ghost".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_wait_delivery_error_arm() {
        let mock = MockDocker::new();
        mock.on::<op::ContainerWait>()
            .returns(WaitDelivery::failed(DockerError::ContainerNotFound {
                id: "abc".to_string(),
            }));

        let result = mock
            .container_wait("abc", None)
            .result(&Cancellation::new())
            .await;
        assert!(matches!(result, Err(DockerError::ContainerNotFound { .. })));
    }

    #[test]
    fn test_operation_kind_names() {
        assert_eq!(OperationKind::ContainerWait.to_string(), "ContainerWait");
        assert_eq!(<op::ImageList as Operation>::KIND, OperationKind::ImageList);
    }
}
