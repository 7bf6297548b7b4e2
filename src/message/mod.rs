//! Requests, responses and completion handles.
//!
//! Every caller-facing request is one of three categories, modelled as a sum type so the
//! handling path is decided exhaustively at compile time:
//!
//! - [`CoreRequest`]: data-plane work routed through the pipeline and a locator.
//! - [`ClusterRequest`]: seed hosts, open bucket, disconnect. Handled directly.
//! - [`InternalRequest`]: node and service management. Handled directly.
//!
//! A [`Completion`] is fulfilled at most once. The caller awaits the paired
//! [`ResponseFuture`].

use crate::error::{CoreError, Result};
use crate::service::ServiceType;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

// =============================================================================
// Responses
// =============================================================================

/// Outcome status carried by every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    Success,
    Failure,
    /// The bucket is open but no live node owns the request.
    NotConnected,
    /// The bucket is not part of the current cluster configuration.
    BucketNotOpen,
}

impl ResponseStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ResponseStatus::Success)
    }
}

/// Payload attached to a response.
#[derive(Debug)]
pub enum ResponsePayload {
    Empty,
    Document {
        key: String,
        content: Vec<u8>,
        cas: u64,
    },
    Rows(Vec<String>),
    /// Raw configuration documents streamed from one node.
    ConfigStream {
        host: String,
        configs: mpsc::UnboundedReceiver<String>,
    },
    Node {
        hostname: String,
    },
    Service {
        service_type: ServiceType,
        hostname: String,
    },
}

/// A response delivered through a request's completion handle.
#[derive(Debug)]
pub struct CoreResponse {
    pub status: ResponseStatus,
    pub payload: ResponsePayload,
}

impl CoreResponse {
    pub fn new(status: ResponseStatus, payload: ResponsePayload) -> Self {
        Self { status, payload }
    }

    pub fn success() -> Self {
        Self::new(ResponseStatus::Success, ResponsePayload::Empty)
    }

    pub fn failure() -> Self {
        Self::new(ResponseStatus::Failure, ResponsePayload::Empty)
    }

    pub fn not_connected() -> Self {
        Self::new(ResponseStatus::NotConnected, ResponsePayload::Empty)
    }

    pub fn bucket_not_open() -> Self {
        Self::new(ResponseStatus::BucketNotOpen, ResponsePayload::Empty)
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

// =============================================================================
// Data-plane requests
// =============================================================================

/// Key/value operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryRequest {
    Get { key: String },
    /// Read from the `replica`-th replica (1-based) of the key's partition.
    GetReplica { key: String, replica: u16 },
    Upsert {
        key: String,
        content: Vec<u8>,
        expiry: u32,
    },
    Remove { key: String, cas: u64 },
}

impl BinaryRequest {
    pub fn key(&self) -> &str {
        match self {
            BinaryRequest::Get { key }
            | BinaryRequest::GetReplica { key, .. }
            | BinaryRequest::Upsert { key, .. }
            | BinaryRequest::Remove { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewRequest {
    pub design: String,
    pub view: String,
    pub query: String,
    pub development: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub statement: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigRequest {
    /// Open a streaming configuration feed for the bucket.
    BucketStreaming,
    /// Fetch the bucket configuration once.
    BucketConfig,
}

/// Request categories routed through locators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Binary(BinaryRequest),
    View(ViewRequest),
    Query(QueryRequest),
    Config(ConfigRequest),
}

/// A data-plane request. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreRequest {
    bucket: String,
    password: Option<String>,
    kind: RequestKind,
}

impl CoreRequest {
    pub fn new(bucket: impl Into<String>, kind: RequestKind) -> Self {
        Self {
            bucket: bucket.into(),
            password: None,
            kind,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn get(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(
            bucket,
            RequestKind::Binary(BinaryRequest::Get { key: key.into() }),
        )
    }

    pub fn get_replica(bucket: impl Into<String>, key: impl Into<String>, replica: u16) -> Self {
        Self::new(
            bucket,
            RequestKind::Binary(BinaryRequest::GetReplica {
                key: key.into(),
                replica,
            }),
        )
    }

    pub fn upsert(bucket: impl Into<String>, key: impl Into<String>, content: Vec<u8>) -> Self {
        Self::new(
            bucket,
            RequestKind::Binary(BinaryRequest::Upsert {
                key: key.into(),
                content,
                expiry: 0,
            }),
        )
    }

    pub fn remove(bucket: impl Into<String>, key: impl Into<String>, cas: u64) -> Self {
        Self::new(
            bucket,
            RequestKind::Binary(BinaryRequest::Remove {
                key: key.into(),
                cas,
            }),
        )
    }

    pub fn view(
        bucket: impl Into<String>,
        design: impl Into<String>,
        view: impl Into<String>,
    ) -> Self {
        Self::new(
            bucket,
            RequestKind::View(ViewRequest {
                design: design.into(),
                view: view.into(),
                query: String::new(),
                development: false,
            }),
        )
    }

    pub fn query(bucket: impl Into<String>, statement: impl Into<String>) -> Self {
        Self::new(
            bucket,
            RequestKind::Query(QueryRequest {
                statement: statement.into(),
            }),
        )
    }

    pub fn bucket_streaming(bucket: impl Into<String>) -> Self {
        Self::new(bucket, RequestKind::Config(ConfigRequest::BucketStreaming))
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn kind(&self) -> &RequestKind {
        &self.kind
    }

    /// The service type that serves this request.
    pub fn service_type(&self) -> ServiceType {
        match self.kind {
            RequestKind::Binary(_) => ServiceType::Binary,
            RequestKind::View(_) => ServiceType::View,
            RequestKind::Query(_) => ServiceType::Query,
            RequestKind::Config(_) => ServiceType::Config,
        }
    }
}

// =============================================================================
// Cluster-control and internal requests
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterRequest {
    SeedNodes(Vec<String>),
    OpenBucket {
        bucket: String,
        password: Option<String>,
    },
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddServiceRequest {
    pub service_type: ServiceType,
    pub bucket: Option<String>,
    pub password: Option<String>,
    pub port: u16,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveServiceRequest {
    pub service_type: ServiceType,
    pub bucket: Option<String>,
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InternalRequest {
    AddNode { hostname: String },
    RemoveNode { hostname: String },
    AddService(AddServiceRequest),
    RemoveService(RemoveServiceRequest),
}

/// Any request the core accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Data(CoreRequest),
    Cluster(ClusterRequest),
    Internal(InternalRequest),
}

impl From<CoreRequest> for Request {
    fn from(request: CoreRequest) -> Self {
        Request::Data(request)
    }
}

impl From<ClusterRequest> for Request {
    fn from(request: ClusterRequest) -> Self {
        Request::Cluster(request)
    }
}

impl From<InternalRequest> for Request {
    fn from(request: InternalRequest) -> Self {
        Request::Internal(request)
    }
}

// =============================================================================
// Completion handles
// =============================================================================

/// Single-use completion handle. The first fulfillment wins; later ones are ignored.
#[derive(Debug)]
pub struct Completion {
    sender: Mutex<Option<oneshot::Sender<Result<CoreResponse>>>>,
}

impl Completion {
    /// Create a completion handle and the future its caller awaits.
    pub fn channel() -> (Completion, ResponseFuture) {
        let (tx, rx) = oneshot::channel();
        (
            Completion {
                sender: Mutex::new(Some(tx)),
            },
            ResponseFuture { receiver: rx },
        )
    }

    /// Fulfill the handle. Returns `false` if it was already fulfilled.
    pub fn complete(&self, result: Result<CoreResponse>) -> bool {
        match self.sender.lock().take() {
            Some(tx) => {
                // The caller may have stopped waiting; the handle still counts as fulfilled.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    pub fn succeed(&self, response: CoreResponse) -> bool {
        self.complete(Ok(response))
    }

    pub fn fail(&self, error: CoreError) -> bool {
        self.complete(Err(error))
    }

    pub fn is_completed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

/// Future resolving to a request's response.
///
/// Resolves to [`CoreError::Canceled`] if the completion handle is dropped unfulfilled.
#[derive(Debug)]
pub struct ResponseFuture {
    receiver: oneshot::Receiver<Result<CoreResponse>>,
}

impl Future for ResponseFuture {
    type Output = Result<CoreResponse>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(CoreError::Canceled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A data-plane request paired with its completion handle while it is in flight.
#[derive(Debug)]
pub struct PendingRequest {
    pub id: u64,
    pub request: CoreRequest,
    pub completion: Completion,
}

impl PendingRequest {
    pub fn new(id: u64, request: CoreRequest) -> (Arc<PendingRequest>, ResponseFuture) {
        let (completion, future) = Completion::channel();
        (
            Arc::new(PendingRequest {
                id,
                request,
                completion,
            }),
            future,
        )
    }
}

/// Messages a node hands to its services.
#[derive(Debug, Clone)]
pub enum ServiceMessage {
    Request(Arc<PendingRequest>),
    /// End of a dispatch batch; services may write out coalesced requests.
    Flush,
}

/// A response travelling back through the response pipeline.
#[derive(Debug)]
pub struct ResponseEvent {
    pub request: Arc<PendingRequest>,
    pub response: Result<CoreResponse>,
}
