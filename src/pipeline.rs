//! Bounded event pipelines between callers, the dispatcher and the response handler.
//!
//! # How it works
//!
//! ```text
//! callers ──try_publish──▶ [ bounded mpsc ] ──recv + drain──▶ EventHandler
//!                              │                               on_event(e, end_of_batch)
//!                              └─ full: fail fast (backpressure)
//! ```
//!
//! The consumer takes one event, then drains whatever is already queued up to the batch
//! limit. The last event of each drained batch is flagged `end_of_batch`. Producers never
//! wait: a full pipeline rejects the event immediately. Events from one producer arrive in
//! submission order.

use crate::error::{CoreError, Result};
use crate::message::{CoreResponse, PendingRequest, ResponseEvent};
use crate::observability;
use crate::shutdown::ShutdownCoordinator;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};

/// Consumer side of an event pipeline.
pub trait EventHandler<E>: Send {
    /// Handle one event. `end_of_batch` is set on the last event of a drained batch.
    fn on_event(&mut self, event: E, end_of_batch: bool);

    /// Handle an event that was still queued when the pipeline stopped.
    fn on_cancel(&mut self, event: E) {
        drop(event);
    }
}

/// Why an event was not accepted. The event is handed back.
#[derive(Debug)]
pub enum PublishError<E> {
    Full(E),
    Closed(E),
}

/// Constructor for bounded pipelines.
pub struct EventPipeline;

impl EventPipeline {
    pub fn bounded<E>(capacity: usize) -> (EventSink<E>, EventStream<E>) {
        let (tx, rx) = mpsc::channel(capacity);
        (EventSink { tx }, EventStream { rx, metrics: true })
    }
}

/// Producer side of a pipeline.
#[derive(Debug)]
pub struct EventSink<E> {
    tx: mpsc::Sender<E>,
}

impl<E> Clone for EventSink<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E> EventSink<E> {
    /// Publish without waiting.
    pub fn try_publish(&self, event: E) -> std::result::Result<(), PublishError<E>> {
        self.tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(event) => PublishError::Full(event),
            TrySendError::Closed(event) => PublishError::Closed(event),
        })
    }

    /// Free slots left in the pipeline.
    pub fn remaining_capacity(&self) -> usize {
        self.tx.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side of a pipeline.
#[derive(Debug)]
pub struct EventStream<E> {
    rx: mpsc::Receiver<E>,
    metrics: bool,
}

impl<E: Send> EventStream<E> {
    /// Record batch sizes only when `enabled`.
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.metrics = enabled;
        self
    }

    /// Drive `handler` until shutdown or until every sink is dropped.
    ///
    /// Events still queued when the loop stops are passed to
    /// [`EventHandler::on_cancel`]. Returns the handler.
    pub async fn run<H>(
        mut self,
        mut handler: H,
        max_batch: usize,
        shutdown: ShutdownCoordinator,
    ) -> H
    where
        H: EventHandler<E>,
    {
        let max_batch = max_batch.max(1);

        loop {
            let first = tokio::select! {
                biased;
                _ = shutdown.wait_for_shutdown() => break,
                event = self.rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let mut current = first;
            let mut batch = 1usize;
            loop {
                if batch >= max_batch {
                    handler.on_event(current, true);
                    break;
                }
                match self.rx.try_recv() {
                    Ok(next) => {
                        handler.on_event(current, false);
                        current = next;
                        batch += 1;
                    }
                    Err(_) => {
                        handler.on_event(current, true);
                        break;
                    }
                }
            }
            if self.metrics {
                observability::record_batch(batch);
            }
        }

        self.rx.close();
        let mut canceled = 0usize;
        while let Some(event) = self.rx.recv().await {
            handler.on_cancel(event);
            canceled += 1;
        }
        debug!(canceled, "Pipeline consumer stopped");
        handler
    }
}

/// Request side of the dispatch engine.
#[derive(Debug, Clone)]
pub struct RequestPipeline {
    sink: EventSink<Arc<PendingRequest>>,
    metrics: bool,
}

impl RequestPipeline {
    pub fn new(sink: EventSink<Arc<PendingRequest>>) -> Self {
        Self {
            sink,
            metrics: true,
        }
    }

    /// Count rejected requests only when `enabled`.
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.metrics = enabled;
        self
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics
    }

    /// Enqueue a data-plane request without blocking.
    ///
    /// On rejection the request's completion is already fulfilled: with
    /// [`CoreError::BACKPRESSURE`] if the pipeline is full, or [`CoreError::Shutdown`] if
    /// it no longer accepts work.
    pub fn submit(&self, request: Arc<PendingRequest>) -> bool {
        match self.sink.try_publish(request) {
            Ok(()) => true,
            Err(PublishError::Full(request)) => {
                trace!(id = request.id, "Request pipeline full, rejecting request");
                if self.metrics {
                    observability::record_backpressure();
                }
                request.completion.fail(CoreError::BACKPRESSURE);
                false
            }
            Err(PublishError::Closed(request)) => {
                request.completion.fail(CoreError::Shutdown);
                false
            }
        }
    }

    pub fn remaining_capacity(&self) -> usize {
        self.sink.remaining_capacity()
    }
}

/// Handle services use to deliver responses.
///
/// Responses go through the response pipeline when one is attached. If that pipeline is
/// full or closed, the completion is fulfilled inline so a response is never lost.
#[derive(Debug, Clone, Default)]
pub struct ResponseSink {
    sink: Option<EventSink<ResponseEvent>>,
}

impl ResponseSink {
    pub fn new(sink: EventSink<ResponseEvent>) -> Self {
        Self { sink: Some(sink) }
    }

    /// A sink that completes requests on the calling task.
    pub fn direct() -> Self {
        Self { sink: None }
    }

    pub fn publish(&self, request: Arc<PendingRequest>, response: Result<CoreResponse>) {
        let event = ResponseEvent { request, response };
        let event = match &self.sink {
            Some(sink) => match sink.try_publish(event) {
                Ok(()) => return,
                Err(PublishError::Full(event)) | Err(PublishError::Closed(event)) => event,
            },
            None => event,
        };
        event.request.completion.complete(event.response);
    }
}
