//! Response pipeline consumer.

use crate::message::ResponseEvent;
use crate::pipeline::EventHandler;
use tracing::trace;

/// Fulfills each request's completion with the response its service produced.
///
/// A completion already fulfilled (another node answered a broadcast first, or the send
/// failed) keeps its first result; the late response is dropped.
#[derive(Debug, Default)]
pub struct ResponseHandler {
    delivered: u64,
    dropped: u64,
}

impl ResponseHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn deliver(&mut self, event: ResponseEvent) {
        let id = event.request.id;
        if event.request.completion.complete(event.response) {
            self.delivered += 1;
        } else {
            trace!(id, "Dropping response for completed request");
            self.dropped += 1;
        }
    }
}

impl EventHandler<ResponseEvent> for ResponseHandler {
    fn on_event(&mut self, event: ResponseEvent, _end_of_batch: bool) {
        self.deliver(event);
    }

    // A response that already exists is still handed to its caller at shutdown.
    fn on_cancel(&mut self, event: ResponseEvent) {
        self.deliver(event);
    }
}
