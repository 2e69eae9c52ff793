//! Transport abstraction between controller and server.

use crate::error::{SyncError, SyncResult};
use entisync_protocol::{RequestBody, ResponseBody};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

/// A request/response channel to an entity server.
///
/// Implementations must be safe to share across threads; the controller
/// issues requests for different entity ids concurrently.
pub trait Transport: Send + Sync {
    /// Sends a request and waits for the response.
    fn send(&self, request: &RequestBody) -> SyncResult<ResponseBody>;

    /// Returns true if the transport considers itself usable.
    fn is_connected(&self) -> bool;

    /// Shuts the transport down.
    fn close(&self);
}

/// Scripted transport for tests.
///
/// Responses are served in the order they were pushed; every sent
/// request is recorded for inspection.
#[derive(Debug, Default)]
pub struct MockTransport {
    responses: Mutex<VecDeque<SyncResult<ResponseBody>>>,
    sent: Mutex<Vec<RequestBody>>,
    connected: AtomicBool,
}

impl MockTransport {
    /// Creates a connected mock with no scripted responses.
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
        }
    }

    /// Queues a response.
    pub fn push_response(&self, response: ResponseBody) {
        self.responses.lock().push_back(Ok(response));
    }

    /// Queues a transport failure.
    pub fn push_error(&self, error: SyncError) {
        self.responses.lock().push_back(Err(error));
    }

    /// Returns the requests sent so far.
    pub fn sent_requests(&self) -> Vec<RequestBody> {
        self.sent.lock().clone()
    }

    /// Returns how many requests were sent.
    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Marks the transport disconnected.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl Transport for MockTransport {
    fn send(&self, request: &RequestBody) -> SyncResult<ResponseBody> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.sent.lock().push(request.clone());
        self.responses
            .lock()
            .pop_front()
            .unwrap_or(Err(SyncError::NotConnected))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.disconnect();
    }
}
