//! The event-emitting request object behind [`StreamService`](crate::StreamService).

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::AbortHandle;
use parking_lot::Mutex;
use rxhttp_core::{BodyError, BodySink, EventEmitter};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

use crate::error::{Error, SharedError};
use crate::types::{Progress, ResponseHead};

/// Receiving side of a streaming request's upload body.
pub type BodyReceiver = mpsc::Receiver<io::Result<Bytes>>;

/// Chunks buffered between the body writer and the connection.
pub const BODY_BUFFER: usize = 16;

/// Named event channel of a streaming request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventChannel {
    End,
    Data,
    Error,
    Request,
    Response,
    Redirect,
    UploadProgress,
    DownloadProgress,
}

impl EventChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventChannel::End => "end",
            EventChannel::Data => "data",
            EventChannel::Error => rxhttp_core::ERROR_CHANNEL,
            EventChannel::Request => "request",
            EventChannel::Response => "response",
            EventChannel::Redirect => "redirect",
            EventChannel::UploadProgress => "uploadProgress",
            EventChannel::DownloadProgress => "downloadProgress",
        }
    }
}

impl fmt::Display for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened to a streaming request.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The request was handed to the connection.
    Request,
    Response(ResponseHead),
    Redirect(ResponseHead),
    Data(Bytes),
    UploadProgress(Progress),
    DownloadProgress(Progress),
    /// The response body was fully received.
    End,
    Error(SharedError),
}

impl StreamEvent {
    pub fn channel(&self) -> EventChannel {
        match self {
            StreamEvent::Request => EventChannel::Request,
            StreamEvent::Response(_) => EventChannel::Response,
            StreamEvent::Redirect(_) => EventChannel::Redirect,
            StreamEvent::Data(_) => EventChannel::Data,
            StreamEvent::UploadProgress(_) => EventChannel::UploadProgress,
            StreamEvent::DownloadProgress(_) => EventChannel::DownloadProgress,
            StreamEvent::End => EventChannel::End,
            StreamEvent::Error(_) => EventChannel::Error,
        }
    }
}

/// An in-flight streaming request: an emitter for its events plus the
/// writable side of its upload body.
///
/// The task driving the connection waits for [`start`](Self::start) before
/// it emits anything, so listeners attached before that see every event. The
/// first failure is kept and can be read back with
/// [`failure`](Self::failure) by listeners that arrive after it was emitted.
pub struct StreamingRequest {
    emitter: Arc<EventEmitter<StreamEvent>>,
    body: Mutex<Option<mpsc::Sender<io::Result<Bytes>>>>,
    ended: AtomicBool,
    failed: AtomicBool,
    failure: Mutex<Option<SharedError>>,
    started: AtomicBool,
    start_gate: Notify,
    driver: Mutex<Option<AbortHandle>>,
}

impl fmt::Debug for StreamingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingRequest")
            .field("emitter", &self.emitter)
            .field("ended", &self.is_ended())
            .field("failed", &self.is_failed())
            .field("started", &self.is_started())
            .finish()
    }
}

impl StreamingRequest {
    /// Create a request and the receiver its connection reads the body from.
    pub fn new() -> (Arc<Self>, BodyReceiver) {
        let (tx, rx) = mpsc::channel(BODY_BUFFER);
        let request = Arc::new(Self {
            emitter: Arc::new(EventEmitter::new()),
            body: Mutex::new(Some(tx)),
            ended: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            failure: Mutex::new(None),
            started: AtomicBool::new(false),
            start_gate: Notify::new(),
            driver: Mutex::new(None),
        });
        (request, rx)
    }

    pub fn emitter(&self) -> &Arc<EventEmitter<StreamEvent>> {
        &self.emitter
    }

    /// Emit `event` on its channel.
    pub fn emit(&self, event: StreamEvent) -> usize {
        let channel = event.channel();
        let delivered = self.emitter.emit(channel.as_str(), &event);
        trace!(%channel, delivered, "stream event");
        delivered
    }

    /// Emit an error event. Only the first failure of a request is emitted.
    pub fn fail(&self, error: Error) {
        if self.failed.swap(true, Ordering::SeqCst) {
            debug!(%error, "request already failed, error dropped");
            return;
        }
        self.close_body();
        let error = Arc::new(error);
        // Stored before emitting so a listener attached concurrently sees
        // it one way or the other.
        *self.failure.lock() = Some(Arc::clone(&error));
        self.emit(StreamEvent::Error(error));
    }

    /// The error this request failed with, if it failed.
    pub fn failure(&self) -> Option<SharedError> {
        self.failure.lock().clone()
    }

    /// Let the driving task begin. Idempotent.
    pub fn start(&self) {
        if !self.started.swap(true, Ordering::SeqCst) {
            trace!("streaming request started");
            self.start_gate.notify_one();
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Resolves once [`start`](Self::start) has been called.
    pub async fn wait_for_start(&self) {
        if !self.is_started() {
            self.start_gate.notified().await;
        }
    }

    /// Register the handle that aborts the task driving this request.
    pub fn set_driver(&self, driver: AbortHandle) {
        *self.driver.lock() = Some(driver);
    }

    /// Abort the driving task, close the upload body and fail the request
    /// with [`Error::Cancelled`].
    pub fn cancel(&self) {
        if let Some(driver) = self.driver.lock().take() {
            debug!("aborting streaming request");
            driver.abort();
        }
        self.break_body("request cancelled".to_string());
        self.fail(Error::Cancelled);
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    fn close_body(&self) -> Option<mpsc::Sender<io::Result<Bytes>>> {
        self.ended.store(true, Ordering::SeqCst);
        self.body.lock().take()
    }

    /// Close the body with an error so the connection does not send a
    /// truncated body as if it were complete. A full buffer leaves the
    /// request's error event as the only signal.
    fn break_body(&self, reason: String) {
        if let Some(sender) = self.close_body() {
            let _ = sender.try_send(Err(io::Error::other(reason)));
        }
    }
}

#[async_trait]
impl BodySink for StreamingRequest {
    async fn write(&self, chunk: Bytes) -> Result<(), BodyError> {
        let sender = self.body.lock().clone().ok_or(BodyError::Ended)?;
        sender.send(Ok(chunk)).await.map_err(|_| BodyError::Closed)
    }

    fn end(&self) {
        if self.close_body().is_some() {
            trace!("request body ended");
        }
    }

    fn abort(&self, reason: String) {
        self.break_body(reason.clone());
        self.fail(Error::Stream {
            message: format!("request body failed: {}", reason),
        });
    }
}
