//! Streaming requests with per-event observables.

use std::fmt;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream};
use futures::StreamExt;
use rxhttp_core::{
    pipe_body, BodySink, ByteSource, EventStreamBridge, FnObserver, Observable, Subscriber,
};
use tokio::io::AsyncReadExt;
use tracing::{debug, error};

use crate::error::{Error, SharedError};
use crate::executor::HttpExecutor;
use crate::streaming::{EventChannel, StreamEvent, StreamingRequest};
use crate::types::{Method, RequestOptions, ResponseHead};

const FILE_CHUNK: usize = 64 * 1024;

/// Where an upload body comes from.
pub enum BodySource {
    /// A file, opened when the request is made.
    Path(PathBuf),
    Stream(ByteSource),
}

impl BodySource {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        BodySource::Path(path.into())
    }

    pub fn stream<S>(chunks: S) -> Self
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
    {
        BodySource::Stream(chunks.boxed())
    }

    fn open(self) -> Result<ByteSource, Error> {
        match self {
            BodySource::Path(path) => {
                let file = File::open(&path).map_err(|e| {
                    Error::Io(std::io::Error::new(
                        e.kind(),
                        format!("{}: {}", path.display(), e),
                    ))
                })?;
                Ok(file_chunks(file))
            }
            BodySource::Stream(chunks) => Ok(chunks),
        }
    }
}

impl fmt::Debug for BodySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodySource::Path(path) => f.debug_tuple("Path").field(path).finish(),
            BodySource::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

fn file_chunks(file: File) -> ByteSource {
    let file = tokio::fs::File::from_std(file);
    stream::try_unfold(file, |mut file| async move {
        let mut chunk = BytesMut::with_capacity(FILE_CHUNK);
        if file.read_buf(&mut chunk).await? == 0 {
            return Ok(None);
        }
        Ok(Some((chunk.freeze(), file)))
    })
    .boxed()
}

/// Starts the request once the last [`StreamRequest`] handle is gone, so a
/// request nobody subscribed to still runs.
#[derive(Debug)]
struct StartOnDrop(Arc<StreamingRequest>);

impl Drop for StartOnDrop {
    fn drop(&mut self) {
        self.0.start();
    }
}

/// An opened streaming request.
///
/// Every [`on`](Self::on) call returns an independent observable over one
/// event channel. All of them fail together when the request emits an
/// error; a subscription made after the failure receives it right away.
///
/// The request goes out on the first subscription, on [`start`](Self::start),
/// or when the last handle is dropped, whichever comes first. Listeners
/// attached before that see every event. To subscribe to several channels
/// before anything is sent, use [`with_manual_start`](Self::with_manual_start)
/// and call `start` after the last subscription.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    request: Arc<StreamingRequest>,
    bridge: EventStreamBridge<StreamEvent>,
    wiring_error: Option<SharedError>,
    auto_start: bool,
    _start_on_drop: Arc<StartOnDrop>,
}

impl StreamRequest {
    fn new(request: Arc<StreamingRequest>, wiring_error: Option<SharedError>) -> Self {
        let bridge = EventStreamBridge::new(Arc::clone(request.emitter()));
        Self {
            _start_on_drop: Arc::new(StartOnDrop(Arc::clone(&request))),
            request,
            bridge,
            wiring_error,
            auto_start: true,
        }
    }

    /// Do not start on the first subscription.
    pub fn with_manual_start(mut self) -> Self {
        self.auto_start = false;
        self
    }

    /// Observe one event channel.
    pub fn on(&self, channel: EventChannel) -> Observable<StreamEvent, SharedError> {
        let events = self.bridge.on(channel.as_str()).map_err(|event| match event {
            StreamEvent::Error(error) => error,
            other => Arc::new(Error::Stream {
                message: format!("unexpected {} event on the error channel", other.channel()),
            }),
        });
        let request = Arc::clone(&self.request);
        let auto_start = self.auto_start;

        Observable::new(move |subscriber: Subscriber<StreamEvent, SharedError>| {
            let (next, error, complete) =
                (subscriber.clone(), subscriber.clone(), subscriber.clone());
            let upstream = events.subscribe(FnObserver::new(
                move |event: StreamEvent| {
                    next.next(event);
                },
                move |failure: SharedError| error.error(failure),
                move || complete.complete(),
            ));
            subscriber.add_teardown(move || upstream.unsubscribe());

            // The error event went out before the listener was attached.
            if let Some(failure) = request.failure() {
                subscriber.error(failure);
            }
            if auto_start {
                request.start();
            }
        })
    }

    /// Response body chunks.
    pub fn data(&self) -> Observable<Bytes, SharedError> {
        self.on(EventChannel::Data).filter_map(|event| match event {
            StreamEvent::Data(bytes) => Some(bytes),
            _ => None,
        })
    }

    /// The response head, once it arrives.
    pub fn response(&self) -> Observable<ResponseHead, SharedError> {
        self.on(EventChannel::Response).filter_map(|event| match event {
            StreamEvent::Response(head) => Some(head),
            _ => None,
        })
    }

    /// Send the request now.
    pub fn start(&self) {
        self.request.start();
    }

    /// Abort the request. Open subscriptions fail with [`Error::Cancelled`].
    ///
    /// Unsubscribing only detaches listeners; this stops the connection.
    pub fn cancel(&self) {
        self.request.cancel();
    }

    /// Why the upload body could not be connected, if it could not.
    ///
    /// The request itself keeps running, but a body-bearing request whose
    /// body was never connected does not finish on its own: callers seeing
    /// this should [`cancel`](Self::cancel) it.
    pub fn wiring_error(&self) -> Option<&SharedError> {
        self.wiring_error.as_ref()
    }

    pub fn request(&self) -> &Arc<StreamingRequest> {
        &self.request
    }
}

/// Streaming requests.
#[derive(Clone)]
pub struct StreamService {
    executor: Arc<dyn HttpExecutor>,
}

impl StreamService {
    pub fn new(executor: Arc<dyn HttpExecutor>) -> Self {
        Self { executor }
    }

    pub fn get(&self, url: &str, options: RequestOptions) -> Result<StreamRequest, Error> {
        self.make_request(Method::GET, url, None, options)
    }

    pub fn head(&self, url: &str, options: RequestOptions) -> Result<StreamRequest, Error> {
        self.make_request(Method::HEAD, url, None, options)
    }

    pub fn post(
        &self,
        url: &str,
        body: Option<BodySource>,
        options: RequestOptions,
    ) -> Result<StreamRequest, Error> {
        self.make_request(Method::POST, url, body, options)
    }

    pub fn put(
        &self,
        url: &str,
        body: Option<BodySource>,
        options: RequestOptions,
    ) -> Result<StreamRequest, Error> {
        self.make_request(Method::PUT, url, body, options)
    }

    pub fn patch(
        &self,
        url: &str,
        body: Option<BodySource>,
        options: RequestOptions,
    ) -> Result<StreamRequest, Error> {
        self.make_request(Method::PATCH, url, body, options)
    }

    pub fn delete(
        &self,
        url: &str,
        body: Option<BodySource>,
        options: RequestOptions,
    ) -> Result<StreamRequest, Error> {
        self.make_request(Method::DELETE, url, body, options)
    }

    fn make_request(
        &self,
        method: Method,
        url: &str,
        body: Option<BodySource>,
        options: RequestOptions,
    ) -> Result<StreamRequest, Error> {
        let has_json = options.json.is_some();
        let request = self.executor.open_stream(options.into_request(method, url))?;
        let wiring_error = wire_body(&request, method, body, has_json).err().map(|e| {
            error!(error = %e, method = method.as_str(), url, "failed to wire request body");
            Arc::new(e)
        });
        Ok(StreamRequest::new(request, wiring_error))
    }
}

fn wire_body(
    request: &Arc<StreamingRequest>,
    method: Method,
    body: Option<BodySource>,
    has_json: bool,
) -> Result<(), Error> {
    if has_json && body.is_some() {
        return Err(Error::Stream {
            message: "a body source cannot be combined with a JSON body".to_string(),
        });
    }
    let source = body.map(BodySource::open).transpose()?;
    if source.is_some() {
        debug!(method = method.as_str(), "piping request body");
    }
    let sink: Arc<dyn BodySink> = request.clone();
    pipe_body(sink, source, method.bears_body())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::MockExecutor;
    use crate::types::Progress;
    use rxhttp_core::{FnObserver, Notification};
    use std::io::Write;
    use std::time::Duration;

    fn service(executor: &MockExecutor) -> StreamService {
        StreamService::new(Arc::new(executor.clone()))
    }

    async fn drain(body: &mut crate::streaming::BodyReceiver) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = body.recv().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn data_and_error_subscriptions_share_the_failure() {
        let executor = MockExecutor::new();
        let request = service(&executor).get("file", RequestOptions::new()).unwrap();

        let (data_tx, mut data_rx) = tokio::sync::mpsc::unbounded_channel();
        let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel();
        request.data().subscribe(data_tx);
        request.on(EventChannel::DownloadProgress).subscribe(progress_tx);

        let opened = executor.take_opened();
        let stream = &opened[0].stream;
        stream.emit(StreamEvent::Data(Bytes::from_static(b"abc")));
        stream.emit(StreamEvent::DownloadProgress(Progress::new(3, None)));
        stream.fail(Error::Cancelled);

        assert!(matches!(data_rx.try_recv().unwrap(), Notification::Next(bytes) if bytes == "abc"));
        assert!(matches!(
            data_rx.try_recv().unwrap(),
            Notification::Error(error) if matches!(*error, Error::Cancelled)
        ));
        assert!(matches!(
            progress_rx.try_recv().unwrap(),
            Notification::Next(StreamEvent::DownloadProgress(_))
        ));
        assert!(matches!(progress_rx.try_recv().unwrap(), Notification::Error(_)));
        assert_eq!(stream.emitter().listener_count("data"), 0);
    }

    #[tokio::test]
    async fn unsubscribing_one_channel_keeps_the_others() {
        let executor = MockExecutor::new();
        let request = service(&executor).get("file", RequestOptions::new()).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let data = request
            .data()
            .subscribe(FnObserver::new(|_: Bytes| {}, |_: SharedError| {}, || {}));
        request.response().subscribe(tx);
        data.unsubscribe();

        let opened = executor.take_opened();
        let stream = &opened[0].stream;
        assert_eq!(stream.emitter().listener_count("data"), 0);
        assert_eq!(stream.emitter().listener_count("response"), 1);

        let head = ResponseHead {
            status: 200,
            status_text: "OK".to_string(),
            url: "file".to_string(),
            headers: Default::default(),
        };
        stream.emit(StreamEvent::Response(head.clone()));
        assert!(matches!(rx.try_recv().unwrap(), Notification::Next(received) if received == head));
    }

    #[tokio::test]
    async fn body_verb_without_source_ends_body_during_setup() {
        let executor = MockExecutor::new();
        let request = service(&executor)
            .post("upload", None, RequestOptions::new())
            .unwrap();

        assert!(request.request().is_ended());
        assert!(request.wiring_error().is_none());
        let mut opened = executor.take_opened();
        assert!(opened[0].body.recv().await.is_none());
    }

    #[tokio::test]
    async fn get_leaves_body_alone() {
        let executor = MockExecutor::new();
        let request = service(&executor).get("download", RequestOptions::new()).unwrap();
        assert!(!request.request().is_ended());
    }

    #[tokio::test]
    async fn file_body_is_piped_then_ended() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"file contents").unwrap();

        let executor = MockExecutor::new();
        let request = service(&executor)
            .put("upload", Some(BodySource::path(file.path())), RequestOptions::new())
            .unwrap();
        assert!(request.wiring_error().is_none());

        let mut opened = executor.take_opened();
        let body = tokio::time::timeout(Duration::from_secs(5), drain(&mut opened[0].body))
            .await
            .unwrap();
        assert_eq!(body, b"file contents");
        assert!(request.request().is_ended());
    }

    #[tokio::test]
    async fn stream_body_is_piped() {
        let chunks = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"a")),
            Ok(Bytes::from_static(b"b")),
        ]);

        let executor = MockExecutor::new();
        service(&executor)
            .patch("upload", Some(BodySource::stream(chunks)), RequestOptions::new())
            .unwrap();

        let mut opened = executor.take_opened();
        assert_eq!(drain(&mut opened[0].body).await, b"ab");
        assert_eq!(opened[0].request.method, Method::PATCH);
    }

    #[tokio::test]
    async fn missing_file_is_a_non_fatal_wiring_error() {
        let executor = MockExecutor::new();
        let request = service(&executor)
            .post(
                "upload",
                Some(BodySource::path("/definitely/not/here.bin")),
                RequestOptions::new(),
            )
            .unwrap();

        assert!(matches!(
            request.wiring_error().map(|e| &**e),
            Some(Error::Io(_))
        ));
        assert!(!request.request().is_ended());

        // Other channels still work.
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        request.on(EventChannel::Request).subscribe(tx);
        executor.take_opened()[0].stream.emit(StreamEvent::Request);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Notification::Next(StreamEvent::Request)
        ));
    }

    #[tokio::test]
    async fn first_subscription_starts_the_request() {
        let executor = MockExecutor::new();
        let request = service(&executor).get("file", RequestOptions::new()).unwrap();
        let observable = request.data();
        assert!(!request.request().is_started());

        let _subscription = observable.subscribe(FnObserver::new(
            |_: Bytes| {},
            |_: SharedError| {},
            || {},
        ));
        assert!(request.request().is_started());
    }

    #[tokio::test]
    async fn manual_start_waits_for_start_or_drop() {
        let executor = MockExecutor::new();
        let request = service(&executor)
            .get("file", RequestOptions::new())
            .unwrap()
            .with_manual_start();
        let stream = Arc::clone(request.request());

        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        request.on(EventChannel::Request).subscribe(tx);
        let copy = request.clone();
        assert!(!stream.is_started());

        drop(request);
        assert!(!stream.is_started());
        drop(copy);
        assert!(stream.is_started());

        let explicit = service(&executor)
            .get("other", RequestOptions::new())
            .unwrap()
            .with_manual_start();
        explicit.start();
        assert!(explicit.request().is_started());
    }

    #[tokio::test]
    async fn subscription_after_failure_receives_it() {
        let executor = MockExecutor::new();
        let request = service(&executor).get("file", RequestOptions::new()).unwrap();
        executor.take_opened()[0].stream.fail(Error::Cancelled);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let subscription = request.data().subscribe(tx);

        assert!(matches!(
            rx.try_recv().unwrap(),
            Notification::Error(error) if matches!(*error, Error::Cancelled)
        ));
        assert!(rx.try_recv().is_err());
        assert!(subscription.is_closed());
        assert_eq!(request.request().emitter().listener_count("data"), 0);
    }

    #[tokio::test]
    async fn cancel_fails_open_subscriptions_and_closes_the_body() {
        let executor = MockExecutor::new();
        let request = service(&executor)
            .post(
                "upload",
                Some(BodySource::path("/definitely/not/here.bin")),
                RequestOptions::new(),
            )
            .unwrap();
        assert!(request.wiring_error().is_some());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        request.response().subscribe(tx);
        request.cancel();

        assert!(matches!(
            rx.try_recv().unwrap(),
            Notification::Error(error) if matches!(*error, Error::Cancelled)
        ));
        let mut opened = executor.take_opened();
        assert!(opened[0].body.recv().await.unwrap().is_err());
        assert!(opened[0].body.recv().await.is_none());
    }

    #[tokio::test]
    async fn json_body_with_body_source_is_a_wiring_error() {
        let executor = MockExecutor::new();
        let chunks = futures::stream::iter(vec![Ok(Bytes::from_static(b"ignored"))]);
        let options = RequestOptions::new()
            .with_json(serde_json::json!({"name": "Alice"}))
            .unwrap();

        let request = service(&executor)
            .put("upload", Some(BodySource::stream(chunks)), options)
            .unwrap();

        assert!(matches!(
            request.wiring_error().map(|e| &**e),
            Some(Error::Stream { .. })
        ));
        let opened = executor.take_opened();
        assert_eq!(
            opened[0].request.body,
            Some(serde_json::json!({"name": "Alice"}))
        );
    }
}
