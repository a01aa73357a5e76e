//! HTTP execution abstraction for testing.
//!
//! Services talk to the network only through [`HttpExecutor`], so tests can
//! swap in a mock and never open a socket.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::abortable;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Client, RequestBuilder, Response};
use tokio::runtime::Handle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::Error;
use crate::streaming::{BodyReceiver, StreamEvent, StreamingRequest};
use crate::types::{HttpRequest, HttpResponse, Progress, ResponseHead};

/// Trait for executing HTTP requests.
///
/// Implementations can use real HTTP clients or mock responses for testing.
#[async_trait]
pub trait HttpExecutor: Send + Sync + 'static {
    /// Execute a request and buffer its JSON response.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, Error>;

    /// Open a streaming request.
    ///
    /// Events are emitted on the returned request from a background task
    /// that does nothing until [`StreamingRequest::start`] is called, so
    /// listeners attached before that see every event. The task is
    /// registered with [`StreamingRequest::set_driver`] so it can be
    /// cancelled. For body-bearing verbs without a JSON body the upload body
    /// stays open until it is ended through the request's
    /// [`BodySink`](rxhttp_core::BodySink).
    fn open_stream(&self, request: HttpRequest) -> Result<Arc<StreamingRequest>, Error>;
}

/// Production HTTP executor using reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestExecutor {
    client: Client,
    config: ClientConfig,
}

impl ReqwestExecutor {
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        config.validate()?;

        let mut default_headers = HeaderMap::new();
        if let Some(agent) = &config.user_agent {
            default_headers.insert(USER_AGENT, HeaderValue::try_from(agent.as_str())?);
        }

        let client = Client::builder()
            .timeout(config.timeout())
            .default_headers(default_headers)
            .build()?;

        Ok(Self { client, config })
    }

    /// Create with the default configuration (30 second timeout, no prefix).
    pub fn with_default_config() -> Result<Self, Error> {
        Self::new(ClientConfig::default())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn build(&self, request: &HttpRequest) -> Result<RequestBuilder, Error> {
        let url = self.config.resolve_url(&request.url)?;

        let mut headers = HeaderMap::new();
        for (name, value) in self.config.headers.iter().chain(&request.headers) {
            let header_name = HeaderName::try_from(name.as_str())?;
            let header_value = HeaderValue::try_from(value.as_str())?;
            headers.insert(header_name, header_value);
        }

        let mut builder = self
            .client
            .request(request.method.into(), url)
            .headers(headers);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        Ok(builder)
    }
}

#[async_trait]
impl HttpExecutor for ReqwestExecutor {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, Error> {
        debug!(method = request.method.as_str(), url = %request.url, "executing request");
        let response = self.build(&request)?.send().await?;

        let head = response_head(&response);
        let body_text = response.text().await?;
        if self.config.throw_http_errors && !head.is_success() {
            return Err(Error::Status {
                status: head.status,
                body: body_text,
            });
        }

        let body = serde_json::from_str(&body_text).unwrap_or(serde_json::Value::Null);

        Ok(HttpResponse {
            status: head.status,
            status_text: head.status_text,
            url: head.url,
            headers: head.headers,
            body,
            body_text: Some(body_text),
        })
    }

    fn open_stream(&self, request: HttpRequest) -> Result<Arc<StreamingRequest>, Error> {
        let runtime = Handle::try_current().map_err(|_| Error::Stream {
            message: "no tokio runtime available to drive the request".to_string(),
        })?;

        let mut builder = self.build(&request)?;
        let (stream, body) = StreamingRequest::new();
        if request.method.bears_body() && request.body.is_none() {
            builder = builder.body(upload_body(body, Arc::clone(&stream)));
        }

        debug!(method = request.method.as_str(), url = %request.url, "opening stream");
        let (driver, abort) = abortable(drive(
            builder,
            Arc::clone(&stream),
            self.config.throw_http_errors,
        ));
        stream.set_driver(abort);
        runtime.spawn(driver);
        Ok(stream)
    }
}

fn response_head(response: &Response) -> ResponseHead {
    let status = response.status();

    let mut headers = HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(v) = value.to_str() {
            headers.insert(name.to_string(), v.to_string());
        }
    }

    ResponseHead {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or("Unknown").to_string(),
        url: response.url().to_string(),
        headers,
    }
}

/// Turn the body channel into a request body, reporting upload progress.
fn upload_body(body: BodyReceiver, stream: Arc<StreamingRequest>) -> reqwest::Body {
    let mut transferred = 0u64;
    let chunks = ReceiverStream::new(body).map(move |chunk: io::Result<Bytes>| {
        if let Ok(bytes) = &chunk {
            transferred += bytes.len() as u64;
            stream.emit(StreamEvent::UploadProgress(Progress::new(transferred, None)));
        }
        chunk
    });
    reqwest::Body::wrap_stream(chunks)
}

async fn drive(builder: RequestBuilder, stream: Arc<StreamingRequest>, throw_http_errors: bool) {
    stream.wait_for_start().await;
    stream.emit(StreamEvent::Request);

    let response = match builder.send().await {
        Ok(response) => response,
        Err(e) => {
            stream.fail(Error::Http(e));
            return;
        }
    };

    let head = response_head(&response);
    if throw_http_errors && !head.is_success() {
        let status = head.status;
        let body = response.text().await.unwrap_or_default();
        stream.fail(Error::Status { status, body });
        return;
    }

    let total = response.content_length();
    stream.emit(StreamEvent::Response(head));

    let mut transferred = 0u64;
    let mut chunks = response.bytes_stream();
    while let Some(chunk) = chunks.next().await {
        match chunk {
            Ok(bytes) => {
                transferred += bytes.len() as u64;
                stream.emit(StreamEvent::Data(bytes));
                stream.emit(StreamEvent::DownloadProgress(Progress::new(
                    transferred,
                    total,
                )));
            }
            Err(e) => {
                warn!(transferred, "response body interrupted");
                stream.fail(Error::Http(e));
                return;
            }
        }
    }
    stream.emit(StreamEvent::End);
}

/// Mock HTTP executor for testing.
///
/// Returns predefined responses based on request matching.
#[cfg(test)]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A streaming request opened through the mock, with its body receiver.
    pub struct OpenedStream {
        pub request: HttpRequest,
        pub stream: Arc<StreamingRequest>,
        pub body: BodyReceiver,
    }

    /// A mock HTTP executor that returns predefined responses.
    #[derive(Clone, Default)]
    pub struct MockExecutor {
        /// Responses keyed by request URL.
        responses: Arc<Mutex<HashMap<String, HttpResponse>>>,
        recorded_requests: Arc<Mutex<Vec<HttpRequest>>>,
        opened: Arc<Mutex<Vec<OpenedStream>>>,
        fail_with: Arc<Mutex<Option<String>>>,
        hang: Arc<Mutex<bool>>,
        in_flight: Arc<AtomicUsize>,
    }

    /// Decrements the in-flight count however the request future ends.
    struct InFlight(Arc<AtomicUsize>);

    impl InFlight {
        fn enter(count: &Arc<AtomicUsize>) -> Self {
            count.fetch_add(1, Ordering::SeqCst);
            Self(Arc::clone(count))
        }
    }

    impl Drop for InFlight {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl MockExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_response(self, url: impl Into<String>, response: HttpResponse) -> Self {
            self.responses.lock().insert(url.into(), response);
            self
        }

        /// Fail every request with a stream error carrying `message`.
        pub fn fail_with(self, message: impl Into<String>) -> Self {
            *self.fail_with.lock() = Some(message.into());
            self
        }

        /// Never settle `execute`.
        pub fn hanging(self) -> Self {
            *self.hang.lock() = true;
            self
        }

        pub fn recorded_requests(&self) -> Vec<HttpRequest> {
            self.recorded_requests.lock().clone()
        }

        /// Requests currently awaiting a response.
        pub fn in_flight(&self) -> usize {
            self.in_flight.load(Ordering::SeqCst)
        }

        /// Take every stream opened so far.
        pub fn take_opened(&self) -> Vec<OpenedStream> {
            std::mem::take(&mut *self.opened.lock())
        }

        pub fn success_response(body: serde_json::Value) -> HttpResponse {
            let body_text = body.to_string();
            HttpResponse {
                status: 200,
                status_text: "OK".to_string(),
                url: String::new(),
                headers: HashMap::new(),
                body,
                body_text: Some(body_text),
            }
        }

        pub fn not_found() -> HttpResponse {
            HttpResponse {
                status: 404,
                status_text: "Not Found".to_string(),
                url: String::new(),
                headers: HashMap::new(),
                body: serde_json::json!({"error": "Not Found"}),
                body_text: Some(r#"{"error":"Not Found"}"#.to_string()),
            }
        }
    }

    #[async_trait]
    impl HttpExecutor for MockExecutor {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, Error> {
            let _in_flight = InFlight::enter(&self.in_flight);
            self.recorded_requests.lock().push(request.clone());

            let hang = *self.hang.lock();
            if hang {
                futures::future::pending::<()>().await;
            }

            let failure = self.fail_with.lock().clone();
            if let Some(message) = failure {
                return Err(Error::Stream { message });
            }

            let response = self
                .responses
                .lock()
                .get(&request.url)
                .cloned()
                .unwrap_or_else(Self::not_found);

            if !response.is_success() {
                return Err(Error::Status {
                    status: response.status,
                    body: response.body_text.unwrap_or_default(),
                });
            }
            Ok(response)
        }

        fn open_stream(&self, request: HttpRequest) -> Result<Arc<StreamingRequest>, Error> {
            self.recorded_requests.lock().push(request.clone());
            let (stream, body) = StreamingRequest::new();
            self.opened.lock().push(OpenedStream {
                request,
                stream: Arc::clone(&stream),
                body,
            });
            Ok(stream)
        }
    }
}
