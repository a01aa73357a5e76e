//! # rxhttp
//!
//! HTTP requests, pagination and streaming exposed as observables.
//!
//! Every service returns a cold [`Observable`]: nothing is sent until it is
//! subscribed, and unsubscribing cancels whatever is still in flight.
//!
//! ## Services
//!
//! ### HttpService
//!
//! Buffered request/response verbs. Each observable emits one
//! [`HttpResponse`] and completes, or fails with an [`Error`]:
//!
//! ```no_run
//! use futures::StreamExt;
//! use rxhttp::{ClientConfig, HttpModule, RequestOptions};
//!
//! # async fn run() -> Result<(), rxhttp::Error> {
//! let module = HttpModule::register(ClientConfig::new().with_prefix_url("https://api.example.com"))?;
//!
//! let mut responses = module.http().get("users/123", RequestOptions::new()).into_stream();
//! while let Some(response) = responses.next().await {
//!     println!("{}", response?.body);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### PaginationService
//!
//! Walks a paginated resource, following `Link: rel="next"` headers by
//! default. `each` emits items one by one, `all` emits the full collection.
//!
//! ### StreamService
//!
//! Streaming requests. The returned [`StreamRequest`] exposes each event
//! channel (`data`, `response`, `downloadProgress`, ...) as its own
//! observable; an error on the request fails all of them:
//!
//! ```no_run
//! use rxhttp::{BodySource, ClientConfig, FnObserver, HttpModule, RequestOptions};
//!
//! # fn run() -> Result<(), rxhttp::Error> {
//! let module = HttpModule::register(ClientConfig::new().with_prefix_url("https://files.example.com"))?;
//!
//! let upload = module
//!     .stream()
//!     .post("upload", Some(BodySource::path("report.csv")), RequestOptions::new())?;
//! upload.response().subscribe(FnObserver::new(
//!     |head: rxhttp::ResponseHead| println!("status {}", head.status),
//!     |error: rxhttp::SharedError| eprintln!("upload failed: {}", error),
//!     || {},
//! ));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod executor;
pub mod module;
pub mod paginate;
pub mod service;
pub mod stream;
pub mod streaming;
pub mod types;

pub use config::ClientConfig;
pub use error::{Error, SharedError};
pub use executor::{HttpExecutor, ReqwestExecutor};
pub use module::{ConfigFactory, HttpModule};
pub use paginate::{next_link, pages, Pagination, PaginationService};
pub use service::HttpService;
pub use stream::{BodySource, StreamRequest, StreamService};
pub use streaming::{BodyReceiver, EventChannel, StreamEvent, StreamingRequest};
pub use types::{HttpRequest, HttpResponse, Method, Progress, RequestOptions, ResponseHead};

pub use rxhttp_core::{
    AsapScheduler, AsyncScheduler, FnObserver, ImmediateScheduler, Notification, Observable,
    ObservableStream, Observer, SharedScheduler, Subscription,
};
