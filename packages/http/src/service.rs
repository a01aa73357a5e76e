//! Request/response verbs as observables.

use std::sync::Arc;

use futures::future::{abortable, Aborted};
use futures::FutureExt;
use rxhttp_core::{adapt, Observable, SharedScheduler, Source};
use tracing::debug;

use crate::error::Error;
use crate::executor::HttpExecutor;
use crate::paginate::PaginationService;
use crate::stream::StreamService;
use crate::types::{HttpResponse, Method, RequestOptions};

/// Buffered HTTP requests, each exposed as a single-value observable.
///
/// Nothing is sent until the returned observable is subscribed.
/// Unsubscribing before the response arrives aborts the request.
#[derive(Clone)]
pub struct HttpService {
    executor: Arc<dyn HttpExecutor>,
    stream: StreamService,
    paginate: PaginationService,
}

impl HttpService {
    pub fn new(executor: Arc<dyn HttpExecutor>) -> Self {
        Self {
            stream: StreamService::new(Arc::clone(&executor)),
            paginate: PaginationService::new(Arc::clone(&executor)),
            executor,
        }
    }

    pub fn stream(&self) -> &StreamService {
        &self.stream
    }

    pub fn paginate(&self) -> &PaginationService {
        &self.paginate
    }

    pub fn get(&self, url: &str, options: RequestOptions) -> Observable<HttpResponse, Error> {
        self.request(Method::GET, url, options, None)
    }

    pub fn post(&self, url: &str, options: RequestOptions) -> Observable<HttpResponse, Error> {
        self.request(Method::POST, url, options, None)
    }

    pub fn put(&self, url: &str, options: RequestOptions) -> Observable<HttpResponse, Error> {
        self.request(Method::PUT, url, options, None)
    }

    pub fn patch(&self, url: &str, options: RequestOptions) -> Observable<HttpResponse, Error> {
        self.request(Method::PATCH, url, options, None)
    }

    pub fn delete(&self, url: &str, options: RequestOptions) -> Observable<HttpResponse, Error> {
        self.request(Method::DELETE, url, options, None)
    }

    pub fn head(&self, url: &str, options: RequestOptions) -> Observable<HttpResponse, Error> {
        self.request(Method::HEAD, url, options, None)
    }

    /// Issue `method` against `url` on `scheduler`, or on the default
    /// scheduler when `None`.
    pub fn request(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
        scheduler: Option<SharedScheduler>,
    ) -> Observable<HttpResponse, Error> {
        let request = options.into_request(method, url);
        let executor = Arc::clone(&self.executor);

        let (response, abort) = abortable(async move { executor.execute(request).await });
        let response = response.map(|result| match result {
            Ok(response) => response,
            Err(Aborted) => Err(Error::Cancelled),
        });

        adapt(
            Source::promise(response),
            scheduler,
            Some(Box::new(move || {
                if !abort.is_aborted() {
                    debug!("aborting request");
                    abort.abort();
                }
            })),
        )
    }
}
