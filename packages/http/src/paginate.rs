//! Paginated GETs as observables.
//!
//! A [`Pagination`] tells the cursor how to pull items out of a page and
//! how to build the request for the next page. The default follows the
//! `Link: <...>; rel="next"` response header and expects each page body to
//! be a JSON array.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use rxhttp_core::{dispatch, AsapScheduler, Observable, SharedScheduler, Source};
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::Error;
use crate::executor::HttpExecutor;
use crate::types::{HttpRequest, HttpResponse, RequestOptions};

/// Extracts the items of one page.
pub type ItemsFn = Arc<dyn Fn(&HttpResponse) -> Result<Vec<Value>, Error> + Send + Sync>;

/// Builds the request for the page after `response`, or `None` on the last page.
pub type NextFn = Arc<dyn Fn(&HttpResponse, &HttpRequest) -> Option<HttpRequest> + Send + Sync>;

/// Keeps or drops one item.
pub type FilterFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Default cap on page requests per pagination.
pub const DEFAULT_REQUEST_LIMIT: usize = 10_000;

/// How to walk a paginated resource.
#[derive(Clone)]
pub struct Pagination {
    options: RequestOptions,
    items: ItemsFn,
    next: NextFn,
    filter: Option<FilterFn>,
    count_limit: Option<usize>,
    request_limit: usize,
}

impl fmt::Debug for Pagination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pagination")
            .field("options", &self.options)
            .field("filter", &self.filter.is_some())
            .field("count_limit", &self.count_limit)
            .field("request_limit", &self.request_limit)
            .finish_non_exhaustive()
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            options: RequestOptions::default(),
            items: Arc::new(body_items),
            next: Arc::new(link_next),
            filter: None,
            count_limit: None,
            request_limit: DEFAULT_REQUEST_LIMIT,
        }
    }
}

impl Pagination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for the first request. Later requests come from the next-page
    /// callback.
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_items<F>(mut self, items: F) -> Self
    where
        F: Fn(&HttpResponse) -> Result<Vec<Value>, Error> + Send + Sync + 'static,
    {
        self.items = Arc::new(items);
        self
    }

    pub fn with_next<F>(mut self, next: F) -> Self
    where
        F: Fn(&HttpResponse, &HttpRequest) -> Option<HttpRequest> + Send + Sync + 'static,
    {
        self.next = Arc::new(next);
        self
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Stop after this many items.
    pub fn with_count_limit(mut self, limit: usize) -> Self {
        self.count_limit = Some(limit);
        self
    }

    /// Stop after this many page requests.
    pub fn with_request_limit(mut self, limit: usize) -> Self {
        self.request_limit = limit;
        self
    }
}

fn body_items(response: &HttpResponse) -> Result<Vec<Value>, Error> {
    match &response.body {
        Value::Array(items) => Ok(items.clone()),
        other => Err(Error::Pagination {
            message: format!("page body is not a JSON array: {}", other),
        }),
    }
}

fn link_next(response: &HttpResponse, request: &HttpRequest) -> Option<HttpRequest> {
    let url = next_link(response.header("link")?)?;
    Some(HttpRequest {
        url: url.to_string(),
        // The link carries its own query string.
        query: Default::default(),
        ..request.clone()
    })
}

/// Target of the `rel="next"` entry of a `Link` header.
pub fn next_link(header: &str) -> Option<&str> {
    header.split(',').find_map(|entry| {
        let mut parts = entry.split(';');
        let target = parts.next()?.trim();
        let target = target.strip_prefix('<')?.strip_suffix('>')?;
        let is_next = parts.any(|param| {
            let Some((name, value)) = param.split_once('=') else {
                return false;
            };
            name.trim().eq_ignore_ascii_case("rel")
                && value
                    .trim()
                    .trim_matches('"')
                    .split_ascii_whitespace()
                    .any(|rel| rel.eq_ignore_ascii_case("next"))
        });
        is_next.then_some(target)
    })
}

struct Cursor {
    executor: Arc<dyn HttpExecutor>,
    pagination: Pagination,
    next: Option<HttpRequest>,
    buffer: VecDeque<Value>,
    requests: usize,
    emitted: usize,
    done: bool,
}

impl Cursor {
    async fn advance(&mut self) -> Option<Result<Value, Error>> {
        loop {
            if self.done {
                return None;
            }
            if self
                .pagination
                .count_limit
                .is_some_and(|limit| self.emitted >= limit)
            {
                debug!(emitted = self.emitted, "pagination count limit reached");
                self.done = true;
                return None;
            }
            if let Some(item) = self.buffer.pop_front() {
                self.emitted += 1;
                return Some(Ok(item));
            }

            let Some(request) = self.next.take() else {
                self.done = true;
                return None;
            };
            if self.requests >= self.pagination.request_limit {
                debug!(requests = self.requests, "pagination request limit reached");
                self.done = true;
                return None;
            }
            self.requests += 1;

            trace!(url = %request.url, page = self.requests, "fetching page");
            let page = match self.executor.execute(request.clone()).await {
                Ok(response) => (self.pagination.items)(&response).map(|items| (items, response)),
                Err(e) => Err(e),
            };
            let (items, response) = match page {
                Ok(page) => page,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            match &self.pagination.filter {
                Some(keep) => self.buffer.extend(items.into_iter().filter(|item| keep(item))),
                None => self.buffer.extend(items),
            }
            self.next = (self.pagination.next)(&response, &request);
        }
    }
}

/// Items of every page, fetched one page at a time as they are pulled.
pub fn pages(
    executor: Arc<dyn HttpExecutor>,
    url: &str,
    pagination: Pagination,
) -> BoxStream<'static, Result<Value, Error>> {
    let first = pagination.options.clone().into_request(Default::default(), url);
    let cursor = Cursor {
        executor,
        pagination,
        next: Some(first),
        buffer: VecDeque::new(),
        requests: 0,
        emitted: 0,
        done: false,
    };

    stream::unfold(cursor, |mut cursor| async move {
        let item = cursor.advance().await?;
        Some((item, cursor))
    })
    .boxed()
}

/// Paginated requests as observables.
#[derive(Clone)]
pub struct PaginationService {
    executor: Arc<dyn HttpExecutor>,
}

impl PaginationService {
    pub fn new(executor: Arc<dyn HttpExecutor>) -> Self {
        Self { executor }
    }

    /// Emit items one by one across pages. Runs on the [`AsapScheduler`]
    /// unless another scheduler is given.
    pub fn each(
        &self,
        url: &str,
        pagination: Pagination,
        scheduler: Option<SharedScheduler>,
    ) -> Observable<Value, Error> {
        let items = pages(Arc::clone(&self.executor), url, pagination);
        dispatch(Source::sequence(items), or_asap(scheduler), None)
    }

    /// Emit every item of every page as one collection.
    pub fn all(
        &self,
        url: &str,
        pagination: Pagination,
        scheduler: Option<SharedScheduler>,
    ) -> Observable<Vec<Value>, Error> {
        let items = pages(Arc::clone(&self.executor), url, pagination).try_collect::<Vec<_>>();
        dispatch(Source::promise(items), or_asap(scheduler), None)
    }
}

fn or_asap(scheduler: Option<SharedScheduler>) -> SharedScheduler {
    scheduler.unwrap_or_else(|| Arc::new(AsapScheduler::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::MockExecutor;
    use serde_json::json;

    fn page(body: Value, link: Option<&str>) -> HttpResponse {
        let mut response = MockExecutor::success_response(body);
        if let Some(link) = link {
            response.headers.insert("link".to_string(), link.to_string());
        }
        response
    }

    fn three_pages() -> MockExecutor {
        MockExecutor::new()
            .with_response("items", page(json!([1, 2]), Some(r#"<items?page=2>; rel="next""#)))
            .with_response("items?page=2", page(json!([3]), Some(r#"<items?page=3>; rel="next""#)))
            .with_response("items?page=3", page(json!([4, 5]), None))
    }

    fn service(executor: &MockExecutor) -> PaginationService {
        PaginationService::new(Arc::new(executor.clone()))
    }

    #[test]
    fn parses_next_link() {
        let header = r#"<https://api.test/items?page=3>; rel="last", <https://api.test/items?page=2>; rel="next""#;
        assert_eq!(next_link(header), Some("https://api.test/items?page=2"));
        assert_eq!(next_link(r#"<a>; rel="prev next""#), Some("a"));
        assert_eq!(next_link(r#"<a>; rel="prev""#), None);
        assert_eq!(next_link("garbage"), None);
    }

    #[tokio::test]
    async fn each_streams_items_across_pages() {
        let executor = three_pages();
        let items: Vec<_> = service(&executor)
            .each("items", Pagination::new(), None)
            .into_stream()
            .map(Result::unwrap)
            .collect()
            .await;

        assert_eq!(items, vec![json!(1), json!(2), json!(3), json!(4), json!(5)]);
        assert_eq!(executor.recorded_requests().len(), 3);
    }

    #[tokio::test]
    async fn all_collects_every_page() {
        let executor = three_pages();
        let items: Vec<_> = service(&executor)
            .all("items", Pagination::new(), None)
            .into_stream()
            .collect()
            .await;

        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].as_ref().unwrap(),
            &vec![json!(1), json!(2), json!(3), json!(4), json!(5)]
        );
    }

    #[tokio::test]
    async fn count_limit_stops_without_fetching_further_pages() {
        let executor = three_pages();
        let items: Vec<_> = service(&executor)
            .each("items", Pagination::new().with_count_limit(2), None)
            .into_stream()
            .map(Result::unwrap)
            .collect()
            .await;

        assert_eq!(items, vec![json!(1), json!(2)]);
        assert_eq!(executor.recorded_requests().len(), 1);
    }

    #[tokio::test]
    async fn request_limit_caps_pages() {
        let executor = three_pages();
        let items: Vec<_> = service(&executor)
            .each("items", Pagination::new().with_request_limit(2), None)
            .into_stream()
            .map(Result::unwrap)
            .collect()
            .await;

        assert_eq!(items, vec![json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn custom_items_next_and_filter() {
        let executor = MockExecutor::new()
            .with_response("feed", page(json!({"data": [1, 2, 3], "more": true}), None))
            .with_response("feed?cursor=b", page(json!({"data": [4, 5, 6], "more": false}), None));

        let pagination = Pagination::new()
            .with_items(|response| Ok(response.body["data"].as_array().cloned().unwrap_or_default()))
            .with_next(|response, request| {
                response.body["more"]
                    .as_bool()
                    .unwrap_or(false)
                    .then(|| HttpRequest {
                        url: format!("{}?cursor=b", request.url),
                        ..request.clone()
                    })
            })
            .with_filter(|item| item.as_i64().is_some_and(|n| n % 2 == 0));

        let items: Vec<_> = service(&executor)
            .each("feed", pagination, None)
            .into_stream()
            .map(Result::unwrap)
            .collect()
            .await;

        assert_eq!(items, vec![json!(2), json!(4), json!(6)]);
    }

    #[tokio::test]
    async fn failing_page_errors_after_earlier_items() {
        let executor = MockExecutor::new()
            .with_response("items", page(json!([1]), Some("<broken>; rel=next")));

        let items: Vec<_> = service(&executor)
            .each("items", Pagination::new(), None)
            .into_stream()
            .collect()
            .await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &json!(1));
        assert!(matches!(items[1], Err(Error::Status { status: 404, .. })));
    }

    #[tokio::test]
    async fn non_array_body_is_a_pagination_error() {
        let executor =
            MockExecutor::new().with_response("items", page(json!({"not": "a list"}), None));

        let items: Vec<_> = service(&executor)
            .all("items", Pagination::new(), None)
            .into_stream()
            .collect()
            .await;

        assert!(matches!(items[..], [Err(Error::Pagination { .. })]));
    }

    #[tokio::test]
    async fn first_request_uses_options() {
        let executor = MockExecutor::new().with_response("items", page(json!([]), None));
        let pagination =
            Pagination::new().with_options(RequestOptions::new().with_header("x-page", "first"));

        let _: Vec<_> = service(&executor)
            .each("items", pagination, None)
            .into_stream()
            .collect()
            .await;

        let recorded = executor.recorded_requests();
        assert_eq!(
            recorded[0].headers.get("x-page").map(String::as_str),
            Some("first")
        );
    }
}
