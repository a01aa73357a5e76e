use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// HTTP method for requests
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    GET,
    POST,
    PUT,
    DELETE,
    PATCH,
    HEAD,
    OPTIONS,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::PATCH => "PATCH",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
        }
    }

    /// Whether a streaming request with this verb uploads a body that must be
    /// ended before the request is complete.
    pub fn bears_body(&self) -> bool {
        matches!(
            self,
            Method::POST | Method::PUT | Method::PATCH | Method::DELETE
        )
    }
}

impl From<Method> for http::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::GET => http::Method::GET,
            Method::POST => http::Method::POST,
            Method::PUT => http::Method::PUT,
            Method::DELETE => http::Method::DELETE,
            Method::PATCH => http::Method::PATCH,
            Method::HEAD => http::Method::HEAD,
            Method::OPTIONS => http::Method::OPTIONS,
        }
    }
}

/// A fully described HTTP request
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct HttpRequest {
    #[serde(default)]
    pub method: Method,

    /// Absolute URL, or a path resolved against the configured prefix URL
    #[serde(default)]
    pub url: String,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub query: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Request body (will be JSON-serialized)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }
}

/// Per-call request options for the service verbs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub json: Option<serde_json::Value>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_json(mut self, body: impl Serialize) -> Result<Self, serde_json::Error> {
        self.json = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn into_request(self, method: Method, url: impl Into<String>) -> HttpRequest {
        HttpRequest {
            method,
            url: url.into(),
            query: self.query,
            headers: self.headers,
            body: self.json,
        }
    }
}

/// HTTP response from a request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpResponse {
    pub status: u16,

    /// Status text (e.g., "OK", "Not Found")
    pub status_text: String,

    /// Final URL of the response, after redirects
    #[serde(default)]
    pub url: String,

    /// Response headers, names lowercased
    pub headers: HashMap<String, String>,

    /// Response body as JSON value
    /// Will be null if body was empty or not valid JSON
    pub body: serde_json::Value,

    /// Raw body as string (useful when body isn't JSON)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_text: Option<String>,
}

impl HttpResponse {
    /// Check if the response status indicates success (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Try to deserialize the body into a specific type
    pub fn json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.body.clone())
    }
}

/// Status line and headers of a streamed response, emitted before its body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseHead {
    pub status: u16,
    pub status_text: String,
    pub url: String,
    pub headers: HashMap<String, String>,
}

impl ResponseHead {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Bytes moved so far in one direction of a streaming request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Progress {
    pub transferred: u64,
    /// Expected total, when the peer announced one
    pub total: Option<u64>,
}

impl Progress {
    pub fn new(transferred: u64, total: Option<u64>) -> Self {
        Self { transferred, total }
    }

    /// Fraction done in `0.0..=1.0`; `0.0` while the total is unknown.
    pub fn percent(&self) -> f64 {
        match self.total {
            Some(0) => 1.0,
            Some(total) => (self.transferred as f64 / total as f64).min(1.0),
            None => 0.0,
        }
    }
}
