//! Client configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Error;

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_throw_http_errors() -> bool {
    true
}

/// Settings shared by every request of one module.
///
/// Loadable from JSON; missing fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Base URL that relative request URLs are resolved against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_url: Option<String>,

    /// Headers sent with every request; per-request headers win
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    /// Treat non-2xx responses as errors
    #[serde(default = "default_throw_http_errors")]
    pub throw_http_errors: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            prefix_url: None,
            headers: HashMap::new(),
            timeout_ms: default_timeout_ms(),
            user_agent: None,
            throw_http_errors: default_throw_http_errors(),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_prefix_url(mut self, prefix_url: impl Into<String>) -> Self {
        self.prefix_url = Some(prefix_url.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis().try_into().unwrap_or(u64::MAX);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_throw_http_errors(mut self, throw: bool) -> Self {
        self.throw_http_errors = throw;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.timeout_ms == 0 {
            return Err(Error::Config {
                message: "timeout_ms must be greater than zero".to_string(),
            });
        }
        if let Some(prefix) = &self.prefix_url {
            Url::parse(prefix).map_err(|e| Error::Config {
                message: format!("invalid prefix_url '{}': {}", prefix, e),
            })?;
        }
        Ok(())
    }

    /// Resolve a request URL.
    ///
    /// Absolute URLs are used as given. Anything else is appended to the
    /// prefix URL, so `users/1` and `/users/1` both land under the prefix
    /// path instead of replacing it.
    pub fn resolve_url(&self, url: &str) -> Result<Url, Error> {
        if let Ok(absolute) = Url::parse(url) {
            if !absolute.cannot_be_a_base() {
                return Ok(absolute);
            }
        }

        let prefix = self.prefix_url.as_deref().ok_or_else(|| Error::InvalidUrl {
            message: format!("'{}' is relative and no prefix_url is configured", url),
        })?;

        let mut base = prefix.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        Ok(Url::parse(&base)?.join(url.trim_start_matches('/'))?)
    }
}
