//! Wiring a configuration into ready-to-use services.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::Error;
use crate::executor::{HttpExecutor, ReqwestExecutor};
use crate::paginate::PaginationService;
use crate::service::HttpService;
use crate::stream::StreamService;

/// Produces a [`ClientConfig`] asynchronously, for configuration that has to
/// be fetched or computed before the client exists.
#[async_trait]
pub trait ConfigFactory: Send + Sync {
    async fn create_config(&self) -> Result<ClientConfig, Error>;
}

#[async_trait]
impl ConfigFactory for ClientConfig {
    async fn create_config(&self) -> Result<ClientConfig, Error> {
        Ok(self.clone())
    }
}

/// One configured client and the services built on it.
///
/// Every service of a module shares the same executor. Modules are plain
/// values; build as many as needed, each with its own configuration.
#[derive(Clone)]
pub struct HttpModule {
    id: Uuid,
    config: ClientConfig,
    http: HttpService,
}

impl std::fmt::Debug for HttpModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpModule")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HttpModule {
    /// Build a module backed by reqwest.
    pub fn register(config: ClientConfig) -> Result<Self, Error> {
        let executor = ReqwestExecutor::new(config.clone())?;
        Ok(Self::with_executor(config, Arc::new(executor)))
    }

    /// Build a module from a configuration produced by `factory`.
    pub async fn register_async<F>(factory: &F) -> Result<Self, Error>
    where
        F: ConfigFactory + ?Sized,
    {
        let config = factory.create_config().await?;
        Self::register(config)
    }

    /// Build a module around an existing executor.
    pub fn with_executor(config: ClientConfig, executor: Arc<dyn HttpExecutor>) -> Self {
        let id = Uuid::new_v4();
        debug!(module = %id, prefix_url = ?config.prefix_url, "registering http module");
        Self {
            id,
            config,
            http: HttpService::new(executor),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn http(&self) -> &HttpService {
        &self.http
    }

    pub fn stream(&self) -> &StreamService {
        self.http.stream()
    }

    pub fn paginate(&self) -> &PaginationService {
        self.http.paginate()
    }
}
