use std::sync::Arc;
use std::time::Duration;

use crate::config::BackendConfig;
use crate::proxy::backend::{Backend, BackendError};
use crate::proxy::balancer::RoundRobinBalancer;
use crate::proxy::handler::ProxyHandler;
use crate::proxy::pool::{BackendPool, DEFAULT_HEALTH_INTERVAL};

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("at least one backend is required")]
    NoBackends,

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// One configured route: the backend pool, the balancer walking it, and
/// the handler forwarding to it.
pub struct RouteProxy {
    pool: Arc<BackendPool>,
    handler: Arc<ProxyHandler>,
}

impl RouteProxy {
    pub fn new(backends: &[BackendConfig], timeout: Duration) -> Result<Self, RouteError> {
        Self::with_health_interval(backends, timeout, DEFAULT_HEALTH_INTERVAL)
    }

    pub fn with_health_interval(
        backends: &[BackendConfig],
        timeout: Duration,
        health_interval: Duration,
    ) -> Result<Self, RouteError> {
        if backends.is_empty() {
            return Err(RouteError::NoBackends);
        }

        let backends = backends
            .iter()
            .map(|backend| Backend::new(&backend.url, backend.weight).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        let pool = Arc::new(BackendPool::new(backends, health_interval));
        let balancer = Arc::new(RoundRobinBalancer::new(Arc::clone(&pool)));
        let handler = Arc::new(ProxyHandler::new(balancer, timeout));

        Ok(Self { pool, handler })
    }

    /// Boots the pool's health loop, running the first round before
    /// returning.
    pub async fn start(&self) {
        Arc::clone(&self.pool).start().await;
    }

    pub fn stop(&self) {
        self.pool.stop();
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    pub fn handler(&self) -> Arc<ProxyHandler> {
        Arc::clone(&self.handler)
    }
}
