//! Middleware implementation for reqwest.

use crate::config::DispatcherConfig;
use crate::policy::TransportStatus;
use crate::pool::Pool;
use crate::transport::{build_client, classify};

use anyhow::anyhow;
use async_trait::async_trait;
use log::{info, warn};
use reqwest_middleware::{Error, Middleware, Next, Result};
use std::sync::Arc;

/// Middleware that sends each request through servers of a [`Pool`],
/// applying the same status policy and attempt limit as the
/// [`Dispatcher`](crate::dispatcher::Dispatcher).
#[derive(Clone)]
pub struct PoolMiddleware {
    pool: Arc<dyn Pool>,
    config: Arc<DispatcherConfig>,
}

impl PoolMiddleware {
    pub fn new(pool: Arc<dyn Pool>, config: DispatcherConfig) -> Self {
        Self {
            pool,
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl Middleware for PoolMiddleware {
    async fn handle(
        &self,
        req: reqwest::Request,
        _extensions: &mut http::Extensions,
        _next: Next<'_>,
    ) -> Result<reqwest::Response> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let server = self.pool.select().await.map_err(|e| {
                warn!("No proxy available for {}: {}", req.url(), e);
                Error::Middleware(anyhow!(e))
            })?;

            let proxied_request = req.try_clone().ok_or_else(|| {
                Error::Middleware(anyhow!(
                    "Request object is not cloneable. Are you passing a streaming body?"
                        .to_string()
                ))
            })?;

            let client =
                build_client(&server, self.config.timeout, self.config.accept_invalid_certs);
            let result = match client {
                Ok(client) => client.execute(proxied_request).await,
                Err(e) => Err(e),
            };

            let (transport, status) = match &result {
                Ok(response) => (TransportStatus::Ok, Some(response.status().as_u16())),
                Err(e) => (classify(e), None),
            };
            let decision = self.config.policy.decide(transport, status);
            self.pool
                .adjust(&server, decision.action.adjustment())
                .await
                .map_err(|e| Error::Middleware(anyhow!(e)))?;

            if !decision.action.retry {
                return result.map_err(Error::Reqwest);
            }
            if attempt >= self.config.max_attempts {
                warn!(
                    "Giving up on {} after {} attempts, last via {}: {}",
                    req.url(),
                    attempt,
                    server,
                    transport
                );
                return result.map_err(Error::Reqwest);
            }

            info!(
                "Retrying {} via another proxy (attempt {} via {}: {}, http {:?})",
                req.url(),
                attempt,
                server,
                transport,
                status
            );
        }
    }
}
