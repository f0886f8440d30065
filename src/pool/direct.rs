//! Pass-through pool: every request goes out without a proxy.

use super::{Pool, ScoreAdjustment, ScoreOutcome};
use crate::error::PoolError;
use crate::server::Server;

use async_trait::async_trait;

/// Pool holding only the no-proxy sentinel, so requests go out directly
/// through the same code path as proxied ones.
#[derive(Debug, Clone)]
pub struct DirectPool {
    server: Server,
}

impl DirectPool {
    pub fn new() -> Self {
        Self {
            server: Server::direct(),
        }
    }
}

impl Default for DirectPool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Pool for DirectPool {
    async fn select(&self) -> Result<Server, PoolError> {
        Ok(self.server.clone())
    }

    async fn adjust(
        &self,
        _server: &Server,
        _adjustment: ScoreAdjustment,
    ) -> Result<ScoreOutcome, PoolError> {
        Ok(ScoreOutcome::Score(0.0))
    }

    /// Always "now", so auto refresh never fires.
    fn last_refreshed(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }

    async fn refresh(&self) -> Result<usize, PoolError> {
        Ok(0)
    }

    fn len(&self) -> usize {
        1
    }
}
