//! Pool over a fixed list of servers that ignores feedback.

use super::storage::Storage;
use super::{Pool, Rotation, ScoreAdjustment, ScoreOutcome};
use crate::error::PoolError;
use crate::server::Server;

use async_trait::async_trait;
use log::info;
use std::path::Path;

/// Immutable list of servers, rotated round-robin.
///
/// Feedback is ignored: nothing is ever penalized, evicted or refreshed.
pub struct FixedPool {
    servers: Vec<Server>,
    rotation: Rotation,
}

impl FixedPool {
    pub fn new(servers: Vec<Server>) -> Self {
        Self {
            servers,
            rotation: Rotation::new(),
        }
    }

    /// Load the list once from a pool file, under a shared lock.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PoolError> {
        let storage = Storage::new(path.as_ref());
        let doc = storage.load()?;
        info!("Loaded {} static proxies from {}", doc.pool.len(), storage.path().display());
        Ok(Self::new(doc.pool))
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }
}

#[async_trait]
impl Pool for FixedPool {
    async fn select(&self) -> Result<Server, PoolError> {
        self.rotation
            .pick(&self.servers)
            .cloned()
            .ok_or(PoolError::Exhausted)
    }

    async fn adjust(
        &self,
        _server: &Server,
        _adjustment: ScoreAdjustment,
    ) -> Result<ScoreOutcome, PoolError> {
        Ok(ScoreOutcome::Score(0.0))
    }

    fn last_refreshed(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }

    async fn refresh(&self) -> Result<usize, PoolError> {
        Ok(0)
    }

    fn len(&self) -> usize {
        self.servers.len()
    }
}
