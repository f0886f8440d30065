//! Pools of proxy servers.
//!
//! A [`Pool`] hands out servers and takes feedback about them. Three variants
//! exist: [`DirectPool`] always answers with the no-proxy sentinel,
//! [`FixedPool`] serves an immutable list, and [`FilePool`] keeps a scored,
//! evicting list in a locked JSON file refreshed from a
//! [`ProxySource`](crate::source::ProxySource).

mod direct;
mod file;
mod fixed;
pub mod storage;

pub use direct::DirectPool;
pub use file::{FilePool, FilePoolBuilder};
pub use fixed::FixedPool;

use crate::config::RefreshPolicy;
use crate::error::PoolError;
use crate::server::Server;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Change applied to a server's fail score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreAdjustment {
    /// Add this amount. Zero leaves the score untouched.
    Penalize(f64),
    /// Set the score back to 0.
    Reset,
}

/// Result of a score adjustment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreOutcome {
    /// The server is still in the pool with this score.
    Score(f64),
    /// The server is not in the pool (evicted now or earlier).
    Removed,
}

impl ScoreOutcome {
    pub fn score(&self) -> Option<f64> {
        match self {
            ScoreOutcome::Score(s) => Some(*s),
            ScoreOutcome::Removed => None,
        }
    }
}

/// A source of proxy servers that learns from feedback.
#[async_trait]
pub trait Pool: Send + Sync {
    /// Choose a server.
    async fn select(&self) -> Result<Server, PoolError>;

    /// Penalize or reset `server`. Both go through here so a single call
    /// takes a single lock.
    async fn adjust(
        &self,
        server: &Server,
        adjustment: ScoreAdjustment,
    ) -> Result<ScoreOutcome, PoolError>;

    /// Add `amount` to the server's fail score, evicting it if it reaches the
    /// pool's limit.
    async fn penalize(&self, server: &Server, amount: f64) -> Result<ScoreOutcome, PoolError> {
        self.adjust(server, ScoreAdjustment::Penalize(amount)).await
    }

    /// Set the server's fail score to 0.
    async fn reset(&self, server: &Server) -> Result<ScoreOutcome, PoolError> {
        self.adjust(server, ScoreAdjustment::Reset).await
    }

    /// Unix timestamp of the last refresh, 0 if never.
    fn last_refreshed(&self) -> i64;

    /// Pull fresh servers unconditionally. Returns how many new keys were added.
    async fn refresh(&self) -> Result<usize, PoolError>;

    /// Number of servers currently held.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refresh if the pool is small and stale. Returns whether a refresh ran.
    async fn auto_refresh(&self, policy: RefreshPolicy) -> Result<bool, PoolError> {
        if self.len() > policy.max_count {
            return Ok(false);
        }
        let age = chrono::Utc::now().timestamp() - self.last_refreshed();
        if age <= policy.max_age.as_secs() as i64 {
            return Ok(false);
        }
        self.refresh().await?;
        Ok(true)
    }
}

/// Round-robin cursor with a random starting point.
///
/// The cursor lives only in this process. It is placed at a random index on
/// first use, then advances by one per pick and wraps to 0 once it runs past
/// the end, which also covers a list that shrank between picks.
pub struct Rotation {
    cursor: Mutex<Option<usize>>,
    rng: Mutex<StdRng>,
}

impl Rotation {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    /// Reproducible starting point.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    /// Start at a fixed index instead of a random one.
    pub fn starting_at(index: usize) -> Self {
        let rotation = Self::new();
        *rotation.cursor.lock() = Some(index);
        rotation
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            cursor: Mutex::new(None),
            rng: Mutex::new(rng),
        }
    }

    /// Index to use for a list of `len` entries, `None` if it is empty.
    pub fn next_index(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let mut cursor = self.cursor.lock();
        let idx = match *cursor {
            None => self.rng.lock().random_range(0..len),
            Some(i) if i >= len => 0,
            Some(i) => i,
        };
        *cursor = Some(idx + 1);
        Some(idx)
    }

    pub fn pick<'a>(&self, servers: &'a [Server]) -> Option<&'a Server> {
        self.next_index(servers.len()).map(|idx| &servers[idx])
    }
}

impl Default for Rotation {
    fn default() -> Self {
        Self::new()
    }
}
