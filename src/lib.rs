//! # rotating-proxy-pool
//!
//! Route outbound HTTP requests through a rotating set of upstream proxies.
//!
//! A [`Pool`] hands out servers round-robin and scores them from feedback;
//! the persistent [`FilePool`] keeps its scores in a locked JSON file that
//! several processes can share, evicts servers whose score reaches a limit
//! and replenishes itself from a [`ProxySource`]. The [`Dispatcher`] runs a
//! batch of requests concurrently, classifies every attempt with a
//! [`StatusPolicy`] and retries failed ones through another server.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod middleware;
pub mod policy;
pub mod pool;
pub mod request;
pub mod server;
pub mod source;
mod transport;

pub use config::{DispatcherConfig, DispatcherConfigBuilder, RefreshPolicy};
pub use dispatcher::Dispatcher;
pub use error::{Error, PoolError, SourceError};
pub use middleware::PoolMiddleware;
pub use policy::{Action, ActionOverride, ActionTable, StatusPolicy, TransportStatus};
pub use pool::{
    DirectPool, FilePool, FilePoolBuilder, FixedPool, Pool, Rotation, ScoreAdjustment, ScoreOutcome,
};
pub use request::{Batch, Request, RequestId};
pub use server::Server;
pub use source::{Fetched, ListSource, ProxySource};
pub use transport::classify;
