//! Error types for the rotating-proxy-pool crate.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by a [`Pool`](crate::pool::Pool).
#[derive(Debug, Error)]
pub enum PoolError {
    /// No server is left and a refresh from the source yielded none.
    #[error("No proxy available in pool and refresh yielded none")]
    Exhausted,

    /// The backing file could not be opened, locked or written.
    #[error("Cannot open or lock pool file {}: {source}", .path.display())]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The backing file does not hold a valid pool document.
    #[error("Cannot decode pool file {} ({bytes} bytes read): {source}", .path.display())]
    CorruptState {
        path: PathBuf,
        bytes: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised by a [`ProxySource`](crate::source::ProxySource).
///
/// These never escape a pool refresh; they are logged and the refresh
/// proceeds as if the source returned nothing.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP error while fetching proxies: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error while reading proxies: {0}")]
    Io(#[from] io::Error),

    #[error("Proxy source unavailable: {0}")]
    Unavailable(String),
}

/// Errors that make a whole dispatch batch impossible.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Cannot start dispatch runtime: {0}")]
    Runtime(#[source] io::Error),
}
