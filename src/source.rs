//! Feeds that replenish a persistent pool with fresh servers.

use crate::error::SourceError;
use crate::server::Server;

use async_trait::async_trait;
use log::{info, warn};
use reqwest::Client;

/// Servers produced by one fetch.
#[derive(Debug, Clone, Default)]
pub struct Fetched {
    /// Candidate servers, newest first when the source knows their age.
    pub servers: Vec<Server>,
    /// Unix timestamp of the newest entry seen. Becomes the next `since`.
    pub newest: i64,
}

/// A supplier of candidate proxy servers.
#[async_trait]
pub trait ProxySource: Send + Sync {
    /// Name under which the source keeps its bookkeeping in the pool's `meta`.
    fn name(&self) -> &str;

    /// Fetch servers newer than the `since` unix timestamp.
    async fn fetch(&self, since: i64) -> Result<Fetched, SourceError>;
}

/// Plain-text proxy lists, one `ip:port` or `scheme://ip:port` per line,
/// fetched from HTTP(S) URLs or local files.
///
/// Lists carry no per-entry age, so every fetch returns the whole list and
/// reports the fetch time as its newest timestamp.
pub struct ListSource {
    name: String,
    locations: Vec<String>,
    client: Client,
}

impl ListSource {
    pub fn new(name: impl Into<String>, locations: Vec<impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            locations: locations.into_iter().map(Into::into).collect(),
            client: Client::new(),
        }
    }

    /// Use a preconfigured client for HTTP locations.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    async fn read_location(&self, location: &str) -> Result<String, SourceError> {
        if location.starts_with("http://") || location.starts_with("https://") {
            let response = self.client.get(location).send().await?.error_for_status()?;
            Ok(response.text().await?)
        } else {
            Ok(tokio::fs::read_to_string(location).await?)
        }
    }
}

#[async_trait]
impl ProxySource for ListSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, _since: i64) -> Result<Fetched, SourceError> {
        let mut servers = Vec::new();
        let mut failures = 0;

        for location in &self.locations {
            match self.read_location(location).await {
                Ok(content) => {
                    let parsed = parse_proxy_list(&content);
                    info!("Fetched {} proxies from {}", parsed.len(), location);
                    servers.extend(parsed);
                }
                Err(e) => {
                    warn!("Failed to fetch proxies from {}: {}", location, e);
                    failures += 1;
                }
            }
        }

        if failures > 0 && failures == self.locations.len() {
            return Err(SourceError::Unavailable(format!(
                "all {} locations of {} failed",
                failures, self.name
            )));
        }

        Ok(Fetched {
            servers,
            newest: chrono::Utc::now().timestamp(),
        })
    }
}

/// Parse the text content of a proxy list.
pub(crate) fn parse_proxy_list(content: &str) -> Vec<Server> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let (kind, address) = match line.split_once("://") {
                Some((scheme, rest)) => (scheme.to_ascii_uppercase(), rest),
                None => ("HTTP".to_string(), line),
            };
            let address = address.trim_end_matches('/');
            let (ip, port) = address.rsplit_once(':')?;
            let port = port.parse::<u16>().ok()?;
            if ip.is_empty() {
                return None;
            }
            Some(Server::new(ip, port).with_kind(kind))
        })
        .collect()
}
