//! Configuration for the dispatcher and pool refreshes.

use crate::policy::{ActionTable, StatusPolicy, TransportStatus};
use std::time::Duration;

/// When [`Pool::auto_refresh`](crate::pool::Pool::auto_refresh) fetches new servers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefreshPolicy {
    /// Refresh only if the pool holds this many servers or fewer.
    pub max_count: usize,
    /// Refresh only if the last refresh is older than this.
    pub max_age: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            max_count: 3,
            max_age: Duration::from_secs(24 * 3600),
        }
    }
}

/// Configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Connect timeout and overall timeout of every attempt.
    pub timeout: Duration,
    /// Log every completed attempt at info level instead of debug.
    pub verbose: bool,
    /// Retry and penalty tables.
    pub policy: StatusPolicy,
    /// Maximum attempts per request, the first one included.
    pub max_attempts: usize,
    /// Skip TLS certificate and hostname verification.
    pub accept_invalid_certs: bool,
}

impl DispatcherConfig {
    /// Create a new configuration builder.
    pub fn builder() -> DispatcherConfigBuilder {
        DispatcherConfigBuilder::new()
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfigBuilder::new().build()
    }
}

/// Builder for `DispatcherConfig`.
pub struct DispatcherConfigBuilder {
    timeout: Option<Duration>,
    verbose: bool,
    transport_actions: Option<ActionTable<TransportStatus>>,
    http_actions: Option<ActionTable<u16>>,
    max_attempts: Option<usize>,
    accept_invalid_certs: bool,
}

impl DispatcherConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            timeout: None,
            verbose: false,
            transport_actions: None,
            http_actions: None,
            max_attempts: None,
            accept_invalid_certs: false,
        }
    }

    /// Set the connect and overall timeout of each attempt.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Log one line per completed attempt at info level.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Replace the transport status table.
    pub fn transport_actions(mut self, table: ActionTable<TransportStatus>) -> Self {
        self.transport_actions = Some(table);
        self
    }

    /// Replace the HTTP status table.
    pub fn http_actions(mut self, table: ActionTable<u16>) -> Self {
        self.http_actions = Some(table);
        self
    }

    /// Replace both tables.
    pub fn policy(mut self, policy: StatusPolicy) -> Self {
        self.transport_actions = Some(policy.transport);
        self.http_actions = Some(policy.http);
        self
    }

    /// Cap the attempts per request. Values below 1 are raised to 1.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    /// Skip TLS certificate verification, as many free proxies require.
    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> DispatcherConfig {
        DispatcherConfig {
            timeout: self.timeout.unwrap_or(Duration::from_secs(60)),
            verbose: self.verbose,
            policy: StatusPolicy {
                transport: self
                    .transport_actions
                    .unwrap_or_else(StatusPolicy::default_transport_actions),
                http: self.http_actions.unwrap_or_else(StatusPolicy::default_http_actions),
            },
            max_attempts: self.max_attempts.unwrap_or(10),
            accept_invalid_certs: self.accept_invalid_certs,
        }
    }
}

impl Default for DispatcherConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
