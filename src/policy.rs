//! Status-code driven retry and penalty policy.
//!
//! Two tables decide what happens after an attempt: one keyed by the
//! transport outcome, one keyed by the HTTP status. Each table has a default
//! action; an entry for a specific code overrides the default field by field.

use crate::pool::ScoreAdjustment;

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

/// Outcome of the underlying connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportStatus {
    /// The exchange completed and produced an HTTP response.
    Ok,
    /// The proxy (or origin) refused or could not be reached.
    ConnectFailure,
    /// Connect or overall timeout expired.
    Timeout,
    /// TLS handshake failed.
    TlsFailure,
    /// The peer closed the connection without sending a response.
    EmptyResponse,
    /// The connection broke while receiving the response.
    ReceiveFailure,
    /// Any other failure, e.g. an unusable proxy address.
    Other,
}

impl TransportStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, TransportStatus::Ok)
    }
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TransportStatus::Ok => "No error",
            TransportStatus::ConnectFailure => "Couldn't connect to server",
            TransportStatus::Timeout => "Timeout was reached",
            TransportStatus::TlsFailure => "SSL connect error",
            TransportStatus::EmptyResponse => "Server returned nothing",
            TransportStatus::ReceiveFailure => "Failure when receiving data from the peer",
            TransportStatus::Other => "Transport error",
        };
        f.write_str(text)
    }
}

/// A fully populated action.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Action {
    /// How much to penalize the server used for the attempt.
    pub penalty: f64,
    /// Retry the request through a freshly selected server.
    pub retry: bool,
    /// Reset the server's score to 0 instead of penalizing it.
    pub reset_score: bool,
}

impl Action {
    pub const fn new(penalty: f64, retry: bool, reset_score: bool) -> Self {
        Self {
            penalty,
            retry,
            reset_score,
        }
    }

    /// The score change this action asks for.
    pub fn adjustment(&self) -> ScoreAdjustment {
        if self.reset_score {
            ScoreAdjustment::Reset
        } else {
            ScoreAdjustment::Penalize(self.penalty)
        }
    }
}

/// Partial action; unset fields are inherited from the table default.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ActionOverride {
    pub penalty: Option<f64>,
    pub retry: Option<bool>,
    pub reset_score: Option<bool>,
}

impl ActionOverride {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn penalty(mut self, penalty: f64) -> Self {
        self.penalty = Some(penalty);
        self
    }

    pub fn retry(mut self, retry: bool) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn reset_score(mut self, reset: bool) -> Self {
        self.reset_score = Some(reset);
        self
    }

    /// Overlay this override on `base`.
    pub fn apply(&self, base: Action) -> Action {
        Action {
            penalty: self.penalty.unwrap_or(base.penalty),
            retry: self.retry.unwrap_or(base.retry),
            reset_score: self.reset_score.unwrap_or(base.reset_score),
        }
    }
}

impl From<Action> for ActionOverride {
    fn from(action: Action) -> Self {
        Self {
            penalty: Some(action.penalty),
            retry: Some(action.retry),
            reset_score: Some(action.reset_score),
        }
    }
}

/// Mapping from a status code to an action, with a default entry.
#[derive(Debug, Clone)]
pub struct ActionTable<K> {
    default: Action,
    entries: HashMap<K, ActionOverride>,
}

impl<K: Eq + Hash> ActionTable<K> {
    /// Create a table holding only a default action.
    pub fn new(default: Action) -> Self {
        Self {
            default,
            entries: HashMap::new(),
        }
    }

    /// Add or replace the entry for `code`.
    pub fn with(mut self, code: K, entry: impl Into<ActionOverride>) -> Self {
        self.set(code, entry);
        self
    }

    pub fn set(&mut self, code: K, entry: impl Into<ActionOverride>) {
        self.entries.insert(code, entry.into());
    }

    pub fn default_action(&self) -> Action {
        self.default
    }

    /// Effective action for `code`: the exact entry overlaid on the default,
    /// or the default alone.
    pub fn action_for(&self, code: &K) -> Action {
        match self.entries.get(code) {
            Some(entry) => entry.apply(self.default),
            None => self.default,
        }
    }
}

/// Which table decided an attempt's fate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecidedBy {
    Transport,
    Http,
}

/// The action chosen for one completed attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub action: Action,
    pub decided_by: DecidedBy,
}

/// The pair of tables consulted after every attempt.
#[derive(Debug, Clone)]
pub struct StatusPolicy {
    pub transport: ActionTable<TransportStatus>,
    pub http: ActionTable<u16>,
}

impl StatusPolicy {
    /// Classify an attempt.
    ///
    /// The transport table goes first; if it asks for a retry it wins and the
    /// HTTP status is ignored. Otherwise the HTTP table decides.
    pub fn decide(&self, transport: TransportStatus, http_status: Option<u16>) -> Decision {
        let action = self.transport.action_for(&transport);
        if action.retry {
            return Decision {
                action,
                decided_by: DecidedBy::Transport,
            };
        }
        let action = match http_status {
            Some(code) => self.http.action_for(&code),
            None => self.http.default_action(),
        };
        Decision {
            action,
            decided_by: DecidedBy::Http,
        }
    }

    /// Default transport table.
    pub fn default_transport_actions() -> ActionTable<TransportStatus> {
        ActionTable::new(Action::new(1.0, true, false))
            .with(TransportStatus::Ok, Action::new(0.0, false, true))
            .with(TransportStatus::ConnectFailure, ActionOverride::new().penalty(1.5))
            .with(TransportStatus::Timeout, ActionOverride::new().penalty(0.5))
            .with(TransportStatus::TlsFailure, ActionOverride::new().penalty(0.2))
            .with(TransportStatus::EmptyResponse, ActionOverride::new().penalty(0.5))
            // Also seen when a proxy answers "too many requests" mid-transfer.
            .with(TransportStatus::ReceiveFailure, ActionOverride::new().penalty(0.2))
    }

    /// Default HTTP table.
    pub fn default_http_actions() -> ActionTable<u16> {
        ActionTable::new(Action::new(0.0, false, true))
            .with(400, Action::new(1.0, true, false))
            // Not Acceptable, usually a proxy mangling the Accept header.
            .with(406, Action::new(0.2, true, false))
            .with(505, Action::new(0.2, true, false))
    }
}

impl Default for StatusPolicy {
    fn default() -> Self {
        Self {
            transport: Self::default_transport_actions(),
            http: Self::default_http_actions(),
        }
    }
}
