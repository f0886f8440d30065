//! Proxy server representation and its persisted JSON schema.

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Proxy type assumed when a record does not name one.
pub const DEFAULT_KIND: &str = "HTTP";

/// Representation of a proxy server.
///
/// Identity is the `ip:port` string returned by [`Server::key`]; two servers
/// with the same address compare equal whatever their scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    /// Address of the proxy, `None` for the direct-connection sentinel.
    #[serde(serialize_with = "false_or_str", deserialize_with = "ip_field")]
    pub ip: Option<String>,
    /// Port of the proxy, `None` for the direct-connection sentinel.
    #[serde(serialize_with = "false_or_port", deserialize_with = "port_field")]
    pub port: Option<u16>,
    /// Accumulated penalty. Never negative.
    #[serde(rename = "failScore", default, deserialize_with = "score_field")]
    pub fail_score: f64,
    /// Proxy type as reported by the source, e.g. "HTTP" or "SOCKS5".
    #[serde(rename = "type", default = "default_kind", deserialize_with = "kind_field")]
    pub kind: String,
}

impl Server {
    /// Create a new HTTP proxy server with a zero score.
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: Some(ip.into()),
            port: Some(port),
            fail_score: 0.0,
            kind: DEFAULT_KIND.to_string(),
        }
    }

    /// The sentinel server that stands for "no proxy, connect directly".
    pub fn direct() -> Self {
        Self {
            ip: None,
            port: None,
            fail_score: 0.0,
            kind: "DIRECT".to_string(),
        }
    }

    /// Set the proxy type.
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Whether requests through this server bypass any proxy.
    pub fn is_direct(&self) -> bool {
        self.ip.is_none()
    }

    /// Identity key used for lookups and deduplication.
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Proxy URL for this server, `None` for direct connections.
    pub fn proxy_url(&self) -> Option<String> {
        let ip = self.ip.as_deref()?;
        let scheme = match self.kind.to_ascii_lowercase().as_str() {
            "socks5" => "socks5",
            "socks5h" => "socks5h",
            "socks4" => "socks4",
            "https" => "https",
            _ => "http",
        };
        Some(match self.port {
            Some(port) => format!("{scheme}://{ip}:{port}"),
            None => format!("{scheme}://{ip}"),
        })
    }

    /// Convert the server into a `reqwest::Proxy`, `None` for direct connections.
    pub fn to_reqwest_proxy(&self) -> Result<Option<reqwest::Proxy>, reqwest::Error> {
        self.proxy_url().map(reqwest::Proxy::all).transpose()
    }
}

impl PartialEq for Server {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}

impl Eq for Server {}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(ip) = self.ip.as_deref() else {
            return f.write_str("direct");
        };
        match self.port {
            Some(port) => write!(f, "{ip}:{port}"),
            None => write!(f, "{ip}:"),
        }
    }
}

fn default_kind() -> String {
    DEFAULT_KIND.to_string()
}

fn false_or_str<S: Serializer>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(s) => serializer.serialize_str(s),
        None => serializer.serialize_bool(false),
    }
}

fn false_or_port<S: Serializer>(value: &Option<u16>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(p) => serializer.serialize_u16(*p),
        None => serializer.serialize_bool(false),
    }
}

fn ip_field<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null | Value::Bool(false) => Ok(None),
        Value::String(s) if s.is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s)),
        other => Err(de::Error::custom(format!("invalid ip: {other}"))),
    }
}

fn port_field<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u16>, D::Error> {
    let port = match Value::deserialize(deserializer)? {
        Value::Null | Value::Bool(false) => return Ok(None),
        Value::String(s) if s.trim().is_empty() => return Ok(None),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    };
    port.and_then(|p| u16::try_from(p).ok())
        .map(Some)
        .ok_or_else(|| de::Error::custom("port must be an integer in 0..=65535"))
}

fn score_field<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    let score = match Value::deserialize(deserializer)? {
        Value::Null | Value::Bool(false) => 0.0,
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse::<f64>().map_err(de::Error::custom)?,
        other => return Err(de::Error::custom(format!("invalid failScore: {other}"))),
    };
    Ok(if score.is_finite() { score.max(0.0) } else { 0.0 })
}

fn kind_field<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) if !s.is_empty() => Ok(s),
        _ => Ok(default_kind()),
    }
}
