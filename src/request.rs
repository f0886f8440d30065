//! Requests handled by the dispatcher and the results recorded on them.

use crate::policy::TransportStatus;
use crate::server::Server;

use http::{HeaderMap, Method, StatusCode};
use std::borrow::Cow;
use std::ops::Index;
use url::Url;

/// One unit of work.
///
/// Method, URL, body and user agent are fixed at creation. The remaining
/// fields are filled in by the dispatcher and describe the last attempt.
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: Url,
    body: Option<Vec<u8>>,
    user_agent: Option<String>,

    pub(crate) proxy: Option<Server>,
    pub(crate) transport_status: Option<TransportStatus>,
    pub(crate) transport_message: Option<String>,
    pub(crate) response_status: Option<StatusCode>,
    pub(crate) response_headers: HeaderMap,
    pub(crate) response_body: Vec<u8>,
    pub(crate) attempts: usize,
    pub(crate) gave_up: bool,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            body: None,
            user_agent: None,
            proxy: None,
            transport_status: None,
            transport_message: None,
            response_status: None,
            response_headers: HeaderMap::new(),
            response_body: Vec::new(),
            attempts: 0,
            gave_up: false,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: Url, body: impl Into<Vec<u8>>) -> Self {
        Self::new(Method::POST, url).with_body(body)
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    /// Server used by the last attempt.
    pub fn proxy(&self) -> Option<&Server> {
        self.proxy.as_ref()
    }

    pub fn transport_status(&self) -> Option<TransportStatus> {
        self.transport_status
    }

    /// Human readable detail of the transport outcome.
    pub fn transport_message(&self) -> Option<&str> {
        self.transport_message.as_deref()
    }

    pub fn response_status(&self) -> Option<StatusCode> {
        self.response_status
    }

    pub fn response_headers(&self) -> &HeaderMap {
        &self.response_headers
    }

    pub fn response_body(&self) -> &[u8] {
        &self.response_body
    }

    pub fn response_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.response_body)
    }

    /// Number of attempts made, the first one included.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Whether the request stopped because it hit the attempt limit while
    /// the policy still asked for a retry.
    pub fn gave_up(&self) -> bool {
        self.gave_up
    }
}

/// Handle to a queued request: its position in the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub(crate) usize);

/// Settled requests, in the order they were queued.
#[derive(Debug, Default)]
pub struct Batch {
    pub(crate) requests: Vec<Request>,
}

impl Batch {
    pub fn get(&self, id: RequestId) -> Option<&Request> {
        self.requests.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Request> {
        self.requests.iter()
    }

    pub fn into_requests(self) -> Vec<Request> {
        self.requests
    }
}

impl Index<RequestId> for Batch {
    type Output = Request;

    fn index(&self, id: RequestId) -> &Request {
        &self.requests[id.0]
    }
}

impl IntoIterator for Batch {
    type Item = Request;
    type IntoIter = std::vec::IntoIter<Request>;

    fn into_iter(self) -> Self::IntoIter {
        self.requests.into_iter()
    }
}
