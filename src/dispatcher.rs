//! Concurrent execution of queued requests through a pool.
//!
//! [`Dispatcher::run`] drives every queued request at once on a single task.
//! Attempts sit in one `FuturesUnordered`; whenever one completes it is
//! classified with the [`StatusPolicy`](crate::policy::StatusPolicy), the
//! server that carried it is penalized or reset, and if a retry is called for
//! a new attempt through a freshly selected server joins the same set.

use crate::config::DispatcherConfig;
use crate::error::Error;
use crate::policy::TransportStatus;
use crate::pool::{DirectPool, Pool, ScoreOutcome};
use crate::request::{Batch, Request, RequestId};
use crate::transport::{build_client, classify};

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use http::header::USER_AGENT;
use http::{HeaderMap, Method, StatusCode};
use log::{debug, info, Level};
use std::sync::Arc;
use url::Url;

type Attempt = BoxFuture<'static, (usize, Exchange)>;

/// What one attempt produced.
struct Exchange {
    transport: TransportStatus,
    message: String,
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl Exchange {
    fn failed(err: &reqwest::Error, status: Option<StatusCode>, headers: HeaderMap) -> Self {
        Self {
            transport: classify(err),
            message: err.to_string(),
            status,
            headers,
            body: Vec::new(),
        }
    }
}

/// Runs batches of requests through servers chosen by a [`Pool`].
pub struct Dispatcher {
    pool: Arc<dyn Pool>,
    config: DispatcherConfig,
    queue: Vec<Request>,
}

impl Dispatcher {
    pub fn new(pool: Arc<dyn Pool>, config: DispatcherConfig) -> Self {
        Self {
            pool,
            config,
            queue: Vec::new(),
        }
    }

    /// Dispatcher that connects directly, without any proxy.
    pub fn direct(config: DispatcherConfig) -> Self {
        Self::new(Arc::new(DirectPool::new()), config)
    }

    pub fn pool(&self) -> &Arc<dyn Pool> {
        &self.pool
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Queue a request for the next [`run`](Self::run). The returned id
    /// indexes the batch that run produces.
    pub fn enqueue(&mut self, request: Request) -> RequestId {
        self.queue.push(request);
        RequestId(self.queue.len() - 1)
    }

    /// Build and queue a request.
    pub fn create_request(
        &mut self,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
        user_agent: Option<&str>,
    ) -> Result<RequestId, url::ParseError> {
        let mut request = Request::new(method, Url::parse(url)?);
        if let Some(body) = body {
            request = request.with_body(body);
        }
        if let Some(user_agent) = user_agent {
            request = request.with_user_agent(user_agent);
        }
        Ok(self.enqueue(request))
    }

    /// Number of requests waiting for the next run.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Run every queued request until each one settles.
    ///
    /// Fails only when the pool cannot supply a server or its storage breaks;
    /// the requests of that batch are dropped. Upstream failures are never
    /// errors, they end up recorded on the request.
    pub async fn run(&mut self) -> Result<Batch, Error> {
        let mut requests = std::mem::take(&mut self.queue);
        let mut in_flight: FuturesUnordered<Attempt> = FuturesUnordered::new();

        for (id, request) in requests.iter_mut().enumerate() {
            in_flight.push(self.prepare(id, request).await?);
        }

        while let Some((id, exchange)) = in_flight.next().await {
            let request = &mut requests[id];
            if self.settle(request, exchange).await? {
                in_flight.push(self.prepare(id, request).await?);
            }
        }

        Ok(Batch { requests })
    }

    /// Blocking form of [`run`](Self::run) on a single-threaded runtime.
    ///
    /// Must not be called from inside another tokio runtime.
    pub fn run_blocking(&mut self) -> Result<Batch, Error> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::Runtime)?;
        runtime.block_on(self.run())
    }

    /// Pick a server for the next attempt of `request` and start it.
    async fn prepare(&self, id: usize, request: &mut Request) -> Result<Attempt, Error> {
        let server = self.pool.select().await?;
        request.attempts += 1;

        let client = build_client(&server, self.config.timeout, self.config.accept_invalid_certs);
        request.proxy = Some(server);

        let method = request.method().clone();
        let url = request.url().clone();
        let body = request.body().map(<[u8]>::to_vec);
        let user_agent = request.user_agent().map(str::to_string);

        Ok(async move {
            let exchange = match client {
                Ok(client) => {
                    let mut builder = client.request(method, url);
                    if let Some(user_agent) = user_agent {
                        builder = builder.header(USER_AGENT, user_agent);
                    }
                    if let Some(body) = body {
                        builder = builder.body(body);
                    }
                    send(builder).await
                }
                Err(e) => Exchange::failed(&e, None, HeaderMap::new()),
            };
            (id, exchange)
        }
        .boxed())
    }

    /// Record an attempt on its request and apply the policy.
    /// Returns whether the request goes out again.
    async fn settle(&self, request: &mut Request, exchange: Exchange) -> Result<bool, Error> {
        request.transport_status = Some(exchange.transport);
        request.transport_message = Some(exchange.message);
        request.response_status = exchange.status;
        request.response_headers = exchange.headers;
        request.response_body = exchange.body;

        let decision = self
            .config
            .policy
            .decide(exchange.transport, exchange.status.map(|s| s.as_u16()));

        let outcome = match request.proxy() {
            Some(server) => self.pool.adjust(server, decision.action.adjustment()).await?,
            None => ScoreOutcome::Removed,
        };

        let mut retry = decision.action.retry;
        if retry && request.attempts >= self.config.max_attempts {
            retry = false;
            request.gave_up = true;
        }

        let level = if self.config.verbose { Level::Info } else { Level::Debug };
        if log::log_enabled!(level) {
            let label = match (retry, request.gave_up) {
                (true, _) => "RETRY",
                (false, true) => "GAVE UP",
                (false, false) => "FINISHED",
            };
            let proxy = request.proxy().map(|s| s.to_string()).unwrap_or_default();
            let status = request
                .response_status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string());
            let score = match outcome {
                ScoreOutcome::Score(s) => s.to_string(),
                ScoreOutcome::Removed => "removed".to_string(),
            };
            let line = format!(
                "{}, attempt: {}, proxy: {} (score {}), status: {} {}, http: {}, {}",
                label,
                request.attempts,
                proxy,
                score,
                exchange.transport,
                request.transport_message().unwrap_or_default(),
                status,
                request.url()
            );
            if self.config.verbose {
                info!("{}", line);
            } else {
                debug!("{}", line);
            }
        }

        Ok(retry)
    }
}

async fn send(builder: reqwest::RequestBuilder) -> Exchange {
    let response = match builder.send().await {
        Ok(response) => response,
        Err(e) => return Exchange::failed(&e, None, HeaderMap::new()),
    };

    let status = response.status();
    let headers = response.headers().clone();
    match response.bytes().await {
        Ok(body) => Exchange {
            transport: TransportStatus::Ok,
            message: TransportStatus::Ok.to_string(),
            status: Some(status),
            headers,
            body: body.to_vec(),
        },
        Err(e) => Exchange::failed(&e, Some(status), headers),
    }
}
