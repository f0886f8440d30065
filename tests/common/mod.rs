#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rotating_proxy_pool::{Fetched, ProxySource, Server, SourceError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A local HTTP proxy that answers every request itself with a fixed response.
pub struct FakeProxy {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl FakeProxy {
    pub async fn spawn(status_line: &'static str, body: &'static str) -> Self {
        Self::spawn_with_delay(status_line, body, Duration::ZERO).await
    }

    /// Holds every connection open for `delay` before answering.
    pub async fn spawn_with_delay(
        status_line: &'static str,
        body: &'static str,
        delay: Duration,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let counter = counter.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    loop {
                        let n = match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        buf.extend_from_slice(&chunk[..n]);
                        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(delay).await;

                    let response = format!(
                        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status_line,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self { addr, hits }
    }

    pub fn server(&self) -> Server {
        Server::new(self.addr.ip().to_string(), self.addr.port())
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// A server address nothing listens on.
pub async fn dead_server() -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    Server::new("127.0.0.1", port)
}

/// A proxy source returning whatever list it currently holds.
pub struct StubSource {
    pub servers: Mutex<Vec<Server>>,
    fetches: AtomicUsize,
    delay: Duration,
}

impl StubSource {
    pub fn new(servers: Vec<Server>) -> Arc<Self> {
        Self::slow(servers, Duration::ZERO)
    }

    /// Takes `delay` to answer every fetch.
    pub fn slow(servers: Vec<Server>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            servers: Mutex::new(servers),
            fetches: AtomicUsize::new(0),
            delay,
        })
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProxySource for StubSource {
    fn name(&self) -> &str {
        "stub"
    }

    async fn fetch(&self, _since: i64) -> Result<Fetched, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(Fetched {
            servers: self.servers.lock().clone(),
            newest: chrono::Utc::now().timestamp(),
        })
    }
}
