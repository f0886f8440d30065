mod common;

use common::{dead_server, init_logger, FakeProxy, StubSource};
use futures::future::join_all;
use reqwest_middleware::ClientBuilder;
use rotating_proxy_pool::{
    DirectPool, DispatcherConfig, FilePool, FixedPool, Pool, PoolMiddleware, Rotation,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

#[tokio::test]
async fn test_middleware_retries_through_next_proxy() {
    init_logger();
    let live = FakeProxy::spawn("200 OK", "via proxy").await;
    let servers = vec![dead_server().await, live.server()];
    let pool = Arc::new(FixedPool::new(servers).with_rotation(Rotation::starting_at(0)));

    let client = ClientBuilder::new(reqwest::Client::new())
        .with(PoolMiddleware::new(pool, DispatcherConfig::default()))
        .build();
    let response = client.get("http://example.invalid/").send().await.unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "via proxy");
    assert_eq!(live.hits(), 1);
}

#[tokio::test]
async fn test_middleware_returns_last_failure_after_limit() {
    let pool = Arc::new(FixedPool::new(vec![dead_server().await]));
    let config = DispatcherConfig::builder().max_attempts(2).build();

    let client = ClientBuilder::new(reqwest::Client::new())
        .with(PoolMiddleware::new(pool, config))
        .build();
    let result = client.get("http://example.invalid/").send().await;

    assert!(matches!(result, Err(reqwest_middleware::Error::Reqwest(e)) if e.is_connect()));
}

#[tokio::test]
async fn test_middleware_without_proxy() {
    let origin = FakeProxy::spawn("202 Accepted", "").await;
    let client = ClientBuilder::new(reqwest::Client::new())
        .with(PoolMiddleware::new(Arc::new(DirectPool::new()), DispatcherConfig::default()))
        .build();

    let response = client
        .get(format!("http://{}/", origin.addr))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_middleware_reports_empty_pool() {
    let client = ClientBuilder::new(reqwest::Client::new())
        .with(PoolMiddleware::new(
            Arc::new(FixedPool::new(Vec::new())),
            DispatcherConfig::default(),
        ))
        .build();

    let result = client.get("http://example.invalid/").send().await;

    assert!(matches!(result, Err(reqwest_middleware::Error::Middleware(_))));
}

#[tokio::test]
async fn test_concurrent_requests_through_empty_file_pool() {
    init_logger();
    let dir = tempdir().unwrap();
    let live = FakeProxy::spawn("200 OK", "via file pool").await;
    let source = StubSource::slow(Vec::new(), Duration::from_millis(200));
    let pool = FilePool::open(dir.path().join("pool.json"), source.clone())
        .await
        .unwrap();
    let pool = Arc::new(pool);
    assert!(pool.is_empty());
    *source.servers.lock() = vec![live.server()];

    let client = ClientBuilder::new(reqwest::Client::new())
        .with(PoolMiddleware::new(pool.clone(), DispatcherConfig::default()))
        .build();
    let requests = (0..4).map(|i| client.get(format!("http://example.invalid/{i}")).send());

    let responses = tokio::time::timeout(Duration::from_secs(5), join_all(requests))
        .await
        .expect("concurrent requests over an empty pool deadlocked");

    for response in responses {
        assert_eq!(response.unwrap().text().await.unwrap(), "via file pool");
    }
    assert_eq!(live.hits(), 4);
    assert_eq!(source.fetches(), 2);
    assert_eq!(pool.len(), 1);
}
