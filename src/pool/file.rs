//! Scored, evicting pool persisted in a JSON file shared between processes.
//!
//! All file I/O runs on tokio's blocking pool: an exclusive `flock` may wait
//! on another process, and that wait must not park an executor thread. No
//! file lock is held while a [`ProxySource`] fetch is awaited.

use super::storage::{Document, Storage};
use super::{Pool, Rotation, ScoreAdjustment, ScoreOutcome};
use crate::error::PoolError;
use crate::server::Server;
use crate::source::ProxySource;

use async_trait::async_trait;
use log::{info, warn};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default eviction threshold.
pub const DEFAULT_MAX_FAIL_SCORE: f64 = 3.0;

/// How far back a source is asked to look when it has never been fetched.
const FIRST_FETCH_WINDOW_SECS: i64 = 30 * 24 * 3600;

/// Persistent pool backed by a JSON file and replenished from a
/// [`ProxySource`].
///
/// The file may be shared by several processes. Every score change re-reads
/// the file under an exclusive lock before mutating it, so penalties recorded
/// by other processes are never overwritten by a stale in-memory copy.
pub struct FilePool {
    storage: Storage,
    state: Mutex<Document>,
    source: Arc<dyn ProxySource>,
    max_fail_score: f64,
    rotation: Rotation,
    // Serializes refreshes within this process.
    refresh_lock: tokio::sync::Mutex<()>,
}

/// Builder for [`FilePool`].
pub struct FilePoolBuilder {
    path: PathBuf,
    source: Arc<dyn ProxySource>,
    max_fail_score: f64,
    rotation: Option<Rotation>,
}

impl FilePoolBuilder {
    /// Score at which a server is evicted. 0 means never.
    pub fn max_fail_score(mut self, score: f64) -> Self {
        self.max_fail_score = score;
        self
    }

    /// Round-robin cursor to use, e.g. a seeded one for tests.
    pub fn rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = Some(rotation);
        self
    }

    /// Open the pool file, creating and filling it from the source if it
    /// does not exist yet.
    pub async fn open(self) -> Result<FilePool, PoolError> {
        let pool = FilePool {
            storage: Storage::new(self.path),
            state: Mutex::new(Document::default()),
            source: self.source,
            max_fail_score: self.max_fail_score,
            rotation: self.rotation.unwrap_or_default(),
            refresh_lock: tokio::sync::Mutex::new(()),
        };

        let created = pool
            .storage
            .blocking(|storage| Ok(!storage.exists() && storage.initialize()?))
            .await?;
        if created {
            info!("Created proxy pool file {}", pool.storage.path().display());
            pool.refresh().await?;
        } else {
            pool.reload().await?;
        }
        Ok(pool)
    }
}

impl FilePool {
    pub fn builder(path: impl Into<PathBuf>, source: Arc<dyn ProxySource>) -> FilePoolBuilder {
        FilePoolBuilder {
            path: path.into(),
            source,
            max_fail_score: DEFAULT_MAX_FAIL_SCORE,
            rotation: None,
        }
    }

    /// Open with default settings.
    pub async fn open(
        path: impl Into<PathBuf>,
        source: Arc<dyn ProxySource>,
    ) -> Result<Self, PoolError> {
        Self::builder(path, source).open().await
    }

    pub fn path(&self) -> &Path {
        self.storage.path()
    }

    /// Replace the in-memory copy with the file contents.
    pub async fn reload(&self) -> Result<(), PoolError> {
        let doc = self.storage.blocking(Storage::load).await?;
        *self.state.lock() = doc;
        Ok(())
    }

    /// Snapshot of the servers currently held.
    pub fn servers(&self) -> Vec<Server> {
        self.state.lock().pool.clone()
    }

    /// Snapshot of the bookkeeping data.
    pub fn meta(&self) -> Map<String, Value> {
        self.state.lock().meta.clone()
    }

    /// Fetch and merge. Callers hold `refresh_lock`.
    async fn refresh_locked(&self) -> Result<usize, PoolError> {
        let name = self.source.name().to_string();

        let seen = {
            let name = name.clone();
            self.storage
                .blocking(move |storage| Ok(newest_seen(&storage.load()?.meta, &name)))
                .await?
        };
        let since =
            seen.unwrap_or_else(|| chrono::Utc::now().timestamp() - FIRST_FETCH_WINDOW_SECS);

        let fetched = match self.source.fetch(since).await {
            Ok(fetched) => Some(fetched),
            Err(e) => {
                warn!("Proxy source {} failed: {}", name, e);
                None
            }
        };

        let (doc, added) = self
            .storage
            .blocking(move |storage| {
                let mut file = storage.lock_exclusive()?;
                let mut doc = file.read()?;
                let added = match fetched {
                    Some(fetched) => {
                        let fetched_count = fetched.servers.len();
                        let added = doc.merge(fetched.servers);
                        record_newest(&mut doc.meta, &name, fetched.newest);
                        info!(
                            "Refreshed proxy pool from {}: {} fetched, {} new, {} total",
                            name,
                            fetched_count,
                            added,
                            doc.pool.len()
                        );
                        added
                    }
                    None => 0,
                };
                file.write(&mut doc)?;
                Ok((doc, added))
            })
            .await?;

        *self.state.lock() = doc;
        Ok(added)
    }
}

fn newest_seen(meta: &Map<String, Value>, source: &str) -> Option<i64> {
    meta.get(source)
        .and_then(|entry| entry.get("newest"))
        .and_then(Value::as_i64)
}

fn record_newest(meta: &mut Map<String, Value>, source: &str, newest: i64) {
    let newest = newest_seen(meta, source).map_or(newest, |prev| prev.max(newest));
    let entry = meta
        .entry(source.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    match entry.as_object_mut() {
        Some(fields) => {
            fields.insert("newest".to_string(), Value::from(newest));
        }
        None => *entry = serde_json::json!({ "newest": newest }),
    }
}

#[async_trait]
impl Pool for FilePool {
    async fn select(&self) -> Result<Server, PoolError> {
        let empty = self.state.lock().pool.is_empty();
        if empty {
            let _guard = self.refresh_lock.lock().await;
            // Another task may have refilled it while we waited.
            let still_empty = self.state.lock().pool.is_empty();
            if still_empty {
                self.refresh_locked().await?;
            }
        }

        let state = self.state.lock();
        self.rotation
            .pick(&state.pool)
            .cloned()
            .ok_or(PoolError::Exhausted)
    }

    /// Penalties that are zero, negative or not a number leave the score
    /// untouched and take no lock.
    async fn adjust(
        &self,
        server: &Server,
        adjustment: ScoreAdjustment,
    ) -> Result<ScoreOutcome, PoolError> {
        let key = server.key();
        {
            let state = self.state.lock();
            let Some(idx) = state.position(&key) else {
                return Ok(ScoreOutcome::Removed);
            };
            if let ScoreAdjustment::Penalize(amount) = adjustment {
                if !(amount > 0.0) {
                    return Ok(ScoreOutcome::Score(state.pool[idx].fail_score));
                }
            }
        }

        let max_fail_score = self.max_fail_score;
        let (doc, outcome) = self
            .storage
            .blocking(move |storage| {
                let mut file = storage.lock_exclusive()?;
                let mut doc = file.read()?;

                // Another process may have evicted it since our last load.
                let Some(idx) = doc.position(&key) else {
                    return Ok((doc, ScoreOutcome::Removed));
                };

                let entry = &mut doc.pool[idx];
                match adjustment {
                    ScoreAdjustment::Reset => entry.fail_score = 0.0,
                    ScoreAdjustment::Penalize(amount) => entry.fail_score += amount,
                }
                let score = entry.fail_score;

                let outcome = if max_fail_score > 0.0 && score >= max_fail_score {
                    let evicted = doc.pool.remove(idx);
                    warn!(
                        "Proxy {} removed from pool: fail score {} reached {}",
                        evicted,
                        score,
                        max_fail_score
                    );
                    ScoreOutcome::Removed
                } else {
                    ScoreOutcome::Score(score)
                };

                file.write(&mut doc)?;
                Ok((doc, outcome))
            })
            .await?;

        *self.state.lock() = doc;
        Ok(outcome)
    }

    fn last_refreshed(&self) -> i64 {
        let state = self.state.lock();
        newest_seen(&state.meta, self.source.name()).unwrap_or(0)
    }

    async fn refresh(&self) -> Result<usize, PoolError> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    fn len(&self) -> usize {
        self.state.lock().pool.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RefreshPolicy;
    use crate::error::SourceError;
    use crate::source::Fetched;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    struct StubSource {
        servers: Mutex<Vec<Server>>,
        fetches: AtomicUsize,
        delay: Duration,
    }

    impl StubSource {
        fn new(servers: Vec<Server>) -> Arc<Self> {
            Self::slow(servers, Duration::ZERO)
        }

        fn slow(servers: Vec<Server>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                servers: Mutex::new(servers),
                fetches: AtomicUsize::new(0),
                delay,
            })
        }

        fn fetches(&self) -> usize {
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

    fn abc() -> Vec<Server> {
        vec![
            Server::new("1.1.1.1", 80),
            Server::new("2.2.2.2", 80),
            Server::new("3.3.3.3", 80),
        ]
    }

    #[tokio::test]
    async fn test_open_creates_file_and_refreshes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.json");
        let source = StubSource::new(abc());

        let pool = FilePool::open(&path, source.clone()).await.unwrap();

        assert!(path.exists());
        assert_eq!(pool.len(), 3);
        assert_eq!(source.fetches(), 1);
        assert!(pool.last_refreshed() > 0);
        assert!(pool.meta().contains_key("modified"));
    }

    #[tokio::test]
    async fn test_open_existing_file_does_not_fetch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.json");
        std::fs::write(
            &path,
            r#"{"pool": [{"ip": "9.9.9.9", "port": 80, "failScore": 1.0, "type": "HTTP"}], "meta": {}}"#,
        )
        .unwrap();
        let source = StubSource::new(abc());

        let pool = FilePool::open(&path, source.clone()).await.unwrap();

        assert_eq!(source.fetches(), 0);
        assert_eq!(pool.servers()[0].fail_score, 1.0);
        assert_eq!(pool.last_refreshed(), 0);
    }

    #[tokio::test]
    async fn test_penalties_evict_at_threshold() {
        let dir = tempdir().unwrap();
        let pool = FilePool::builder(dir.path().join("pool.json"), StubSource::new(abc()))
            .max_fail_score(3.0)
            .open()
            .await
            .unwrap();
        let first = Server::new("1.1.1.1", 80);

        assert_eq!(pool.penalize(&first, 1.5).await.unwrap(), ScoreOutcome::Score(1.5));
        assert_eq!(pool.penalize(&first, 1.5).await.unwrap(), ScoreOutcome::Removed);
        assert_eq!(pool.penalize(&first, 1.0).await.unwrap(), ScoreOutcome::Removed);

        for _ in 0..4 {
            assert_ne!(pool.select().await.unwrap(), first);
        }
        assert!(pool.servers().contains(&Server::new("3.3.3.3", 80)));
        assert_eq!(Storage::new(pool.path()).load().unwrap().pool.len(), 2);
    }

    #[tokio::test]
    async fn test_reset_clears_accumulated_penalty() {
        let dir = tempdir().unwrap();
        let pool = FilePool::open(dir.path().join("pool.json"), StubSource::new(abc()))
            .await
            .unwrap();
        let server = Server::new("2.2.2.2", 80);

        pool.penalize(&server, 1.0).await.unwrap();
        pool.penalize(&server, 1.5).await.unwrap();
        assert_eq!(pool.reset(&server).await.unwrap(), ScoreOutcome::Score(0.0));
        assert_eq!(pool.penalize(&server, 0.0).await.unwrap(), ScoreOutcome::Score(0.0));
    }

    #[tokio::test]
    async fn test_unlimited_pool_never_evicts() {
        let dir = tempdir().unwrap();
        let pool = FilePool::builder(dir.path().join("pool.json"), StubSource::new(abc()))
            .max_fail_score(0.0)
            .open()
            .await
            .unwrap();
        let server = Server::new("1.1.1.1", 80);

        assert_eq!(pool.penalize(&server, 1000.0).await.unwrap(), ScoreOutcome::Score(1000.0));
        assert_eq!(pool.len(), 3);
    }

    #[tokio::test]
    async fn test_mutation_sees_other_writers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.json");
        let source = StubSource::new(abc());
        let first = FilePool::open(&path, source.clone()).await.unwrap();
        let second = FilePool::open(&path, source.clone()).await.unwrap();
        let server = Server::new("1.1.1.1", 80);

        first.penalize(&server, 1.0).await.unwrap();
        assert_eq!(second.penalize(&server, 1.0).await.unwrap(), ScoreOutcome::Score(2.0));

        first.reload().await.unwrap();
        assert_eq!(first.servers()[0].fail_score, 2.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_penalties_are_not_lost() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.json");
        let source = StubSource::new(abc());
        let mut pools = Vec::new();
        for _ in 0..2 {
            let pool = FilePool::builder(&path, source.clone())
                .max_fail_score(0.0)
                .open()
                .await
                .unwrap();
            pools.push(Arc::new(pool));
        }

        let handles: Vec<_> = pools
            .into_iter()
            .map(|pool| {
                tokio::spawn(async move {
                    let server = Server::new("3.3.3.3", 80);
                    for _ in 0..20 {
                        pool.penalize(&server, 0.25).await.unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let doc = Storage::new(&path).load().unwrap();
        let idx = doc.position("3.3.3.3:80").unwrap();
        assert_eq!(doc.pool[idx].fail_score, 10.0);
    }

    #[tokio::test]
    async fn test_concurrent_selects_on_empty_pool_share_one_refresh() {
        let dir = tempdir().unwrap();
        let source = StubSource::slow(Vec::new(), Duration::from_millis(200));
        let pool = FilePool::open(dir.path().join("pool.json"), source.clone())
            .await
            .unwrap();
        assert!(pool.is_empty());
        *source.servers.lock() = abc();

        let both = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(pool.select(), pool.select())
        })
        .await
        .expect("selects on an empty pool must not block each other");

        assert!(both.0.is_ok());
        assert!(both.1.is_ok());
        assert_eq!(source.fetches(), 2);
        assert_eq!(pool.len(), 3);
    }

    #[tokio::test]
    async fn test_penalty_does_not_wait_for_source_fetch() {
        let dir = tempdir().unwrap();
        let source = StubSource::slow(abc(), Duration::from_millis(100));
        let pool = FilePool::open(dir.path().join("pool.json"), source.clone())
            .await
            .unwrap();
        let server = Server::new("1.1.1.1", 80);

        let (refreshed, penalized) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(pool.refresh(), pool.penalize(&server, 1.0))
        })
        .await
        .expect("a penalty must not wait behind a source fetch");

        assert_eq!(refreshed.unwrap(), 0);
        assert_eq!(penalized.unwrap(), ScoreOutcome::Score(1.0));
    }

    #[tokio::test]
    async fn test_select_refreshes_then_reports_exhaustion() {
        let dir = tempdir().unwrap();
        let source = StubSource::new(vec![Server::new("1.1.1.1", 80)]);
        let pool = FilePool::builder(dir.path().join("pool.json"), source.clone())
            .max_fail_score(1.0)
            .open()
            .await
            .unwrap();

        let server = pool.select().await.unwrap();
        assert_eq!(pool.penalize(&server, 1.0).await.unwrap(), ScoreOutcome::Removed);
        assert!(pool.is_empty());

        source.servers.lock().clear();
        let result = pool.select().await;
        assert!(matches!(result, Err(PoolError::Exhausted)));
        assert_eq!(source.fetches(), 2);
    }

    #[tokio::test]
    async fn test_select_replenishes_empty_pool() {
        let dir = tempdir().unwrap();
        let source = StubSource::new(Vec::new());
        let pool = FilePool::open(dir.path().join("pool.json"), source.clone())
            .await
            .unwrap();
        assert!(pool.is_empty());

        *source.servers.lock() = abc();
        assert!(pool.select().await.is_ok());
        assert_eq!(pool.len(), 3);
    }

    #[tokio::test]
    async fn test_refresh_merges_by_key() {
        let dir = tempdir().unwrap();
        let source = StubSource::new(abc());
        let pool = FilePool::open(dir.path().join("pool.json"), source.clone())
            .await
            .unwrap();
        pool.penalize(&Server::new("1.1.1.1", 80), 2.0).await.unwrap();

        *source.servers.lock() = vec![
            Server::new("1.1.1.1", 80).with_kind("HTTPS"),
            Server::new("4.4.4.4", 80),
        ];
        assert_eq!(pool.refresh().await.unwrap(), 1);

        let servers = pool.servers();
        assert_eq!(servers.len(), 4);
        assert_eq!(servers[0].kind, "HTTPS");
        assert_eq!(servers[0].fail_score, 0.0);
        assert_eq!(servers[3].key(), "4.4.4.4:80");
    }

    #[tokio::test]
    async fn test_auto_refresh_only_when_small_and_stale() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pool.json");
        std::fs::write(
            &path,
            r#"{"pool": [{"ip": "9.9.9.9", "port": 80}], "meta": {"stub": {"newest": 1000}}}"#,
        )
        .unwrap();
        let source = StubSource::new(abc());
        let pool = FilePool::open(&path, source.clone()).await.unwrap();
        assert_eq!(pool.last_refreshed(), 1000);

        let large = RefreshPolicy {
            max_count: 0,
            ..RefreshPolicy::default()
        };
        assert!(!pool.auto_refresh(large).await.unwrap());
        assert_eq!(source.fetches(), 0);

        assert!(pool.auto_refresh(RefreshPolicy::default()).await.unwrap());
        assert_eq!(pool.len(), 4);
        assert!(pool.last_refreshed() > 1000);

        assert!(!pool.auto_refresh(RefreshPolicy::default()).await.unwrap());
        assert_eq!(source.fetches(), 1);
    }
}
