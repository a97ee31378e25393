//! Pooled upstream connections
//!
//! Connections are keyed by [`cache_key`] and queued per key. A session takes
//! one out with [`ConnectionPool::get_connection`], owns it exclusively and
//! hands it back with [`ConnectionPool::release`].
mod connection;
mod key;
mod retry;

pub use connection::PooledConnection;
pub use key::cache_key;
pub use retry::{ConnectionSource, RetryAction, RetryPolicy, RetryResult};

use crate::buffer_pool::BufferPool;
use crate::config::ProxyConfig;
use crate::connector::{Connector, UpstreamTarget};
use crate::errors::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Keyed FIFO queues of idle upstream connections.
///
/// Cloning is cheap, clones share the same queues.
#[derive(Clone)]
pub struct ConnectionPool {
  inner: Arc<PoolInner>,
}

struct PoolInner {
  enabled: bool,
  max_cached: usize,
  idle_timeout: Duration,
  sweep_interval: Duration,
  connector: Connector,
  buffer_pool: BufferPool,
  cache: Mutex<HashMap<String, VecDeque<PooledConnection>>>,
  next_id: AtomicU64,
  sweeper: CancellationToken,
}

impl Drop for PoolInner {
  fn drop(&mut self) {
    self.sweeper.cancel();
  }
}

impl std::fmt::Debug for ConnectionPool {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ConnectionPool")
      .field("enabled", &self.inner.enabled)
      .field("max_cached", &self.inner.max_cached)
      .field("idle", &self.idle_count())
      .finish()
  }
}

impl ConnectionPool {
  /// A pool opening connections through `connector`.
  pub fn new(config: &ProxyConfig, connector: Connector, buffer_pool: BufferPool) -> Self {
    ConnectionPool {
      inner: Arc::new(PoolInner {
        enabled: config.enable_connection_pool,
        max_cached: config.max_cached_connections.max(1),
        idle_timeout: config.connection_timeout,
        sweep_interval: config.pool_sweep_interval,
        connector,
        buffer_pool,
        cache: Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(1),
        sweeper: CancellationToken::new(),
      }),
    }
  }

  /// The connector used on a miss.
  pub fn connector(&self) -> &Connector {
    &self.inner.connector
  }

  /// Key of connections able to serve `target`.
  pub fn key_for(&self, target: &UpstreamTarget) -> String {
    let connector = &self.inner.connector;
    cache_key(
      &target.host,
      target.port,
      target.is_https,
      &target.alpn,
      connector.upstream_endpoint(),
      connector.proxy_for_target(target),
    )
  }

  /// A connection to `target`, reused from the pool when `use_cache` is set
  /// and a live one is queued, otherwise freshly created.
  pub async fn get_connection(&self, target: &UpstreamTarget, use_cache: bool) -> Result<PooledConnection> {
    let key = self.key_for(target);
    if use_cache && self.inner.enabled {
      let mut rejected = Vec::new();
      let found = {
        let mut cache = self.lock();
        let mut found = None;
        if let Some(queue) = cache.get_mut(&key) {
          while let Some(connection) = queue.pop_front() {
            if !connection.is_expired(self.inner.idle_timeout) && connection.is_alive() {
              found = Some(connection);
              break;
            }
            rejected.push(connection);
          }
          if queue.is_empty() {
            cache.remove(&key);
          }
        }
        found
      };
      for connection in rejected {
        connection.dispose();
      }
      if let Some(connection) = found {
        tracing::debug!(
          "reusing upstream connection #{} to {}:{}",
          connection.id,
          target.host,
          target.port
        );
        return Ok(connection);
      }
    }
    self.create(target, key).await
  }

  async fn create(&self, target: &UpstreamTarget, key: String) -> Result<PooledConnection> {
    let stream = self.inner.connector.connect(target).await?;
    let negotiated_alpn = stream.negotiated_alpn();
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(
      "created upstream connection #{} to {}:{}",
      id,
      target.host,
      target.port
    );
    Ok(PooledConnection {
      stream: crate::stream::HttpStream::new(stream, &self.inner.buffer_pool, true),
      host: target.host.clone(),
      port: target.port,
      is_https: target.is_https,
      negotiated_alpn,
      last_access: Instant::now(),
      cache_key: key,
      authenticated: false,
      id,
    })
  }

  /// Give a connection back.
  ///
  /// It is closed instead when `force_close` is set, pooling is disabled,
  /// the connection is authenticated or either side is closed. Otherwise the
  /// oldest queued connections make room for it.
  pub fn release(&self, mut connection: PooledConnection, force_close: bool) {
    if force_close || !self.inner.enabled || connection.authenticated || connection.is_closed() {
      connection.dispose();
      return;
    }
    connection.last_access = Instant::now();
    let mut evicted = Vec::new();
    {
      let mut cache = self.lock();
      let queue = cache.entry(connection.cache_key.clone()).or_default();
      while queue.len() >= self.inner.max_cached {
        match queue.pop_front() {
          Some(oldest) => evicted.push(oldest),
          None => break,
        }
      }
      queue.push_back(connection);
    }
    for connection in evicted {
      connection.dispose();
    }
  }

  /// Close every idle connection past the idle timeout.
  pub fn sweep(&self) {
    let mut expired = Vec::new();
    {
      let mut cache = self.lock();
      for queue in cache.values_mut() {
        let (keep, stale): (Vec<_>, Vec<_>) = queue
          .drain(..)
          .partition(|c: &PooledConnection| !c.is_expired(self.inner.idle_timeout));
        *queue = keep.into();
        expired.extend(stale);
      }
      cache.retain(|_, queue| !queue.is_empty());
    }
    if !expired.is_empty() {
      tracing::debug!("pool sweep closing {} idle connections", expired.len());
    }
    for connection in expired {
      connection.dispose();
    }
  }

  /// Start the periodic sweep. It runs until [`ConnectionPool::stop`].
  pub fn start_sweeper(&self) {
    let token = self.inner.sweeper.clone();
    let interval = self.inner.sweep_interval;
    // 弱引用，池被释放后任务自动退出
    let pool = Arc::downgrade(&self.inner);
    tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = token.cancelled() => break,
          _ = tokio::time::sleep(interval) => {
            match pool.upgrade() {
              Some(inner) => ConnectionPool { inner }.sweep(),
              None => break,
            }
          }
        }
      }
    });
  }

  /// Stop the sweeper and close every idle connection.
  pub fn stop(&self) {
    self.inner.sweeper.cancel();
    let drained: Vec<PooledConnection> = {
      let mut cache = self.lock();
      cache.drain().flat_map(|(_, queue)| queue).collect()
    };
    for connection in drained {
      connection.dispose();
    }
  }

  /// Idle connections across every key.
  pub fn idle_count(&self) -> usize {
    self.lock().values().map(|q| q.len()).sum()
  }

  /// Ids of the idle connections queued under `key`, oldest first.
  pub fn idle_ids(&self, key: &str) -> Vec<u64> {
    self
      .lock()
      .get(key)
      .map(|q| q.iter().map(|c| c.id).collect())
      .unwrap_or_default()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<PooledConnection>>> {
    // 锁中毒时继续使用内部数据
    self
      .inner
      .cache
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

/// Connections for one target, for driving a [`RetryPolicy`].
pub struct PoolSource<'a> {
  pool: &'a ConnectionPool,
  target: &'a UpstreamTarget,
}

impl<'a> PoolSource<'a> {
  /// Fresh connections to `target`. Reuse is skipped so a retry never lands
  /// on another stale socket.
  pub fn new(pool: &'a ConnectionPool, target: &'a UpstreamTarget) -> Self {
    PoolSource { pool, target }
  }
}

#[async_trait]
impl ConnectionSource for PoolSource<'_> {
  type Connection = PooledConnection;

  async fn acquire(&self) -> Result<PooledConnection> {
    self.pool.get_connection(self.target, false).await
  }

  async fn discard(&self, connection: PooledConnection) {
    self.pool.release(connection, true);
  }
}
