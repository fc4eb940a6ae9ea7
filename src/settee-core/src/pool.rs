//! # Connection Pool
//!
//! Keyed cache of idle transport connections, one bucket per
//! (scheme, host:port).
//!
//! - Only *idle* connections are bounded. When the pool is empty a new
//!   connection is opened, so concurrent callers never wait on each other.
//! - A checked-out connection is owned by exactly one [`PooledConnection`].
//! - Overflow closes the least-recently-released idle connection of that key.
//! - Connections are returned only after an explicit [`PooledConnection::release`];
//!   anything else (errors, early drops) closes them.

use parking_lot::{Mutex, RwLock};
use reqwest::Url;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::transport::{Connection, HttpRequest, HttpResponse};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub scheme: String,
    /// `host:port`, with the scheme's default port filled in
    pub authority: String,
}

impl PoolKey {
    pub fn new(scheme: impl Into<String>, authority: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            authority: authority.into(),
        }
    }

    pub fn from_url(url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidArgument(format!("URL has no host: {}", url)))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::InvalidArgument(format!("URL has no port: {}", url)))?;
        Ok(Self::new(url.scheme(), format!("{}:{}", host, port)))
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority)
    }
}

type Bucket = Arc<Mutex<VecDeque<Box<dyn Connection>>>>;

struct PoolInner {
    max_idle: usize,
    // The map lock is only held to find a bucket; per-host work locks the bucket.
    buckets: RwLock<HashMap<PoolKey, Bucket>>,
}

/// Connection pool handle.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                max_idle: config.max_idle_per_host,
                buckets: RwLock::new(HashMap::new()),
            }),
        }
    }

    fn bucket(&self, key: &PoolKey) -> Bucket {
        if let Some(bucket) = self.inner.buckets.read().get(key) {
            return bucket.clone();
        }
        self.inner
            .buckets
            .write()
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Take the most recently released idle connection for `key`, if any.
    pub fn acquire(&self, key: &PoolKey) -> Option<PooledConnection> {
        let conn = self.bucket(key).lock().pop_back()?;
        tracing::debug!("Reusing idle connection to {}", key);
        Some(PooledConnection::new(self.clone(), key.clone(), conn, true))
    }

    /// Wrap a freshly opened connection so that it can be released into this pool.
    pub fn checkout(&self, key: &PoolKey, conn: Box<dyn Connection>) -> PooledConnection {
        PooledConnection::new(self.clone(), key.clone(), conn, false)
    }

    fn release(&self, key: &PoolKey, conn: Box<dyn Connection>) {
        if self.inner.max_idle == 0 {
            return;
        }
        let bucket = self.bucket(key);
        let mut idle = bucket.lock();
        idle.push_back(conn);
        while idle.len() > self.inner.max_idle {
            idle.pop_front();
            tracing::debug!("Pool for {} full, closed oldest idle connection", key);
        }
    }

    /// Number of idle connections held for `key`
    pub fn idle_count(&self, key: &PoolKey) -> usize {
        self.inner
            .buckets
            .read()
            .get(key)
            .map(|bucket| bucket.lock().len())
            .unwrap_or(0)
    }

    /// Close every idle connection.
    pub fn clear(&self) {
        let buckets = self.inner.buckets.read();
        for bucket in buckets.values() {
            bucket.lock().clear();
        }
    }
}

/// A connection checked out of the pool.
///
/// Dropping it closes the connection unless [`release`](Self::release) was
/// called, so an error path or an abandoned body can never hand a half-read
/// connection to the next caller.
pub struct PooledConnection {
    pool: ConnectionPool,
    key: PoolKey,
    conn: Option<Box<dyn Connection>>,
    reusable: bool,
    reused: bool,
}

impl PooledConnection {
    fn new(pool: ConnectionPool, key: PoolKey, conn: Box<dyn Connection>, reused: bool) -> Self {
        Self {
            pool,
            key,
            conn: Some(conn),
            reusable: false,
            reused,
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Whether this connection came out of the idle set
    pub fn was_reused(&self) -> bool {
        self.reused
    }

    pub async fn send(&mut self, request: HttpRequest) -> Result<HttpResponse> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| Error::Transport("connection already closed".to_string()))?;
        conn.send(request).await
    }

    /// Return the connection to the idle set.
    pub fn release(mut self) {
        self.reusable = true;
    }

    /// Close the connection.
    pub fn discard(mut self) {
        self.reusable = false;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };
        if self.reusable {
            self.pool.release(&self.key, conn);
        } else {
            tracing::debug!("Closing connection to {}", self.key);
        }
    }
}
