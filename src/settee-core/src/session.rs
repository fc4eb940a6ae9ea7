use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::body::Body;
use crate::cache::{CacheEntry, ResponseCache};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, PoolKey};
use crate::transport::{Headers, HttpRequest, Method, ReqwestTransport, Transport};
use reqwest::Url;

/// How the session should hand back the response body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Read the whole body before returning; eligible for caching and for the
    /// configured request timeout
    Buffered,
    /// Return as soon as the headers arrive; the caller reads the body
    Streamed,
}

pub struct Response {
    pub status: u16,
    pub headers: Headers,
    pub body: Body,
    /// Served from the response cache after a 304
    pub from_cache: bool,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_str())
    }

    /// ETag value without surrounding quotes
    pub fn etag(&self) -> Option<String> {
        self.header("etag").map(|v| v.trim_matches('"').to_string())
    }

    pub async fn json<T: DeserializeOwned>(self) -> Result<T> {
        self.body.json().await
    }

    pub async fn bytes(self) -> Result<Bytes> {
        self.body.bytes().await
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("from_cache", &self.from_cache)
            .finish()
    }
}

/// Shared request machinery: owns the connection pool and the response cache.
///
/// Many resources share one session; all of its state is internally
/// synchronized.
pub struct Session {
    config: Config,
    transport: Arc<dyn Transport>,
    pool: ConnectionPool,
    cache: ResponseCache,
}

impl Session {
    pub fn new(config: Config) -> Self {
        let transport = Arc::new(ReqwestTransport::new(&config));
        Self::with_transport(config, transport)
    }

    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Self {
        let pool = ConnectionPool::new(&config.pool);
        let cache = ResponseCache::new(&config.cache);
        Self {
            config,
            transport,
            pool,
            cache,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Issue `request`, mapping error statuses to [`Error`].
    ///
    /// GET requests for cached URLs are sent conditionally; a 304 is answered
    /// from the cache. Successful writes invalidate the cached URL.
    pub async fn request(&self, mut request: HttpRequest, mode: ReadMode) -> Result<Response> {
        let url = request.url.to_string();
        let request_url = request.url.clone();
        let method = request.method;

        let cached = if method == Method::Get && self.config.cache.enabled {
            self.cache.lookup(&url).await
        } else {
            None
        };
        if let Some(entry) = &cached {
            if request.header("if-none-match").is_none() {
                request.set_header("If-None-Match", entry.etag.clone());
            }
        }
        if mode == ReadMode::Buffered && request.timeout.is_none() {
            request.timeout = self.config.timeouts.request();
        }

        let (status, headers, mut body) = self.send(request).await?;
        tracing::debug!("{} {} -> {}", method, url, status);

        if status == 304 {
            if let Some(entry) = cached {
                body.drain().await?;
                return Ok(Response {
                    status: entry.status,
                    headers: entry.headers,
                    body: Body::buffered(entry.body),
                    from_cache: true,
                });
            }
        }

        if status >= 400 {
            let bytes = body.bytes().await?;
            return Err(Error::from_status(status, &bytes));
        }

        if method.is_write() {
            self.cache.invalidate(&url).await;
            if let Some(path_only) = without_query(&request_url) {
                self.cache.invalidate(&path_only).await;
            }
        }

        match mode {
            ReadMode::Streamed => Ok(Response {
                status,
                headers,
                body,
                from_cache: false,
            }),
            ReadMode::Buffered => {
                let bytes = body.bytes().await?;
                if method == Method::Get && self.config.cache.enabled {
                    if let Some(etag) = headers.get("etag") {
                        let entry =
                            CacheEntry::new(etag.clone(), status, headers.clone(), bytes.clone());
                        self.cache.store(&url, entry).await;
                    }
                }
                Ok(Response {
                    status,
                    headers,
                    body: Body::buffered(bytes),
                    from_cache: false,
                })
            }
        }
    }

    async fn send(&self, request: HttpRequest) -> Result<(u16, Headers, Body)> {
        let key = PoolKey::from_url(&request.url)?;

        if let Some(mut conn) = self.pool.acquire(&key) {
            match conn.send(request.clone()).await {
                Ok(response) => {
                    return Ok((
                        response.status,
                        response.headers,
                        Body::streaming(response.body, conn),
                    ));
                }
                Err(err) if self.config.retry_stale_connections && retryable(&request.method, &err) => {
                    tracing::warn!(
                        "Reused connection to {} failed ({}), retrying on a new connection",
                        key,
                        err
                    );
                    conn.discard();
                }
                Err(err) => return Err(err),
            }
        }

        let conn = self.transport.connect(&key).await?;
        let mut conn = self.pool.checkout(&key, conn);
        let response = conn.send(request).await?;
        Ok((
            response.status,
            response.headers,
            Body::streaming(response.body, conn),
        ))
    }
}

/// A failed send on a reused connection may be replayed when the request never
/// reached the server, or when replaying it cannot change server state.
fn retryable(method: &Method, err: &Error) -> bool {
    if err.is_connect_failure() {
        method.is_idempotent()
    } else {
        matches!(err, Error::Transport(_)) && method.is_safe()
    }
}

/// `url` with its query string removed, if it had one
fn without_query(url: &Url) -> Option<String> {
    url.query()?;
    let mut url = url.clone();
    url.set_query(None);
    Some(url.to_string())
}
