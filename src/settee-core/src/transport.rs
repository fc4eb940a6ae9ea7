//! HTTP transport abstraction.
//!
//! The session only talks to [`Transport`] (opens connections for a pool key)
//! and [`Connection`] (one request/response cycle at a time). The default
//! implementation is backed by `reqwest`; tests plug in `mock::MockTransport`.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Url;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::pool::PoolKey;

/// Response headers, keyed by lowercase header name
pub type Headers = BTreeMap<String, String>;

/// Response body as a stream of byte chunks
pub type BodyStream = BoxStream<'static, Result<Bytes>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Head,
    Get,
    Put,
    Post,
    Delete,
    Copy,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Head => "HEAD",
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Delete => "DELETE",
            Method::Copy => "COPY",
        }
    }

    /// Methods that never change server state
    pub fn is_safe(&self) -> bool {
        matches!(self, Method::Head | Method::Get)
    }

    pub fn is_idempotent(&self) -> bool {
        !matches!(self, Method::Post)
    }

    /// Methods whose success changes the representation at the request URL
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Method::Put | Method::Post | Method::Delete | Method::Copy
        )
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: Bytes::new(),
            timeout: None,
        }
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
    }
}

pub struct HttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: BodyStream,
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// One open transport handle bound to a single (scheme, host:port).
#[async_trait]
pub trait Connection: Send {
    /// Issue a request. The returned body must be read to its end before the
    /// connection may carry another request.
    async fn send(&mut self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Factory for connections, used by the session when the pool has no idle one.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, key: &PoolKey) -> Result<Box<dyn Connection>>;
}

/// `reqwest`-backed transport.
///
/// Every connection owns a client restricted to a single idle socket, so a
/// pooled connection maps onto one keep-alive TCP connection.
pub struct ReqwestTransport {
    connect_timeout: Option<Duration>,
}

impl ReqwestTransport {
    pub fn new(config: &Config) -> Self {
        Self {
            connect_timeout: config.timeouts.connect(),
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn connect(&self, key: &PoolKey) -> Result<Box<dyn Connection>> {
        let mut builder = reqwest::Client::builder().pool_max_idle_per_host(1);
        if let Some(timeout) = self.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        let client = builder.build()?;
        tracing::debug!("Opened transport handle for {}", key);
        Ok(Box::new(ReqwestConnection { client }))
    }
}

struct ReqwestConnection {
    client: reqwest::Client,
}

#[async_trait]
impl Connection for ReqwestConnection {
    async fn send(&mut self, request: HttpRequest) -> Result<HttpResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;

        let mut builder = self.client.request(method, request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;

        let status = response.status().as_u16();
        let mut headers = Headers::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
            }
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(Error::from))
            .boxed();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
