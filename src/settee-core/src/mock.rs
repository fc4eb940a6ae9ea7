//! Scripted in-memory transport for tests.
//!
//! A [`MockTransport`] hands every request to a handler closure and turns the
//! returned [`MockResponse`] into a streamed body. It counts opened connections
//! and can break them on demand to exercise retry and discard paths.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::pool::PoolKey;
use crate::transport::{BodyStream, Connection, Headers, HttpRequest, HttpResponse, Method, Transport};

#[derive(Debug, Clone)]
enum Tail {
    End,
    Pending,
    Fail(String),
}

#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Headers,
    pub chunks: Vec<Bytes>,
    tail: Tail,
}

impl MockResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            chunks: Vec::new(),
            tail: Tail::End,
        }
    }

    pub fn json(status: u16, value: serde_json::Value) -> Self {
        let body = serde_json::to_vec(&value).unwrap_or_default();
        Self::new(status)
            .with_header("content-type", "application/json")
            .with_chunk(body)
    }

    pub fn bytes(status: u16, content_type: &str, body: impl Into<Bytes>) -> Self {
        Self::new(status)
            .with_header("content-type", content_type)
            .with_chunk(body)
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_chunk(mut self, chunk: impl Into<Bytes>) -> Self {
        self.chunks.push(chunk.into());
        self
    }

    /// Keep the body open after the scripted chunks, like a live feed
    pub fn never_ending(mut self) -> Self {
        self.tail = Tail::Pending;
        self
    }

    /// Fail the body read after the scripted chunks
    pub fn failing_after(mut self, message: impl Into<String>) -> Self {
        self.tail = Tail::Fail(message.into());
        self
    }

    fn into_http(self, method: Method) -> HttpResponse {
        let chunks = if method == Method::Head {
            Vec::new()
        } else {
            self.chunks
        };
        let head = stream::iter(chunks.into_iter().map(Ok::<Bytes, Error>));
        let body: BodyStream = match self.tail {
            Tail::End => head.boxed(),
            Tail::Pending => head.chain(stream::pending()).boxed(),
            Tail::Fail(message) => head
                .chain(stream::once(async move { Err(Error::Transport(message)) }))
                .boxed(),
        };
        HttpResponse {
            status: self.status,
            headers: self.headers,
            body,
        }
    }
}

type Handler = dyn Fn(&HttpRequest) -> std::result::Result<MockResponse, String> + Send + Sync;

struct MockState {
    handler: Box<Handler>,
    opened: AtomicUsize,
    /// Connections with an id below this fail on their next send
    broken_below: AtomicUsize,
    requests: Mutex<Vec<HttpRequest>>,
}

#[derive(Clone)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    /// `handler` returns the scripted response, or `Err` to simulate a
    /// transport failure before any response arrives.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&HttpRequest) -> std::result::Result<MockResponse, String> + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(MockState {
                handler: Box::new(handler),
                opened: AtomicUsize::new(0),
                broken_below: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn connections_opened(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    /// Make every connection opened so far fail on its next request.
    pub fn break_open_connections(&self) {
        let opened = self.state.opened.load(Ordering::SeqCst);
        self.state.broken_below.store(opened, Ordering::SeqCst);
    }

    /// Requests seen so far, in order
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.state.requests.lock().clone()
    }

    pub fn last_request(&self) -> Option<HttpRequest> {
        self.state.requests.lock().last().cloned()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _key: &PoolKey) -> Result<Box<dyn Connection>> {
        let id = self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            id,
            state: Some(self.state.clone()),
        }))
    }
}

pub struct MockConnection {
    id: usize,
    state: Option<Arc<MockState>>,
}

impl MockConnection {
    /// A connection with no transport behind it; every send fails.
    pub fn detached() -> Self {
        Self { id: 0, state: None }
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&mut self, request: HttpRequest) -> Result<HttpResponse> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| Error::Transport("detached mock connection".to_string()))?;
        if self.id < state.broken_below.load(Ordering::SeqCst) {
            return Err(Error::Connect(format!(
                "connection {} reset by peer",
                self.id
            )));
        }

        state.requests.lock().push(request.clone());
        let response = (state.handler)(&request).map_err(Error::Transport)?;
        Ok(response.into_http(request.method))
    }
}
