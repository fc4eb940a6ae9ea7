//! Response bodies.
//!
//! A streamed [`Body`] keeps the pooled connection checked out until the last
//! chunk has been read; only then is the connection released back to the pool.
//! Dropping a body early closes the connection instead, since the rest of the
//! response is still sitting on the wire.

use bytes::{Bytes, BytesMut};
use futures::future::poll_fn;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use crate::error::{Error, Result};
use crate::json;
use crate::pool::PooledConnection;
use crate::transport::BodyStream;

enum Source {
    Buffered(Option<Bytes>),
    Streaming {
        stream: BodyStream,
        conn: Option<PooledConnection>,
    },
    Finished,
}

pub struct Body {
    source: Source,
    /// Bytes read from the source but not yet handed out (partial lines)
    pending: BytesMut,
}

impl Body {
    pub fn empty() -> Self {
        Self::buffered(Bytes::new())
    }

    pub fn buffered(bytes: Bytes) -> Self {
        Self {
            source: Source::Buffered(Some(bytes)),
            pending: BytesMut::new(),
        }
    }

    pub fn streaming(stream: BodyStream, conn: PooledConnection) -> Self {
        Self {
            source: Source::Streaming {
                stream,
                conn: Some(conn),
            },
            pending: BytesMut::new(),
        }
    }

    /// Whether the underlying source has been read to its end
    pub fn is_finished(&self) -> bool {
        self.pending.is_empty()
            && matches!(self.source, Source::Finished | Source::Buffered(None))
    }

    fn poll_source(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes>>> {
        loop {
            let item = match &mut self.source {
                Source::Buffered(bytes) => return Poll::Ready(bytes.take().map(Ok)),
                Source::Finished => return Poll::Ready(None),
                Source::Streaming { stream, .. } => ready!(stream.poll_next_unpin(cx)),
            };

            match item {
                Some(Ok(chunk)) if chunk.is_empty() => continue,
                Some(Ok(chunk)) => return Poll::Ready(Some(Ok(chunk))),
                Some(Err(err)) => {
                    // The connection is in an unknown state; dropping it closes it.
                    self.source = Source::Finished;
                    return Poll::Ready(Some(Err(err)));
                }
                None => {
                    if let Source::Streaming { conn, .. } = &mut self.source {
                        if let Some(conn) = conn.take() {
                            conn.release();
                        }
                    }
                    self.source = Source::Finished;
                    return Poll::Ready(None);
                }
            }
        }
    }

    async fn pull(&mut self) -> Result<Option<Bytes>> {
        poll_fn(|cx| self.poll_source(cx)).await.transpose()
    }

    /// Next chunk of the body, `None` at the end.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        if !self.pending.is_empty() {
            return Ok(Some(self.pending.split().freeze()));
        }
        self.pull().await
    }

    /// Next `\n`-terminated line without its line ending. A trailing partial
    /// line is returned at the end of the body.
    pub async fn next_line(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let mut line = self.pending.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(pos - 1);
                }
                return Ok(Some(line.freeze()));
            }

            match self.pull().await? {
                Some(chunk) => self.pending.extend_from_slice(&chunk),
                None if self.pending.is_empty() => return Ok(None),
                None => return Ok(Some(self.pending.split().freeze())),
            }
        }
    }

    /// Read and discard the remainder, releasing the connection.
    pub async fn drain(&mut self) -> Result<()> {
        self.pending.clear();
        while self.pull().await?.is_some() {}
        Ok(())
    }

    pub async fn bytes(mut self) -> Result<Bytes> {
        if let Source::Buffered(bytes) = &mut self.source {
            if self.pending.is_empty() {
                return Ok(bytes.take().unwrap_or_default());
            }
        }
        let mut buf = std::mem::take(&mut self.pending);
        while let Some(chunk) = self.pull().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::InvalidResponse(format!("body is not UTF-8: {}", e)))
    }

    pub async fn json<T: DeserializeOwned>(self) -> Result<T> {
        let bytes = self.bytes().await?;
        json::decode(&bytes)
    }

    /// Stop reading. A finished body has already released its connection; an
    /// unfinished one closes it.
    pub fn close(self) {
        if !self.is_finished() {
            tracing::debug!("Body closed before its end, discarding connection");
        }
    }
}

impl Stream for Body {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if !this.pending.is_empty() {
            return Poll::Ready(Some(Ok(this.pending.split().freeze())));
        }
        this.poll_source(cx)
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.source {
            Source::Buffered(_) => "buffered",
            Source::Streaming { .. } => "streaming",
            Source::Finished => "finished",
        };
        f.debug_struct("Body").field("source", &kind).finish()
    }
}
