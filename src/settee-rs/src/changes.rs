//! Change feeds.
//!
//! Normal and longpoll feeds arrive as one JSON document and are replayed
//! event by event. Continuous feeds are read line by line off a streamed body
//! that keeps its pooled connection checked out. Reading the terminal
//! `last_seq` line drains the body so the connection goes back to the pool;
//! dropping or closing a feed early closes the connection instead.

use futures::stream::{self, Stream};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;

use settee_core::{Body, ChangeEvent, ChangesResponse, Error, Params, Result, Seq};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Feed {
    #[default]
    Normal,
    Longpoll,
    Continuous,
}

impl Feed {
    pub fn as_str(&self) -> &'static str {
        match self {
            Feed::Normal => "normal",
            Feed::Longpoll => "longpoll",
            Feed::Continuous => "continuous",
        }
    }
}

impl fmt::Display for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Query options for `_changes`
#[derive(Debug, Clone, Default)]
pub struct ChangesOptions {
    pub since: Option<Seq>,
    pub feed: Feed,
    /// Milliseconds between empty keep-alive lines on a continuous feed
    pub heartbeat: Option<u64>,
    /// Milliseconds the server waits for changes before ending the response
    pub timeout: Option<u64>,
    pub limit: Option<u64>,
    pub include_docs: bool,
    pub filter: Option<String>,
    pub descending: bool,
    /// `main_only` or `all_docs`
    pub style: Option<String>,
    pub extra: Params,
}

impl ChangesOptions {
    pub fn continuous() -> Self {
        Self {
            feed: Feed::Continuous,
            ..Self::default()
        }
    }

    pub fn since(mut self, seq: impl Into<Seq>) -> Self {
        self.since = Some(seq.into());
        self
    }

    pub fn heartbeat(mut self, millis: u64) -> Self {
        self.heartbeat = Some(millis);
        self
    }

    pub fn timeout(mut self, millis: u64) -> Self {
        self.timeout = Some(millis);
        self
    }

    pub fn include_docs(mut self) -> Self {
        self.include_docs = true;
        self
    }

    pub(crate) fn to_params(&self) -> Params {
        let mut params = Params::new();
        if self.feed != Feed::Normal {
            params.push("feed", self.feed.as_str());
        }
        if let Some(since) = &self.since {
            params.push("since", since.to_param());
        }
        if let Some(heartbeat) = self.heartbeat {
            params.push("heartbeat", heartbeat.to_string());
        }
        if let Some(timeout) = self.timeout {
            params.push("timeout", timeout.to_string());
        }
        if let Some(limit) = self.limit {
            params.push("limit", limit.to_string());
        }
        if self.include_docs {
            params.push_bool("include_docs", true);
        }
        if let Some(filter) = &self.filter {
            params.push("filter", filter.as_str());
        }
        if self.descending {
            params.push_bool("descending", true);
        }
        if let Some(style) = &self.style {
            params.push("style", style.as_str());
        }
        params.extend(&self.extra);
        params
    }
}

enum Source {
    Batch(VecDeque<ChangeEvent>),
    Lines(Body),
    Done,
}

/// Lazy sequence of [`ChangeEvent`]s ending with a `LastSeq` marker
pub struct ChangeFeed {
    source: Source,
    last_seq: Option<Seq>,
    pending: Option<u64>,
}

impl ChangeFeed {
    pub(crate) fn from_response(response: ChangesResponse) -> Self {
        let mut events: VecDeque<ChangeEvent> = response
            .results
            .into_iter()
            .map(ChangeEvent::Change)
            .collect();
        events.push_back(ChangeEvent::LastSeq(response.last_seq.clone()));
        Self {
            source: Source::Batch(events),
            last_seq: Some(response.last_seq),
            pending: response.pending,
        }
    }

    pub(crate) fn from_body(body: Body) -> Self {
        Self {
            source: Source::Lines(body),
            last_seq: None,
            pending: None,
        }
    }

    /// `last_seq` reported by the server; known up front for batch feeds and
    /// once the terminal marker has been read for continuous ones
    pub fn last_seq(&self) -> Option<&Seq> {
        self.last_seq.as_ref()
    }

    pub fn pending(&self) -> Option<u64> {
        self.pending
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.source, Source::Done)
    }

    /// Next event, or `None` once the feed has ended. Read errors surface here
    /// and end the feed.
    pub async fn next(&mut self) -> Option<Result<ChangeEvent>> {
        match self.advance().await {
            Ok(Some(event)) => Some(Ok(event)),
            Ok(None) => None,
            Err(err) => {
                self.source = Source::Done;
                Some(Err(err))
            }
        }
    }

    async fn advance(&mut self) -> Result<Option<ChangeEvent>> {
        match &mut self.source {
            Source::Done => Ok(None),
            Source::Batch(events) => {
                let event = events.pop_front();
                if events.is_empty() {
                    self.source = Source::Done;
                }
                Ok(event)
            }
            Source::Lines(body) => loop {
                let line = match body.next_line().await? {
                    Some(line) => line,
                    None => {
                        self.source = Source::Done;
                        return Ok(None);
                    }
                };
                if line.iter().all(u8::is_ascii_whitespace) {
                    tracing::trace!("Change feed heartbeat");
                    continue;
                }

                let value: Value = serde_json::from_slice(&line).map_err(|e| {
                    Error::InvalidResponse(format!("malformed change feed line: {}", e))
                })?;
                let event = ChangeEvent::from_value(value)?;
                if let ChangeEvent::LastSeq(seq) = &event {
                    body.drain().await?;
                    self.last_seq = Some(seq.clone());
                    self.source = Source::Done;
                }
                return Ok(Some(event));
            },
        }
    }

    /// Stop consuming. An unfinished continuous feed closes its connection.
    pub fn close(self) {
        if let Source::Lines(body) = self.source {
            body.close();
        }
    }

    /// Collect every remaining event
    pub async fn collect(mut self) -> Result<Vec<ChangeEvent>> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event?);
        }
        Ok(events)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<ChangeEvent>> {
        stream::unfold(self, |mut feed| async move {
            feed.next().await.map(|event| (event, feed))
        })
    }
}

impl fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match &self.source {
            Source::Batch(events) => format!("batch({} left)", events.len()),
            Source::Lines(_) => "continuous".to_string(),
            Source::Done => "done".to_string(),
        };
        f.debug_struct("ChangeFeed")
            .field("source", &source)
            .field("last_seq", &self.last_seq)
            .finish()
    }
}
