//! Views and lazy, re-iterable view results.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;

use settee_core::{json, Params, RequestBody, Resource, Result, Row, Seq};

/// Query options shared by permanent and temporary views
#[derive(Debug, Clone, Default)]
pub struct ViewOptions {
    pub key: Option<Value>,
    /// Multi-get; rows come back in the order of these keys
    pub keys: Option<Vec<Value>>,
    pub startkey: Option<Value>,
    pub endkey: Option<Value>,
    pub startkey_docid: Option<String>,
    pub endkey_docid: Option<String>,
    pub limit: Option<u64>,
    pub skip: Option<u64>,
    pub descending: Option<bool>,
    pub include_docs: Option<bool>,
    pub reduce: Option<bool>,
    pub group: Option<bool>,
    pub group_level: Option<u32>,
    pub inclusive_end: Option<bool>,
    /// `ok` or `update_after`
    pub stale: Option<String>,
    pub update_seq: Option<bool>,
    pub extra: Params,
}

impl ViewOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(mut self, key: impl Into<Value>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn keys<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Value>,
    {
        self.keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn include_docs(mut self) -> Self {
        self.include_docs = Some(true);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn reduce(mut self, reduce: bool) -> Self {
        self.reduce = Some(reduce);
        self
    }

    pub fn group(mut self, group: bool) -> Self {
        self.group = Some(group);
        self
    }

    pub fn descending(mut self, descending: bool) -> Self {
        self.descending = Some(descending);
        self
    }

    /// Query string for everything except `keys`, which always travels in
    /// the request body
    pub(crate) fn to_params(&self) -> Result<Params> {
        let mut params = Params::new();
        if let Some(key) = &self.key {
            params.push_json("key", key)?;
        }
        if let Some(startkey) = &self.startkey {
            params.push_json("startkey", startkey)?;
        }
        if let Some(endkey) = &self.endkey {
            params.push_json("endkey", endkey)?;
        }
        if let Some(docid) = &self.startkey_docid {
            params.push("startkey_docid", docid.as_str());
        }
        if let Some(docid) = &self.endkey_docid {
            params.push("endkey_docid", docid.as_str());
        }
        if let Some(limit) = self.limit {
            params.push("limit", limit.to_string());
        }
        if let Some(skip) = self.skip {
            params.push("skip", skip.to_string());
        }
        let flags = [
            ("descending", self.descending),
            ("include_docs", self.include_docs),
            ("reduce", self.reduce),
            ("group", self.group),
            ("inclusive_end", self.inclusive_end),
            ("update_seq", self.update_seq),
        ];
        for (name, flag) in flags {
            if let Some(flag) = flag {
                params.push_bool(name, flag);
            }
        }
        if let Some(level) = self.group_level {
            params.push("group_level", level.to_string());
        }
        if let Some(stale) = &self.stale {
            params.push("stale", stale.as_str());
        }
        params.extend(&self.extra);
        Ok(params)
    }
}

#[derive(Debug, Clone)]
enum ViewKind {
    /// Stored definition; `resource` points at the view endpoint itself
    Permanent { name: String },
    /// Ad hoc map/reduce pair POSTed to `_temp_view`
    Temporary {
        map_fun: String,
        reduce_fun: Option<String>,
        language: String,
    },
}

/// A queryable view endpoint
#[derive(Clone)]
pub struct View {
    resource: Resource,
    kind: ViewKind,
}

impl View {
    pub fn permanent(resource: Resource, name: impl Into<String>) -> Self {
        Self {
            resource,
            kind: ViewKind::Permanent { name: name.into() },
        }
    }

    /// Permanent view addressed by its full URL, e.g. `.../db/_all_docs`
    pub fn from_url(url: &str, session: Arc<settee_core::Session>) -> Result<Self> {
        let resource = Resource::new(url, session)?;
        let name = resource.last_segment().unwrap_or_default();
        Ok(Self::permanent(resource, name))
    }

    /// `resource` is the database's `_temp_view` endpoint
    pub fn temporary(
        resource: Resource,
        map_fun: impl Into<String>,
        reduce_fun: Option<String>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            resource,
            kind: ViewKind::Temporary {
                map_fun: map_fun.into(),
                reduce_fun,
                language: language.into(),
            },
        }
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// Lazy results; nothing is requested until rows or counts are read
    pub fn query(&self, options: ViewOptions) -> ViewResults<Row> {
        ViewResults::new(self.clone(), options, Arc::new(|row: Row| row))
    }

    /// Lazy results with every row passed through `wrapper`
    pub fn query_with<T, F>(&self, options: ViewOptions, wrapper: F) -> ViewResults<T>
    where
        F: Fn(Row) -> T + Send + Sync + 'static,
    {
        ViewResults::new(self.clone(), options, Arc::new(wrapper))
    }

    async fn execute(&self, options: &ViewOptions) -> Result<ViewPage> {
        let params = options.to_params()?;
        let response = match &self.kind {
            ViewKind::Permanent { .. } => match &options.keys {
                None => self.resource.get_json::<ViewPage>(&[], &params).await?,
                Some(keys) => {
                    let body = RequestBody::json(&serde_json::json!({ "keys": keys }))?;
                    self.resource.post_json(&[], body, &params).await?
                }
            },
            ViewKind::Temporary {
                map_fun,
                reduce_fun,
                language,
            } => {
                let mut body = Map::new();
                body.insert("map".to_string(), Value::String(map_fun.clone()));
                if let Some(reduce_fun) = reduce_fun {
                    body.insert("reduce".to_string(), Value::String(reduce_fun.clone()));
                }
                body.insert("language".to_string(), Value::String(language.clone()));
                if let Some(keys) = &options.keys {
                    body.insert("keys".to_string(), json::to_value(keys)?);
                }
                self.resource
                    .post_json(&[], RequestBody::json(&body)?, &params)
                    .await?
            }
        };

        let mut page = response.data;
        if let Some(keys) = &options.keys {
            order_by_keys(&mut page.rows, keys);
        }
        Ok(page)
    }
}

/// Stable reorder of `rows` into the order of `keys`; rows whose key was not
/// requested keep their relative order at the end.
fn order_by_keys(rows: &mut [Row], keys: &[Value]) {
    rows.sort_by_key(|row| {
        keys.iter()
            .position(|key| *key == row.key)
            .unwrap_or(keys.len())
    });
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ViewKind::Permanent { name } => {
                write!(f, "<PermanentView '{}'>", name)
            }
            ViewKind::Temporary {
                map_fun,
                reduce_fun,
                ..
            } => write!(
                f,
                "<TemporaryView '{}' {}>",
                map_fun,
                reduce_fun
                    .as_deref()
                    .map(|r| format!("'{}'", r))
                    .unwrap_or_else(|| "None".to_string())
            ),
        }
    }
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("url", &self.resource.url().as_str())
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ViewPage {
    #[serde(default)]
    total_rows: Option<u64>,
    #[serde(default)]
    offset: Option<u64>,
    #[serde(default)]
    update_seq: Option<Seq>,
    #[serde(default)]
    rows: Vec<Row>,
}

/// Result set of one view execution.
///
/// The request is issued on first access and its rows are kept, so reading
/// the rows twice yields the same sequence without a second roundtrip.
pub struct ViewResults<T = Row> {
    view: View,
    options: ViewOptions,
    wrapper: Arc<dyn Fn(Row) -> T + Send + Sync>,
    page: OnceCell<ViewPage>,
}

impl<T> ViewResults<T> {
    fn new(view: View, options: ViewOptions, wrapper: Arc<dyn Fn(Row) -> T + Send + Sync>) -> Self {
        Self {
            view,
            options,
            wrapper,
            page: OnceCell::new(),
        }
    }

    pub fn view(&self) -> &View {
        &self.view
    }

    pub fn options(&self) -> &ViewOptions {
        &self.options
    }

    async fn page(&self) -> Result<&ViewPage> {
        self.page
            .get_or_try_init(|| self.view.execute(&self.options))
            .await
    }

    /// Rows as returned by the server, before wrapping
    pub async fn raw_rows(&self) -> Result<&[Row]> {
        Ok(&self.page().await?.rows)
    }

    /// Rows passed through the wrapper
    pub async fn rows(&self) -> Result<Vec<T>> {
        let page = self.page().await?;
        Ok(page.rows.iter().cloned().map(|row| (self.wrapper)(row)).collect())
    }

    /// Total rows in the view, not just those fetched. Absent for reduce results.
    pub async fn total_rows(&self) -> Result<Option<u64>> {
        Ok(self.page().await?.total_rows)
    }

    pub async fn offset(&self) -> Result<Option<u64>> {
        Ok(self.page().await?.offset)
    }

    pub async fn update_seq(&self) -> Result<Option<Seq>> {
        Ok(self.page().await?.update_seq.clone())
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.page().await?.rows.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

impl<T> fmt::Debug for ViewResults<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewResults")
            .field("view", &self.view)
            .field("options", &self.options)
            .field("fetched", &self.page.initialized())
            .finish()
    }
}
