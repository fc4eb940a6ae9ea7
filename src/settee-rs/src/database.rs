use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use settee_core::{
    encode_segment, Config, DatabaseInfo, Document, Error, Method, Params, ReadMode, RequestBody,
    Resource, Result, Row, Session,
};

use crate::attachment::{resolve_upload, Attachment, AttachmentContent};
use crate::changes::{ChangeFeed, ChangesOptions, Feed};
use crate::document::{apply_write, field, object_of, object_of_mut, DocumentLike, DocumentRef};
use crate::view::{View, ViewOptions, ViewResults};

const SPECIAL_PREFIXES: &[&str] = &["_design/", "_local/"];

/// Path segments for a document id. Design and local documents keep their
/// prefix as a separate segment; every other id is a single segment, slashes
/// included.
fn doc_segments(id: &str) -> Vec<&str> {
    for prefix in SPECIAL_PREFIXES {
        if let Some(rest) = id.strip_prefix(prefix) {
            return vec![&prefix[..prefix.len() - 1], rest];
        }
    }
    vec![id]
}

/// Document id as it appears in a `Destination` header
fn encode_doc_id(id: &str) -> String {
    for prefix in SPECIAL_PREFIXES {
        if let Some(rest) = id.strip_prefix(prefix) {
            return format!("{}{}", prefix, encode_segment(rest));
        }
    }
    encode_segment(id)
}

/// Segments of a view endpoint for `design/view`, `_all_docs` or a full
/// `_design/design/_view/view` path
fn view_segments(name: &str) -> Result<Vec<String>> {
    if name.starts_with('_') {
        return Ok(name.split('/').map(str::to_string).collect());
    }
    match name.split_once('/') {
        Some((design, view)) if !design.is_empty() && !view.is_empty() => Ok(vec![
            "_design".to_string(),
            design.to_string(),
            "_view".to_string(),
            view.to_string(),
        ]),
        _ => Err(Error::InvalidArgument(format!(
            "view name must be `design/view`, got {:?}",
            name
        ))),
    }
}

/// Options for reading a single document
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Historical revision to fetch instead of the current one
    pub rev: Option<String>,
    /// Include the `_revisions` history
    pub revs: bool,
    /// Include `_conflicts` when conflicting revisions exist
    pub conflicts: bool,
    pub revs_info: bool,
    pub extra: Params,
}

impl GetOptions {
    pub fn rev(rev: impl Into<String>) -> Self {
        Self {
            rev: Some(rev.into()),
            ..Self::default()
        }
    }

    pub fn conflicts() -> Self {
        Self {
            conflicts: true,
            ..Self::default()
        }
    }

    fn to_params(&self) -> Params {
        let mut params = Params::new();
        if let Some(rev) = &self.rev {
            params.push("rev", rev.as_str());
        }
        if self.revs {
            params.push_bool("revs", true);
        }
        if self.conflicts {
            params.push_bool("conflicts", true);
        }
        if self.revs_info {
            params.push_bool("revs_info", true);
        }
        params.extend(&self.extra);
        params
    }
}

/// Outcome of one document in a bulk update, in input order
#[derive(Debug)]
pub struct UpdateResult {
    pub id: String,
    /// New revision, or the per-document error reported by the server
    pub result: std::result::Result<String, Error>,
}

impl UpdateResult {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn rev(&self) -> Option<&str> {
        self.result.as_ref().ok().map(String::as_str)
    }

    pub fn error(&self) -> Option<&Error> {
        self.result.as_ref().err()
    }
}

#[derive(Debug, Deserialize)]
struct WriteResponse {
    id: String,
    rev: String,
}

#[derive(Debug, Deserialize)]
struct OkResponse {
    #[serde(default)]
    ok: bool,
}

#[derive(Serialize)]
struct BulkRequest<'a> {
    docs: Vec<&'a Map<String, Value>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    all_or_nothing: bool,
}

#[derive(Debug, Deserialize)]
struct BulkOutcome {
    #[serde(default)]
    id: String,
    rev: Option<String>,
    error: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RevisionHistory {
    start: u64,
    ids: Vec<String>,
}

/// Handle on one database. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct Database {
    resource: Resource,
    name: String,
}

impl Database {
    /// Database at `url` on a fresh session
    pub fn new(url: &str) -> Result<Self> {
        let resource = Resource::from_config(Config::default().with_url(url))?;
        Ok(Self::from_url_resource(resource))
    }

    pub fn with_session(url: &str, session: Arc<Session>) -> Result<Self> {
        Ok(Self::from_url_resource(Resource::new(url, session)?))
    }

    pub fn from_resource(resource: Resource, name: impl Into<String>) -> Self {
        Self {
            resource,
            name: name.into(),
        }
    }

    fn from_url_resource(resource: Resource) -> Self {
        let name = resource.last_segment().unwrap_or_default();
        Self::from_resource(resource, name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub async fn exists(&self) -> Result<bool> {
        match self.resource.head(&[], &Params::new()).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn info(&self) -> Result<DatabaseInfo> {
        Ok(self.resource.get_json(&[], &Params::new()).await?.data)
    }

    /// Number of live documents
    pub async fn len(&self) -> Result<u64> {
        Ok(self.info().await?.doc_count)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Existence probe; the body is never transferred
    pub async fn contains(&self, id: &str) -> Result<bool> {
        match self.resource.head(&doc_segments(id), &Params::new()).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Current revision of a document, `None` when it does not exist
    pub async fn get(&self, id: &str) -> Result<Option<Document>> {
        self.get_with(id, &GetOptions::default()).await
    }

    pub async fn get_with(&self, id: &str, options: &GetOptions) -> Result<Option<Document>> {
        match self
            .resource
            .get_json::<Document>(&doc_segments(id), &options.to_params())
            .await
        {
            Ok(response) => Ok(Some(response.data)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Create or update the document `id`. On success the new `_id` and
    /// `_rev` are written back into `doc` and the new revision is returned.
    pub async fn set<D: DocumentLike + ?Sized>(&self, id: &str, doc: &mut D) -> Result<String> {
        let map = object_of_mut(doc)?;
        let body = RequestBody::json(&*map)?;
        let response = self
            .resource
            .put_json::<WriteResponse>(&doc_segments(id), body, &Params::new())
            .await?;
        apply_write(map, &response.data.id, &response.data.rev);
        Ok(response.data.rev)
    }

    /// Alias for [`set`](Self::set), matching the map-style naming
    pub async fn put_document<D: DocumentLike + ?Sized>(
        &self,
        id: &str,
        doc: &mut D,
    ) -> Result<String> {
        self.set(id, doc).await
    }

    /// Store `doc` under its own `_id`, generating a UUID when it has none.
    /// Returns `(id, rev)`.
    pub async fn save<D: DocumentLike + ?Sized>(&self, doc: &mut D) -> Result<(String, String)> {
        let id = match field(object_of(doc)?, "_id") {
            Some(id) => id.to_string(),
            None => uuid::Uuid::new_v4().simple().to_string(),
        };
        let rev = self.set(&id, doc).await?;
        Ok((id, rev))
    }

    /// Store a new document and return its id. The id is generated client-side
    /// when `doc` has none, so a retried request cannot create a duplicate.
    pub async fn set_new<D: DocumentLike + ?Sized>(&self, doc: &mut D) -> Result<String> {
        Ok(self.save(doc).await?.0)
    }

    /// Create a document with a server-assigned id (POST)
    pub async fn create<D: DocumentLike + ?Sized>(&self, doc: &mut D) -> Result<String> {
        let map = object_of_mut(doc)?;
        let body = RequestBody::json(&*map)?;
        let response = self
            .resource
            .post_json::<WriteResponse>(&[], body, &Params::new())
            .await?;
        apply_write(map, &response.data.id, &response.data.rev);
        Ok(response.data.id)
    }

    /// Delete a document. A bare id is resolved to its current revision
    /// first; a document carrying `_rev` must be current or `Conflict` is
    /// returned.
    pub async fn delete<R: DocumentRef + ?Sized>(&self, doc: &R) -> Result<()> {
        let doc = doc.doc_ref()?;
        let segments = doc_segments(&doc.id);
        let rev = match doc.rev {
            Some(rev) => rev,
            None => {
                let response = self.resource.head(&segments, &Params::new()).await?;
                response.etag().ok_or_else(|| {
                    Error::InvalidResponse(format!("no ETag for document {}", doc.id))
                })?
            }
        };
        let mut params = Params::new();
        params.push("rev", rev);
        self.resource
            .delete_json::<Value>(&segments, &params)
            .await?;
        Ok(())
    }

    /// Write many documents in one request.
    ///
    /// Every item must be a JSON object; otherwise the call fails with
    /// `UnsupportedType` before anything is sent. Per-document failures are
    /// reported in the returned outcomes, in input order, and successful
    /// writes are mirrored back into `docs`. With `all_or_nothing` the server
    /// applies every write, recording conflicting revisions instead of
    /// rejecting them.
    pub async fn update<D: DocumentLike>(
        &self,
        docs: &mut [D],
        all_or_nothing: bool,
    ) -> Result<Vec<UpdateResult>> {
        let body = {
            let maps = docs
                .iter()
                .map(|doc| object_of(doc))
                .collect::<Result<Vec<_>>>()?;
            RequestBody::json(&BulkRequest {
                docs: maps,
                all_or_nothing,
            })?
        };

        let response = self
            .resource
            .post_json::<Vec<BulkOutcome>>(&["_bulk_docs"], body, &Params::new())
            .await?;
        let outcomes = response.data;
        if outcomes.len() != docs.len() {
            return Err(Error::InvalidResponse(format!(
                "bulk update returned {} outcomes for {} documents",
                outcomes.len(),
                docs.len()
            )));
        }

        let mut results = Vec::with_capacity(outcomes.len());
        for (doc, outcome) in docs.iter_mut().zip(outcomes) {
            let result = match (outcome.rev, outcome.error) {
                (_, Some(error)) => Err(Error::from_bulk(
                    &error,
                    outcome.reason.as_deref().unwrap_or_default(),
                )),
                (Some(rev), None) => {
                    apply_write(object_of_mut(doc)?, &outcome.id, &rev);
                    Ok(rev)
                }
                (None, None) => Err(Error::InvalidResponse(format!(
                    "bulk outcome for {} has neither rev nor error",
                    outcome.id
                ))),
            };
            results.push(UpdateResult {
                id: outcome.id,
                result,
            });
        }

        let failed = results.iter().filter(|r| !r.is_ok()).count();
        tracing::debug!(
            "Bulk update of {} documents in {}: {} failed",
            results.len(),
            self.name,
            failed
        );
        Ok(results)
    }

    /// Server-side copy; returns the destination's new revision.
    ///
    /// A destination carrying `_rev` overwrites that revision, which must be
    /// current. A destination without one must not exist yet.
    pub async fn copy<S, T>(&self, src: &S, dest: &T) -> Result<String>
    where
        S: DocumentRef + ?Sized,
        T: DocumentRef + ?Sized,
    {
        let src = src.doc_ref()?;
        let dest = dest.doc_ref()?;

        let mut params = Params::new();
        if let Some(rev) = &src.rev {
            params.push("rev", rev.as_str());
        }
        let destination = match &dest.rev {
            Some(rev) => format!("{}?rev={}", encode_doc_id(&dest.id), encode_segment(rev)),
            None => encode_doc_id(&dest.id),
        };

        let response = self
            .resource
            .copy_json::<WriteResponse>(&doc_segments(&src.id), &destination, &params)
            .await?;
        Ok(response.data.rev)
    }

    /// Start compaction of the database, or of one design document's view
    /// indexes. Returns whether the request was accepted; poll
    /// [`info`](Self::info) for `compact_running` to see it finish.
    pub async fn compact(&self, ddoc: Option<&str>) -> Result<bool> {
        let mut segments = vec!["_compact"];
        if let Some(ddoc) = ddoc {
            segments.push(ddoc);
        }
        let response = self
            .resource
            .post_json::<OkResponse>(&segments, empty_json(), &Params::new())
            .await?;
        Ok(response.data.ok)
    }

    /// Ensure recent writes are on disk
    pub async fn commit(&self) -> Result<Value> {
        Ok(self
            .resource
            .post_json(&["_ensure_full_commit"], empty_json(), &Params::new())
            .await?
            .data)
    }

    /// Remove index files no longer used by any design document
    pub async fn cleanup(&self) -> Result<bool> {
        let response = self
            .resource
            .post_json::<OkResponse>(&["_view_cleanup"], empty_json(), &Params::new())
            .await?;
        Ok(response.data.ok)
    }

    /// Purge documents entirely, history included. Each must carry `_rev`.
    pub async fn purge<R: DocumentRef>(&self, docs: &[R]) -> Result<Value> {
        let mut body: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for doc in docs {
            let doc = doc.doc_ref()?;
            let rev = doc.rev.ok_or_else(|| {
                Error::InvalidArgument(format!("cannot purge {} without a revision", doc.id))
            })?;
            body.entry(doc.id).or_default().push(rev);
        }
        Ok(self
            .resource
            .post_json(&["_purge"], RequestBody::json(&body)?, &Params::new())
            .await?
            .data)
    }

    /// Ids of every document, design documents included
    pub async fn ids(&self) -> Result<Vec<String>> {
        let results = self.all_docs(ViewOptions::default());
        Ok(results
            .raw_rows()
            .await?
            .iter()
            .filter_map(|row| row.id.clone())
            .collect())
    }

    /// Index status of a design document
    pub async fn design_info(&self, ddoc: &str) -> Result<Value> {
        Ok(self
            .resource
            .get_json(&["_design", ddoc, "_info"], &Params::new())
            .await?
            .data)
    }

    /// Every retrievable revision of `id`, newest first. Empty when the
    /// document does not exist; ends at the first revision that has been
    /// compacted away.
    pub fn revisions(&self, id: &str) -> BoxStream<'static, Result<Document>> {
        let db = self.clone();
        let id = id.to_string();
        stream::try_unfold(None, move |pending| {
            let db = db.clone();
            let id = id.clone();
            async move { db.next_revision(&id, pending).await }
        })
        .boxed()
    }

    /// `pending` is `None` until the history has been fetched
    async fn next_revision(
        &self,
        id: &str,
        pending: Option<VecDeque<String>>,
    ) -> Result<Option<(Document, Option<VecDeque<String>>)>> {
        let mut pending = match pending {
            Some(pending) => pending,
            None => match self.revision_ids(id).await? {
                Some(revs) => revs,
                None => return Ok(None),
            },
        };
        let Some(rev) = pending.pop_front() else {
            return Ok(None);
        };
        Ok(self
            .get_with(id, &GetOptions::rev(rev))
            .await?
            .map(|doc| (doc, Some(pending))))
    }

    async fn revision_ids(&self, id: &str) -> Result<Option<VecDeque<String>>> {
        let options = GetOptions {
            revs: true,
            ..GetOptions::default()
        };
        let Some(doc) = self.get_with(id, &options).await? else {
            return Ok(None);
        };
        let history: RevisionHistory = doc
            .get("_revisions")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| Error::InvalidResponse(format!("malformed _revisions: {}", e)))?
            .ok_or_else(|| Error::InvalidResponse(format!("no _revisions for {}", id)))?;

        Ok(Some(
            history
                .ids
                .iter()
                .enumerate()
                .filter_map(|(index, hash)| {
                    let generation = history.start.checked_sub(index as u64)?;
                    Some(format!("{}-{}", generation, hash))
                })
                .collect(),
        ))
    }

    /// Open the change feed. Continuous feeds stream; normal and longpoll
    /// feeds are read in one piece.
    pub async fn changes(&self, options: &ChangesOptions) -> Result<ChangeFeed> {
        let response = self
            .resource
            .request(
                Method::Get,
                &["_changes"],
                RequestBody::Empty,
                &[],
                &options.to_params(),
                ReadMode::Streamed,
            )
            .await?;
        match options.feed {
            Feed::Continuous => Ok(ChangeFeed::from_body(response.body)),
            Feed::Normal | Feed::Longpoll => {
                Ok(ChangeFeed::from_response(response.body.json().await?))
            }
        }
    }

    /// Attach `content` to `doc`, advancing its `_rev` in place. The filename
    /// may only be omitted for file sources; the content type defaults to one
    /// guessed from the filename.
    pub async fn put_attachment<D: DocumentLike + ?Sized>(
        &self,
        doc: &mut D,
        content: impl Into<AttachmentContent>,
        filename: Option<&str>,
        content_type: Option<&str>,
    ) -> Result<String> {
        let content = content.into();
        let (filename, content_type) = resolve_upload(&content, filename, content_type)?;
        let map = object_of_mut(doc)?;
        let id = field(map, "_id")
            .ok_or_else(|| Error::InvalidArgument("document has no `_id`".to_string()))?
            .to_string();

        let mut params = Params::new();
        if let Some(rev) = field(map, "_rev") {
            params.push("rev", rev);
        }
        let bytes = content.into_bytes().await?;
        let mut segments = doc_segments(&id);
        segments.push(&filename);

        let response = self
            .resource
            .put_json::<WriteResponse>(&segments, RequestBody::raw(bytes, content_type), &params)
            .await?;
        apply_write(map, &response.data.id, &response.data.rev);
        Ok(response.data.rev)
    }

    /// Stream an attachment; `None` when the document or attachment is missing
    pub async fn get_attachment<R: DocumentRef + ?Sized>(
        &self,
        doc: &R,
        filename: &str,
    ) -> Result<Option<Attachment>> {
        let doc = doc.doc_ref()?;
        let mut segments = doc_segments(&doc.id);
        segments.push(filename);

        let response = match self
            .resource
            .request(
                Method::Get,
                &segments,
                RequestBody::Empty,
                &[],
                &Params::new(),
                ReadMode::Streamed,
            )
            .await
        {
            Ok(response) => response,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };

        let content_type = response.header("content-type").map(str::to_string);
        let length = response
            .header("content-length")
            .and_then(|len| len.parse().ok());
        Ok(Some(Attachment::new(content_type, length, response.body)))
    }

    /// Remove an attachment, advancing `doc`'s `_rev` in place
    pub async fn delete_attachment<D: DocumentLike + ?Sized>(
        &self,
        doc: &mut D,
        filename: &str,
    ) -> Result<String> {
        let map = object_of_mut(doc)?;
        let id = field(map, "_id")
            .ok_or_else(|| Error::InvalidArgument("document has no `_id`".to_string()))?
            .to_string();
        let rev = field(map, "_rev")
            .ok_or_else(|| Error::InvalidArgument("document has no `_rev`".to_string()))?
            .to_string();

        let mut params = Params::new();
        params.push("rev", rev);
        let mut segments = doc_segments(&id);
        segments.push(filename);

        let response = self
            .resource
            .delete_json::<WriteResponse>(&segments, &params)
            .await?;
        apply_write(map, &response.data.id, &response.data.rev);
        Ok(response.data.rev)
    }

    /// Handle on a stored view: `design/view`, `_all_docs`, or a full path
    pub fn permanent_view(&self, name: &str) -> Result<View> {
        let segments = view_segments(name)?;
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
        Ok(View::permanent(self.resource.child(&segments), name))
    }

    /// Ad hoc view over this database
    pub fn temporary_view(&self, map_fun: &str, reduce_fun: Option<&str>, language: &str) -> View {
        View::temporary(
            self.resource.child(&["_temp_view"]),
            map_fun,
            reduce_fun.map(str::to_string),
            language,
        )
    }

    /// Run a JavaScript map (and optional reduce) function without storing it
    pub fn query(
        &self,
        map_fun: &str,
        reduce_fun: Option<&str>,
        options: ViewOptions,
    ) -> ViewResults<Row> {
        self.temporary_view(map_fun, reduce_fun, "javascript")
            .query(options)
    }

    pub fn view(&self, name: &str, options: ViewOptions) -> Result<ViewResults<Row>> {
        Ok(self.permanent_view(name)?.query(options))
    }

    /// Like [`view`](Self::view), passing every row through `wrapper`
    pub fn view_with<T, F>(&self, name: &str, options: ViewOptions, wrapper: F) -> Result<ViewResults<T>>
    where
        F: Fn(Row) -> T + Send + Sync + 'static,
    {
        Ok(self.permanent_view(name)?.query_with(options, wrapper))
    }

    pub fn all_docs(&self, options: ViewOptions) -> ViewResults<Row> {
        View::permanent(self.resource.child(&["_all_docs"]), "_all_docs").query(options)
    }
}

fn empty_json() -> RequestBody {
    RequestBody::raw(Vec::new(), "application/json")
}

impl fmt::Display for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Database '{}'>", self.name)
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("resource", &self.resource)
            .finish()
    }
}
