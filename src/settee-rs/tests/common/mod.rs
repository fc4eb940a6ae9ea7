//! In-memory document server behind a `MockTransport`.
//!
//! Implements enough of the HTTP API for the client to be exercised end to
//! end: databases, revisioned documents with conflicts and compaction, bulk
//! updates, COPY, attachments, change feeds (normal and continuous) and views.
//! Map and reduce functions cannot be evaluated, so tests register a Rust
//! closure for each function source they submit.

#![allow(dead_code)]

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use settee_core::mock::{MockResponse, MockTransport};
use settee_core::{decode_segment, Config, HttpRequest, Method, PoolKey, Session};
use settee_rs::{Database, Server};

pub const BASE_URL: &str = "http://localhost:5984/";

pub type MapFn = Arc<dyn Fn(&Map<String, Value>) -> Vec<(Value, Value)> + Send + Sync>;
pub type ReduceFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

pub fn pool_key() -> PoolKey {
    PoolKey::new("http", "localhost:5984")
}

#[derive(Clone)]
pub struct FakeCouch {
    state: Arc<Mutex<State>>,
    pub transport: MockTransport,
}

impl FakeCouch {
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(State::default()));
        let handler_state = state.clone();
        let transport = MockTransport::new(move |req| Ok(handler_state.lock().handle(req)));
        Self { state, transport }
    }

    pub fn config() -> Config {
        Config::default().with_url(BASE_URL)
    }

    pub fn session_with(&self, config: Config) -> Arc<Session> {
        Arc::new(Session::with_transport(config, Arc::new(self.transport.clone())))
    }

    pub fn session(&self) -> Arc<Session> {
        self.session_with(Self::config())
    }

    pub fn server(&self) -> Server {
        Server::with_session(BASE_URL, self.session()).expect("base URL is valid")
    }

    /// Server plus a freshly created database
    pub async fn with_db(&self, name: &str) -> (Server, Database) {
        let server = self.server();
        let db = server.create(name).await.expect("database created");
        (server, db)
    }

    pub fn register_map<F>(&self, source: &str, map: F)
    where
        F: Fn(&Map<String, Value>) -> Vec<(Value, Value)> + Send + Sync + 'static,
    {
        self.state.lock().maps.insert(source.to_string(), Arc::new(map));
    }

    pub fn register_reduce<F>(&self, source: &str, reduce: F)
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        self.state
            .lock()
            .reduces
            .insert(source.to_string(), Arc::new(reduce));
    }

    /// Overwrite a document behind the client's back
    pub fn force_put(&self, db: &str, id: &str, body: Value) -> String {
        let mut state = self.state.lock();
        let db = state.dbs.get_mut(db).expect("database exists");
        let body = match body {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        db.push_revision(id, strip_reserved(body), false)
    }
}

struct Revision {
    rev: String,
    /// `None` once compacted away
    body: Option<Map<String, Value>>,
}

struct StoredAttachment {
    content_type: String,
    data: Bytes,
    revpos: u64,
}

struct DocEntry {
    /// Oldest first
    history: Vec<Revision>,
    deleted: bool,
    conflicts: Vec<String>,
    attachments: BTreeMap<String, StoredAttachment>,
    seq: u64,
}

impl DocEntry {
    fn current(&self) -> &Revision {
        &self.history[self.history.len() - 1]
    }

    fn current_rev(&self) -> &str {
        &self.current().rev
    }

    fn live(&self) -> bool {
        !self.deleted
    }
}

#[derive(Default)]
struct Db {
    docs: BTreeMap<String, DocEntry>,
    update_seq: u64,
    purge_seq: u64,
    rev_counter: u64,
}

#[derive(Default)]
struct State {
    dbs: BTreeMap<String, Db>,
    uuid_counter: u64,
    maps: HashMap<String, MapFn>,
    reduces: HashMap<String, ReduceFn>,
}

fn respond(status: u16, body: Value) -> MockResponse {
    MockResponse::json(status, body)
}

fn error(status: u16, error: &str, reason: &str) -> MockResponse {
    respond(status, json!({"error": error, "reason": reason}))
}

fn not_found(reason: &str) -> MockResponse {
    error(404, "not_found", reason)
}

fn conflict() -> MockResponse {
    error(409, "conflict", "Document update conflict.")
}

fn generation(rev: &str) -> u64 {
    rev.split('-')
        .next()
        .and_then(|g| g.parse().ok())
        .unwrap_or(0)
}

fn rev_hash(rev: &str) -> &str {
    rev.split_once('-').map(|(_, h)| h).unwrap_or(rev)
}

fn strip_reserved(mut body: Map<String, Value>) -> Map<String, Value> {
    body.retain(|key, _| !key.starts_with('_'));
    body
}

fn parse_body(req: &HttpRequest) -> Result<Value, MockResponse> {
    if req.body.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&req.body).map_err(|_| error(400, "bad_request", "invalid UTF-8 JSON"))
}

fn parse_object(req: &HttpRequest) -> Result<Map<String, Value>, MockResponse> {
    match parse_body(req)? {
        Value::Object(map) => Ok(map),
        _ => Err(error(400, "bad_request", "Document must be a JSON object")),
    }
}

fn query(req: &HttpRequest) -> HashMap<String, String> {
    req.url.query_pairs().into_owned().collect()
}

fn json_param(query: &HashMap<String, String>, name: &str) -> Option<Value> {
    query.get(name).and_then(|v| serde_json::from_str(v).ok())
}

fn flag(query: &HashMap<String, String>, name: &str) -> bool {
    query.get(name).map(|v| v == "true").unwrap_or(false)
}

/// JSON view collation: null < false < true < numbers < strings < arrays < objects
fn collate(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(false) => 1,
            Value::Bool(true) => 2,
            Value::Number(_) => 3,
            Value::String(_) => 4,
            Value::Array(_) => 5,
            Value::Object(_) => 6,
        }
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y)
            .map(|(l, r)| collate(l, r))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn builtin_reduce(source: &str) -> Option<ReduceFn> {
    match source {
        "_count" => Some(Arc::new(|values: &[Value]| json!(values.len()))),
        "_sum" => Some(Arc::new(|values: &[Value]| {
            json!(values.iter().filter_map(Value::as_f64).sum::<f64>())
        })),
        _ => None,
    }
}

impl Db {
    fn info(&self, name: &str) -> Value {
        let live = self.docs.values().filter(|d| d.live()).count();
        let deleted = self.docs.len() - live;
        json!({
            "db_name": name,
            "doc_count": live,
            "doc_del_count": deleted,
            "update_seq": self.update_seq,
            "purge_seq": self.purge_seq,
            "compact_running": false,
            "disk_size": 4096,
            "instance_start_time": "0"
        })
    }

    fn live(&self, id: &str) -> Option<&DocEntry> {
        self.docs.get(id).filter(|doc| doc.live())
    }

    /// Verify `given` against the current revision. With `force`, a mismatch
    /// records the current revision as a conflict instead of failing.
    fn check_rev(&mut self, id: &str, given: Option<&str>, force: bool) -> Result<(), MockResponse> {
        let current = self.live(id).map(|doc| doc.current_rev().to_string());
        let exists = self.docs.contains_key(id);
        match (current, given) {
            (Some(current), Some(given)) if current == given => Ok(()),
            (None, None) => Ok(()),
            (None, Some(_)) if exists => Ok(()),
            (current, _) if force => {
                if let (Some(current), Some(doc)) = (current, self.docs.get_mut(id)) {
                    doc.conflicts.push(current);
                }
                Ok(())
            }
            _ => Err(conflict()),
        }
    }

    fn push_revision(&mut self, id: &str, body: Map<String, Value>, deleted: bool) -> String {
        self.rev_counter += 1;
        self.update_seq += 1;
        let counter = self.rev_counter;
        let seq = self.update_seq;
        let doc = self.docs.entry(id.to_string()).or_insert_with(|| DocEntry {
            history: Vec::new(),
            deleted: false,
            conflicts: Vec::new(),
            attachments: BTreeMap::new(),
            seq: 0,
        });
        let next = doc.history.last().map(|r| generation(&r.rev)).unwrap_or(0) + 1;
        let rev = format!("{}-{:032x}", next, counter);
        doc.history.push(Revision {
            rev: rev.clone(),
            body: Some(body),
        });
        doc.deleted = deleted;
        doc.seq = seq;
        if deleted {
            doc.attachments.clear();
        }
        rev
    }

    /// Store `body` as the next revision of `id`; attachments survive only
    /// when the body still lists them.
    fn write(
        &mut self,
        id: &str,
        mut body: Map<String, Value>,
        given: Option<&str>,
        force: bool,
    ) -> Result<String, MockResponse> {
        self.check_rev(id, given, force)?;
        let keep: Option<Vec<String>> = body
            .get("_attachments")
            .and_then(Value::as_object)
            .map(|atts| atts.keys().cloned().collect());
        body = strip_reserved(body);
        if let Some(doc) = self.docs.get_mut(id) {
            match &keep {
                Some(keep) => doc.attachments.retain(|name, _| keep.contains(name)),
                None => doc.attachments.clear(),
            }
        }
        Ok(self.push_revision(id, body, false))
    }

    fn render(&self, id: &str, doc: &DocEntry, revision: &Revision) -> Map<String, Value> {
        let mut map = revision.body.clone().unwrap_or_default();
        map.insert("_id".to_string(), json!(id));
        map.insert("_rev".to_string(), json!(revision.rev));
        if revision.rev == doc.current_rev() && !doc.attachments.is_empty() {
            let atts: Map<String, Value> = doc
                .attachments
                .iter()
                .map(|(name, att)| {
                    (
                        name.clone(),
                        json!({
                            "content_type": att.content_type,
                            "revpos": att.revpos,
                            "length": att.data.len(),
                            "stub": true
                        }),
                    )
                })
                .collect();
            map.insert("_attachments".to_string(), Value::Object(atts));
        }
        map
    }

    fn render_current(&self, id: &str) -> Option<Value> {
        let doc = self.live(id)?;
        Some(Value::Object(self.render(id, doc, doc.current())))
    }

    fn get_doc(&self, id: &str, req: &HttpRequest) -> MockResponse {
        let query = query(req);
        let Some(doc) = self.docs.get(id) else {
            return not_found("missing");
        };
        let revision = match query.get("rev") {
            Some(rev) => match doc.history.iter().find(|r| &r.rev == rev) {
                Some(revision) if revision.body.is_some() => revision,
                _ => return not_found("missing"),
            },
            None if doc.deleted => return not_found("deleted"),
            None => doc.current(),
        };

        let etag = format!("\"{}\"", revision.rev);
        if req.method == Method::Get && req.header("if-none-match") == Some(etag.as_str()) {
            return MockResponse::new(304).with_header("etag", etag);
        }

        let mut map = self.render(id, doc, revision);
        if flag(&query, "revs") {
            let position = doc
                .history
                .iter()
                .position(|r| r.rev == revision.rev)
                .unwrap_or(0);
            let ids: Vec<Value> = doc.history[..=position]
                .iter()
                .rev()
                .map(|r| json!(rev_hash(&r.rev)))
                .collect();
            map.insert(
                "_revisions".to_string(),
                json!({"start": generation(&revision.rev), "ids": ids}),
            );
        }
        if flag(&query, "conflicts") && !doc.conflicts.is_empty() {
            map.insert("_conflicts".to_string(), json!(doc.conflicts));
        }
        respond(200, Value::Object(map)).with_header("etag", etag)
    }

    fn delete_doc(&mut self, id: &str, req: &HttpRequest) -> MockResponse {
        if self.live(id).is_none() {
            return not_found("missing");
        }
        let query = query(req);
        if let Err(response) = self.check_rev(id, query.get("rev").map(String::as_str), false) {
            return response;
        }
        let rev = self.push_revision(id, Map::new(), true);
        respond(200, json!({"ok": true, "id": id, "rev": rev}))
    }

    fn copy_doc(&mut self, id: &str, req: &HttpRequest) -> MockResponse {
        let query = query(req);
        let Some(doc) = self.docs.get(id) else {
            return not_found("missing");
        };
        let body = match query.get("rev") {
            Some(rev) => doc
                .history
                .iter()
                .find(|r| &r.rev == rev)
                .and_then(|r| r.body.clone()),
            None if doc.deleted => None,
            None => doc.current().body.clone(),
        };
        let Some(body) = body else {
            return not_found("missing");
        };

        let Some(destination) = req.header("destination") else {
            return error(400, "bad_request", "Destination header is mandatory for COPY.");
        };
        let (dest_id, dest_rev) = match destination.split_once('?') {
            Some((dest_id, query)) => (
                decode_segment(dest_id),
                query.strip_prefix("rev=").map(decode_segment),
            ),
            None => (decode_segment(destination), None),
        };
        match self.write(&dest_id, body, dest_rev.as_deref(), false) {
            Ok(rev) => respond(201, json!({"ok": true, "id": dest_id, "rev": rev})),
            Err(response) => response,
        }
    }

    fn attachment(&mut self, id: &str, name: &str, req: &HttpRequest) -> MockResponse {
        let query = query(req);
        let given = query.get("rev").map(String::as_str);
        match req.method {
            Method::Get | Method::Head => {
                match self.live(id).and_then(|doc| doc.attachments.get(name)) {
                    Some(att) => MockResponse::bytes(200, &att.content_type, att.data.clone())
                        .with_header("content-length", att.data.len().to_string()),
                    None => not_found("Document is missing attachment"),
                }
            }
            Method::Put => {
                if let Err(response) = self.check_rev(id, given, false) {
                    return response;
                }
                let body = self
                    .live(id)
                    .and_then(|doc| doc.current().body.clone())
                    .unwrap_or_default();
                let rev = self.push_revision(id, body, false);
                let content_type = req
                    .header("content-type")
                    .unwrap_or("application/octet-stream")
                    .to_string();
                if let Some(doc) = self.docs.get_mut(id) {
                    doc.attachments.insert(
                        name.to_string(),
                        StoredAttachment {
                            content_type,
                            data: req.body.clone(),
                            revpos: generation(&rev),
                        },
                    );
                }
                respond(201, json!({"ok": true, "id": id, "rev": rev}))
            }
            Method::Delete => {
                if self
                    .live(id)
                    .map(|doc| !doc.attachments.contains_key(name))
                    .unwrap_or(true)
                {
                    return not_found("Document is missing attachment");
                }
                if let Err(response) = self.check_rev(id, given, false) {
                    return response;
                }
                let body = self
                    .live(id)
                    .and_then(|doc| doc.current().body.clone())
                    .unwrap_or_default();
                let rev = self.push_revision(id, body, false);
                if let Some(doc) = self.docs.get_mut(id) {
                    doc.attachments.remove(name);
                }
                respond(200, json!({"ok": true, "id": id, "rev": rev}))
            }
            _ => error(405, "method_not_allowed", "Only GET,HEAD,PUT,DELETE allowed"),
        }
    }

    fn document(&mut self, id: &str, req: &HttpRequest) -> MockResponse {
        match req.method {
            Method::Head | Method::Get => self.get_doc(id, req),
            Method::Put => {
                let body = match parse_object(req) {
                    Ok(body) => body,
                    Err(response) => return response,
                };
                let query = query(req);
                let given = body
                    .get("_rev")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| query.get("rev").cloned());
                match self.write(id, body, given.as_deref(), false) {
                    Ok(rev) => respond(201, json!({"ok": true, "id": id, "rev": rev})),
                    Err(response) => response,
                }
            }
            Method::Delete => self.delete_doc(id, req),
            Method::Copy => self.copy_doc(id, req),
            Method::Post => error(405, "method_not_allowed", "Only GET,HEAD,PUT,DELETE,COPY allowed"),
        }
    }

    fn bulk_docs(&mut self, req: &HttpRequest, uuids: &mut u64) -> MockResponse {
        let body = match parse_object(req) {
            Ok(body) => body,
            Err(response) => return response,
        };
        let force = body
            .get("all_or_nothing")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let docs = body
            .get("docs")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let outcomes: Vec<Value> = docs
            .into_iter()
            .map(|doc| {
                let Value::Object(doc) = doc else {
                    return json!({"error": "bad_request", "reason": "Document must be a JSON object"});
                };
                let id = match doc.get("_id").and_then(Value::as_str) {
                    Some(id) => id.to_string(),
                    None => {
                        *uuids += 1;
                        format!("{:032x}", *uuids)
                    }
                };
                let given = doc.get("_rev").and_then(Value::as_str).map(str::to_string);
                match self.write(&id, doc, given.as_deref(), force) {
                    Ok(rev) => json!({"id": id, "rev": rev}),
                    Err(_) => {
                        json!({"id": id, "error": "conflict", "reason": "Document update conflict."})
                    }
                }
            })
            .collect();
        respond(201, Value::Array(outcomes))
    }

    fn change_rows(&self, query: &HashMap<String, String>) -> Vec<Value> {
        let since: u64 = query
            .get("since")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let include_docs = flag(query, "include_docs");
        let mut docs: Vec<(&String, &DocEntry)> =
            self.docs.iter().filter(|(_, doc)| doc.seq > since).collect();
        docs.sort_by_key(|(_, doc)| doc.seq);
        if flag(query, "descending") {
            docs.reverse();
        }
        if let Some(limit) = query.get("limit").and_then(|l| l.parse().ok()) {
            docs.truncate(limit);
        }

        docs.into_iter()
            .map(|(id, doc)| {
                let mut row = json!({
                    "seq": doc.seq,
                    "id": id,
                    "changes": [{"rev": doc.current_rev()}]
                });
                if doc.deleted {
                    row["deleted"] = json!(true);
                }
                if include_docs {
                    row["doc"] = self.render_current(id).unwrap_or(Value::Null);
                }
                row
            })
            .collect()
    }

    fn changes(&self, req: &HttpRequest) -> MockResponse {
        let query = query(req);
        let rows = self.change_rows(&query);
        let last_seq = rows
            .last()
            .and_then(|row| row["seq"].as_u64())
            .unwrap_or(self.update_seq);

        if query.get("feed").map(String::as_str) != Some("continuous") {
            return respond(200, json!({"results": rows, "last_seq": last_seq}));
        }

        let mut response = MockResponse::new(200).with_header("content-type", "text/plain");
        if query.contains_key("heartbeat") {
            response = response.with_chunk("\n");
        }
        for row in rows {
            response = response.with_chunk(format!("{}\n", row));
        }
        if query.contains_key("timeout") {
            response.with_chunk(format!("{}\n", json!({"last_seq": last_seq})))
        } else {
            response.never_ending()
        }
    }

    fn compact(&mut self) {
        for doc in self.docs.values_mut() {
            let current = doc.history.len() - 1;
            for revision in &mut doc.history[..current] {
                revision.body = None;
            }
        }
    }

    fn purge(&mut self, req: &HttpRequest) -> MockResponse {
        let body = match parse_object(req) {
            Ok(body) => body,
            Err(response) => return response,
        };
        let mut purged = Map::new();
        for (id, revs) in body {
            let revs: Vec<String> = revs
                .as_array()
                .map(|revs| revs.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default();
            let matches = self
                .docs
                .get(&id)
                .map(|doc| revs.iter().any(|rev| rev == doc.current_rev()))
                .unwrap_or(false);
            if matches {
                self.docs.remove(&id);
                purged.insert(id, json!(revs));
            }
        }
        self.purge_seq += 1;
        respond(200, json!({"purge_seq": self.purge_seq, "purged": purged}))
    }

    fn all_docs(&self, req: &HttpRequest) -> MockResponse {
        let query = query(req);
        let include_docs = flag(&query, "include_docs");
        let total = self.docs.values().filter(|d| d.live()).count();
        let row_for = |id: &str| -> Option<Value> {
            let doc = self.live(id)?;
            let mut row = json!({"id": id, "key": id, "value": {"rev": doc.current_rev()}});
            if include_docs {
                row["doc"] = self.render_current(id).unwrap_or(Value::Null);
            }
            Some(row)
        };

        let keys = request_keys(req, &query);
        let rows: Vec<Value> = match keys {
            Some(keys) => keys
                .iter()
                .map(|key| {
                    key.as_str()
                        .and_then(|id| row_for(id))
                        .unwrap_or_else(|| json!({"key": key, "error": "not_found"}))
                })
                .collect(),
            None => self
                .docs
                .keys()
                .filter_map(|id| row_for(id.as_str()))
                .collect(),
        };
        respond(200, json!({"total_rows": total, "offset": 0, "rows": rows}))
    }

    fn run_view(
        &self,
        map: &MapFn,
        reduce: Option<ReduceFn>,
        req: &HttpRequest,
        body_keys: Option<Vec<Value>>,
    ) -> MockResponse {
        let query = query(req);
        let mut rows: Vec<(String, Value, Value)> = Vec::new();
        for (id, doc) in &self.docs {
            if !doc.live() || id.starts_with("_design/") {
                continue;
            }
            let rendered = self.render(id, doc, doc.current());
            for (key, value) in map(&rendered) {
                rows.push((id.clone(), key, value));
            }
        }
        rows.sort_by(|a, b| collate(&a.1, &b.1).then_with(|| a.0.cmp(&b.0)));
        let total = rows.len();

        if let Some(key) = json_param(&query, "key") {
            rows.retain(|row| row.1 == key);
        }
        if let Some(keys) = body_keys.or_else(|| json_param(&query, "keys").and_then(|k| k.as_array().cloned())) {
            rows.retain(|row| keys.contains(&row.1));
        }
        if let Some(start) = json_param(&query, "startkey") {
            rows.retain(|row| collate(&row.1, &start) != Ordering::Less);
        }
        if let Some(end) = json_param(&query, "endkey") {
            rows.retain(|row| collate(&row.1, &end) != Ordering::Greater);
        }
        if flag(&query, "descending") {
            rows.reverse();
        }

        let reduce = reduce.filter(|_| query.get("reduce").map(String::as_str) != Some("false"));
        if let Some(reduce) = reduce {
            let grouped: Vec<Value> = if flag(&query, "group") {
                let mut groups: Vec<(Value, Vec<Value>)> = Vec::new();
                for (_, key, value) in rows {
                    match groups.last_mut() {
                        Some((last, values)) if *last == key => values.push(value),
                        _ => groups.push((key, vec![value])),
                    }
                }
                groups
                    .into_iter()
                    .map(|(key, values)| json!({"key": key, "value": reduce(&values)}))
                    .collect()
            } else if rows.is_empty() {
                Vec::new()
            } else {
                let values: Vec<Value> = rows.into_iter().map(|row| row.2).collect();
                vec![json!({"key": null, "value": reduce(&values)})]
            };
            return respond(200, json!({"rows": grouped}));
        }

        let skip: usize = query.get("skip").and_then(|s| s.parse().ok()).unwrap_or(0);
        let limit: usize = query
            .get("limit")
            .and_then(|s| s.parse().ok())
            .unwrap_or(usize::MAX);
        let include_docs = flag(&query, "include_docs");
        let rows: Vec<Value> = rows
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|(id, key, value)| {
                let mut row = json!({"id": id, "key": key, "value": value});
                if include_docs {
                    row["doc"] = self.render_current(&id).unwrap_or(Value::Null);
                }
                row
            })
            .collect();
        respond(200, json!({"total_rows": total, "offset": skip, "rows": rows}))
    }
}

fn request_keys(req: &HttpRequest, query: &HashMap<String, String>) -> Option<Vec<Value>> {
    if req.method == Method::Post {
        if let Ok(Value::Object(body)) = parse_body(req) {
            if let Some(keys) = body.get("keys").and_then(Value::as_array) {
                return Some(keys.clone());
            }
        }
    }
    json_param(query, "keys").and_then(|keys| keys.as_array().cloned())
}

impl State {
    fn handle(&mut self, req: &HttpRequest) -> MockResponse {
        let owned: Vec<String> = req
            .url
            .path_segments()
            .map(|segments| {
                segments
                    .filter(|s| !s.is_empty())
                    .map(decode_segment)
                    .collect()
            })
            .unwrap_or_default();
        let segments: Vec<&str> = owned.iter().map(String::as_str).collect();

        match (req.method, segments.as_slice()) {
            (Method::Get | Method::Head, []) => {
                respond(200, json!({"couchdb": "Welcome", "version": "1.6.1"}))
            }
            (Method::Get, ["_all_dbs"]) => {
                respond(200, json!(self.dbs.keys().collect::<Vec<_>>()))
            }
            (Method::Get, ["_uuids"]) => {
                let count: u64 = query(req)
                    .get("count")
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(1);
                let uuids: Vec<String> = (0..count)
                    .map(|_| {
                        self.uuid_counter += 1;
                        format!("{:032x}", self.uuid_counter)
                    })
                    .collect();
                respond(200, json!({"uuids": uuids}))
            }
            (Method::Get, ["_config"]) => respond(
                200,
                json!({"query_servers": {"javascript": "couchjs main.js"}}),
            ),
            (Method::Get, ["_stats", ..]) => {
                respond(200, json!({"couchdb": {"open_databases": {"current": self.dbs.len()}}}))
            }
            (Method::Get, ["_active_tasks"]) => respond(200, json!([])),
            (Method::Post, ["_replicate"]) => self.replicate(req),
            (_, [name, rest @ ..]) => self.database(name, rest, req),
            _ => error(400, "bad_request", "unsupported request"),
        }
    }

    fn replicate(&mut self, req: &HttpRequest) -> MockResponse {
        let body = match parse_object(req) {
            Ok(body) => body,
            Err(response) => return response,
        };
        let db_name = |field: &str| -> String {
            let raw = body.get(field).and_then(Value::as_str).unwrap_or_default();
            raw.trim_end_matches('/')
                .rsplit('/')
                .next()
                .map(decode_segment)
                .unwrap_or_default()
        };
        let (source, target) = (db_name("source"), db_name("target"));
        let continuous = body.get("continuous").and_then(Value::as_bool).unwrap_or(false);
        let create_target = body
            .get("create_target")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if !self.dbs.contains_key(&source) {
            return not_found("no_db_file");
        }
        if !self.dbs.contains_key(&target) {
            if !create_target {
                return not_found("no_db_file");
            }
            self.dbs.insert(target.clone(), Db::default());
        }

        let copies: Vec<(String, Map<String, Value>)> = self.dbs[&source]
            .docs
            .iter()
            .filter(|(_, doc)| doc.live())
            .filter_map(|(id, doc)| doc.current().body.clone().map(|body| (id.clone(), body)))
            .collect();
        if let Some(target_db) = self.dbs.get_mut(&target) {
            for (id, body) in copies {
                if target_db.live(&id).is_none() {
                    target_db.push_revision(&id, body, false);
                }
            }
        }

        self.uuid_counter += 1;
        if continuous {
            respond(
                202,
                json!({"ok": true, "_local_id": format!("{:x}+continuous", self.uuid_counter)}),
            )
        } else {
            respond(
                200,
                json!({"ok": true, "session_id": format!("{:x}", self.uuid_counter), "history": []}),
            )
        }
    }

    fn database(&mut self, name: &str, rest: &[&str], req: &HttpRequest) -> MockResponse {
        if rest.is_empty() {
            match req.method {
                Method::Put => {
                    if self.dbs.contains_key(name) {
                        return error(
                            412,
                            "file_exists",
                            "The database could not be created, the file already exists.",
                        );
                    }
                    self.dbs.insert(name.to_string(), Db::default());
                    return respond(201, json!({"ok": true}));
                }
                Method::Delete => {
                    return match self.dbs.remove(name) {
                        Some(_) => respond(200, json!({"ok": true})),
                        None => not_found("missing"),
                    };
                }
                _ => {}
            }
        }

        let maps = self.maps.clone();
        let reduces = self.reduces.clone();
        let uuids = &mut self.uuid_counter;
        let Some(db) = self.dbs.get_mut(name) else {
            return not_found("no_db_file");
        };

        match (req.method, rest) {
            (Method::Get | Method::Head, []) => respond(200, db.info(name)),
            (Method::Post, []) => {
                let mut body = match parse_object(req) {
                    Ok(body) => body,
                    Err(response) => return response,
                };
                let id = match body.remove("_id") {
                    Some(Value::String(id)) => id,
                    _ => {
                        *uuids += 1;
                        format!("{:032x}", *uuids)
                    }
                };
                match db.write(&id, body, None, false) {
                    Ok(rev) => respond(201, json!({"ok": true, "id": id, "rev": rev})),
                    Err(response) => response,
                }
            }
            (Method::Get | Method::Post, ["_all_docs"]) => db.all_docs(req),
            (Method::Post, ["_bulk_docs"]) => db.bulk_docs(req, uuids),
            (Method::Get, ["_changes"]) => db.changes(req),
            (Method::Post, ["_compact"]) => {
                db.compact();
                respond(202, json!({"ok": true}))
            }
            (Method::Post, ["_compact", _]) => respond(202, json!({"ok": true})),
            (Method::Post, ["_ensure_full_commit"]) => {
                respond(201, json!({"ok": true, "instance_start_time": "0"}))
            }
            (Method::Post, ["_view_cleanup"]) => respond(202, json!({"ok": true})),
            (Method::Post, ["_purge"]) => db.purge(req),
            (Method::Post, ["_temp_view"]) => {
                let body = match parse_object(req) {
                    Ok(body) => body,
                    Err(response) => return response,
                };
                let source = body.get("map").and_then(Value::as_str).unwrap_or_default();
                let Some(map) = maps.get(source) else {
                    return error(400, "compilation_error", "unregistered map function");
                };
                let reduce = body
                    .get("reduce")
                    .and_then(Value::as_str)
                    .and_then(|source| builtin_reduce(source).or_else(|| reduces.get(source).cloned()));
                let keys = body.get("keys").and_then(Value::as_array).cloned();
                db.run_view(map, reduce, req, keys)
            }
            (Method::Get | Method::Post, ["_design", design, "_view", view]) => {
                let id = format!("_design/{}", design);
                let Some(definition) = db
                    .live(&id)
                    .and_then(|doc| doc.current().body.as_ref())
                    .and_then(|body| body.get("views"))
                    .and_then(|views| views.get(*view))
                    .cloned()
                else {
                    return not_found("missing_named_view");
                };
                let source = definition["map"].as_str().unwrap_or_default();
                let Some(map) = maps.get(source) else {
                    return error(400, "compilation_error", "unregistered map function");
                };
                let reduce = definition["reduce"]
                    .as_str()
                    .and_then(|source| builtin_reduce(source).or_else(|| reduces.get(source).cloned()));
                let keys = request_keys(req, &query(req));
                db.run_view(map, reduce, req, keys)
            }
            (Method::Get, ["_design", design, "_info"]) => respond(
                200,
                json!({"name": design, "view_index": {"compact_running": false, "updater_running": false}}),
            ),
            (_, [prefix @ ("_design" | "_local"), name, attachment @ ..]) => {
                let id = format!("{}/{}", prefix, name);
                match attachment {
                    [] => db.document(&id, req),
                    parts => db.attachment(&id, &parts.join("/"), req),
                }
            }
            (_, [id]) => db.document(id, req),
            (_, [id, attachment @ ..]) => db.attachment(id, &attachment.join("/"), req),
            _ => error(400, "bad_request", "unsupported request"),
        }
    }
}
