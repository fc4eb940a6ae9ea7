use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::ops::{Deref, DerefMut};

use crate::error::{Error, Result};
use crate::json;

/// Document is a JSON object with the reserved `_id` and `_rev` fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        let mut doc = Self::new();
        doc.set_id(id);
        doc
    }

    /// Fails with `UnsupportedType` unless `value` is a JSON object
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::UnsupportedType(format!(
                "expected a JSON object, got {}",
                type_name(&other)
            ))),
        }
    }

    /// Build a document from any serializable value, e.g. a domain struct
    pub fn from_serializable<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Self::from_value(json::to_value(value)?)
    }

    /// Deserialize the document into a domain type
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.0.clone()))
            .map_err(|e| Error::InvalidArgument(e.to_string()))
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get("_id").and_then(Value::as_str)
    }

    pub fn rev(&self) -> Option<&str> {
        self.0.get("_rev").and_then(Value::as_str)
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.0.insert("_id".to_string(), Value::String(id.into()));
    }

    pub fn set_rev(&mut self, rev: impl Into<String>) {
        self.0.insert("_rev".to_string(), Value::String(rev.into()));
    }

    pub fn attachments(&self) -> Option<&Map<String, Value>> {
        self.0.get("_attachments").and_then(Value::as_object)
    }

    pub fn conflicts(&self) -> Vec<&str> {
        self.0
            .get("_conflicts")
            .and_then(Value::as_array)
            .map(|revs| revs.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl Deref for Document {
    type Target = Map<String, Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Document {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        Value::Object(doc.0)
    }
}

impl TryFrom<Value> for Document {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(value)
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields: Map<String, Value> = self
            .0
            .iter()
            .filter(|(k, _)| k.as_str() != "_id" && k.as_str() != "_rev")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        write!(
            f,
            "<Document '{}'@'{}' {}>",
            self.id().unwrap_or(""),
            self.rev().unwrap_or(""),
            Value::Object(fields)
        )
    }
}

/// JSON type name used in `UnsupportedType` messages
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Update sequence. Integers on older servers, opaque strings on newer ones;
/// never parsed, only compared and echoed back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seq(pub Value);

impl Seq {
    pub fn as_u64(&self) -> Option<u64> {
        self.0.as_u64()
    }

    /// Form used for the `since` query parameter
    pub fn to_param(&self) -> String {
        match &self.0 {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl PartialEq<u64> for Seq {
    fn eq(&self, other: &u64) -> bool {
        self.0.as_u64() == Some(*other)
    }
}

impl From<u64> for Seq {
    fn from(seq: u64) -> Self {
        Seq(Value::from(seq))
    }
}

impl From<&str> for Seq {
    fn from(seq: &str) -> Self {
        Seq(Value::String(seq.to_string()))
    }
}

impl From<String> for Seq {
    fn from(seq: String) -> Self {
        Seq(Value::String(seq))
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_param())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRev {
    pub rev: String,
}

/// One entry of a change feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub seq: Seq,
    pub id: String,
    #[serde(default)]
    pub changes: Vec<ChangeRev>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Document>,
}

impl Change {
    pub fn revs(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().map(|c| c.rev.as_str())
    }
}

/// Item yielded by a change feed
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Change(Change),
    /// Terminal marker carrying the feed's `last_seq`
    LastSeq(Seq),
}

impl ChangeEvent {
    /// Parse one feed line or one element of a `results` array
    pub fn from_value(value: Value) -> Result<Self> {
        if let Some(last) = value.get("last_seq") {
            return Ok(ChangeEvent::LastSeq(Seq(last.clone())));
        }
        serde_json::from_value(value)
            .map(ChangeEvent::Change)
            .map_err(|e| Error::InvalidResponse(format!("malformed change: {}", e)))
    }

    pub fn seq(&self) -> &Seq {
        match self {
            ChangeEvent::Change(change) => &change.seq,
            ChangeEvent::LastSeq(seq) => seq,
        }
    }

    pub fn is_last(&self) -> bool {
        matches!(self, ChangeEvent::LastSeq(_))
    }

    pub fn as_change(&self) -> Option<&Change> {
        match self {
            ChangeEvent::Change(change) => Some(change),
            ChangeEvent::LastSeq(_) => None,
        }
    }
}

/// Body of a non-continuous `_changes` response
#[derive(Debug, Clone, Deserialize)]
pub struct ChangesResponse {
    #[serde(default)]
    pub results: Vec<Change>,
    #[serde(default)]
    pub last_seq: Seq,
    #[serde(default)]
    pub pending: Option<u64>,
}

/// Row of a view result. Rows produced by a reduce step carry no `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub key: Value,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(error) = &self.error {
            return write!(f, "<Row key={}, error='{}'>", self.key, error);
        }
        match &self.id {
            Some(id) => write!(f, "<Row id='{}', key={}, value={}>", id, self.key, self.value),
            None => write!(f, "<Row key={}, value={}>", self.key, self.value),
        }
    }
}

/// Database metadata from `GET /{db}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub db_name: String,
    #[serde(default)]
    pub doc_count: u64,
    #[serde(default)]
    pub doc_del_count: u64,
    #[serde(default)]
    pub update_seq: Seq,
    #[serde(default)]
    pub compact_running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Server welcome message from `GET /`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub couchdb: String,
    pub version: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
