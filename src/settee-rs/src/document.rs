//! Capabilities a value needs to take part in document operations.
//!
//! Writes need mutable field access so the new `_id`/`_rev` can be mirrored
//! back into the caller's copy ([`DocumentLike`]). Copy, delete and attachment
//! lookups only need an id and optionally a revision ([`DocumentRef`]).
//! Structures that expose neither can be wrapped in [`Pairs`].

use serde_json::{Map, Value};

use settee_core::models::type_name;
use settee_core::{Document, Error, Result};

pub trait DocumentLike {
    /// `None` when the value is not a JSON object
    fn as_object(&self) -> Option<&Map<String, Value>>;
    fn as_object_mut(&mut self) -> Option<&mut Map<String, Value>>;
}

impl DocumentLike for Document {
    fn as_object(&self) -> Option<&Map<String, Value>> {
        Some(&**self)
    }

    fn as_object_mut(&mut self) -> Option<&mut Map<String, Value>> {
        Some(&mut **self)
    }
}

impl DocumentLike for Map<String, Value> {
    fn as_object(&self) -> Option<&Map<String, Value>> {
        Some(self)
    }

    fn as_object_mut(&mut self) -> Option<&mut Map<String, Value>> {
        Some(self)
    }
}

impl DocumentLike for Value {
    fn as_object(&self) -> Option<&Map<String, Value>> {
        Value::as_object(self)
    }

    fn as_object_mut(&mut self) -> Option<&mut Map<String, Value>> {
        Value::as_object_mut(self)
    }
}

pub(crate) fn object_of<D: DocumentLike + ?Sized>(doc: &D) -> Result<&Map<String, Value>> {
    doc.as_object()
        .ok_or_else(|| Error::UnsupportedType("document must be a JSON object".to_string()))
}

pub(crate) fn object_of_mut<D: DocumentLike + ?Sized>(
    doc: &mut D,
) -> Result<&mut Map<String, Value>> {
    doc.as_object_mut()
        .ok_or_else(|| Error::UnsupportedType("document must be a JSON object".to_string()))
}

pub(crate) fn field<'a>(map: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    map.get(name).and_then(Value::as_str)
}

/// Mirror a successful write back into the caller's document
pub(crate) fn apply_write(map: &mut Map<String, Value>, id: &str, rev: &str) {
    map.insert("_id".to_string(), Value::String(id.to_string()));
    map.insert("_rev".to_string(), Value::String(rev.to_string()));
}

/// Resolved reference to a document, optionally pinned to a revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocRef {
    pub id: String,
    pub rev: Option<String>,
}

impl DocRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: None,
        }
    }

    pub fn with_rev(mut self, rev: impl Into<String>) -> Self {
        self.rev = Some(rev.into());
        self
    }

    fn from_map(map: &Map<String, Value>) -> Result<Self> {
        let id = field(map, "_id").ok_or_else(|| {
            Error::UnsupportedType("document reference has no string `_id`".to_string())
        })?;
        Ok(Self {
            id: id.to_string(),
            rev: field(map, "_rev").map(str::to_string),
        })
    }
}

pub trait DocumentRef {
    fn doc_ref(&self) -> Result<DocRef>;
}

impl DocumentRef for DocRef {
    fn doc_ref(&self) -> Result<DocRef> {
        Ok(self.clone())
    }
}

impl DocumentRef for str {
    fn doc_ref(&self) -> Result<DocRef> {
        Ok(DocRef::new(self))
    }
}

impl DocumentRef for String {
    fn doc_ref(&self) -> Result<DocRef> {
        Ok(DocRef::new(self.as_str()))
    }
}

impl DocumentRef for Document {
    fn doc_ref(&self) -> Result<DocRef> {
        DocRef::from_map(self)
    }
}

impl DocumentRef for Map<String, Value> {
    fn doc_ref(&self) -> Result<DocRef> {
        DocRef::from_map(self)
    }
}

/// Strings are bare ids; objects must carry `_id`
impl DocumentRef for Value {
    fn doc_ref(&self) -> Result<DocRef> {
        match self {
            Value::String(id) => Ok(DocRef::new(id.as_str())),
            Value::Object(map) => DocRef::from_map(map),
            other => Err(Error::UnsupportedType(format!(
                "cannot reference a document with a JSON {}",
                type_name(other)
            ))),
        }
    }
}

impl<T: DocumentRef + ?Sized> DocumentRef for &T {
    fn doc_ref(&self) -> Result<DocRef> {
        (**self).doc_ref()
    }
}

/// Adapter for structures that only expose key/value pairs.
///
/// ```
/// use serde_json::json;
/// use settee_rs::{DocumentRef, Pairs};
///
/// let fields = vec![("_id", json!("foo")), ("status", json!("testing"))];
/// let doc = Pairs::new(fields);
/// assert_eq!(doc.doc_ref().unwrap().id, "foo");
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pairs(Map<String, Value>);

impl Pairs {
    pub fn new<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn into_document(self) -> Document {
        Document::from(self.0)
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Pairs {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl DocumentLike for Pairs {
    fn as_object(&self) -> Option<&Map<String, Value>> {
        Some(&self.0)
    }

    fn as_object_mut(&mut self) -> Option<&mut Map<String, Value>> {
        Some(&mut self.0)
    }
}

impl DocumentRef for Pairs {
    fn doc_ref(&self) -> Result<DocRef> {
        DocRef::from_map(&self.0)
    }
}
