use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt};

use settee_core::{json, Body, Error, Result};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Source of an attachment upload
pub enum AttachmentContent {
    Bytes(Bytes),
    Text(String),
    /// Pre-encoded JSON text, uploaded as `application/json` unless overridden
    Json(String),
    Reader(Box<dyn AsyncRead + Send + Unpin>),
    /// Read from disk; the file name doubles as the default attachment name
    File(PathBuf),
}

impl AttachmentContent {
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let bytes = json::encode(value)?;
        String::from_utf8(bytes.to_vec())
            .map(AttachmentContent::Json)
            .map_err(|e| Error::Encoding(e.to_string()))
    }

    pub fn reader<R: AsyncRead + Send + Unpin + 'static>(reader: R) -> Self {
        AttachmentContent::Reader(Box::new(reader))
    }

    pub fn file(path: impl AsRef<Path>) -> Self {
        AttachmentContent::File(path.as_ref().to_path_buf())
    }

    /// Name the content carries on its own, if any
    pub fn default_filename(&self) -> Option<String> {
        match self {
            AttachmentContent::File(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            _ => None,
        }
    }

    fn default_content_type(&self) -> Option<&'static str> {
        match self {
            AttachmentContent::Json(_) => Some("application/json"),
            _ => None,
        }
    }

    pub(crate) async fn into_bytes(self) -> Result<Bytes> {
        match self {
            AttachmentContent::Bytes(bytes) => Ok(bytes),
            AttachmentContent::Text(text) | AttachmentContent::Json(text) => Ok(Bytes::from(text)),
            AttachmentContent::Reader(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
            AttachmentContent::File(path) => Ok(Bytes::from(tokio::fs::read(&path).await?)),
        }
    }
}

/// Attachment name and MIME type for an upload. Fails before any I/O when no
/// name is given and the content carries none.
pub(crate) fn resolve_upload(
    content: &AttachmentContent,
    filename: Option<&str>,
    content_type: Option<&str>,
) -> Result<(String, String)> {
    let filename = match filename.filter(|name| !name.is_empty()) {
        Some(name) => name.to_string(),
        None => content.default_filename().ok_or_else(|| {
            Error::InvalidArgument("no filename specified for attachment".to_string())
        })?,
    };

    let content_type = match content_type {
        Some(content_type) => content_type.to_string(),
        None => content
            .default_content_type()
            .map(str::to_string)
            .or_else(|| {
                mime_guess::from_path(&filename)
                    .first_raw()
                    .map(str::to_string)
            })
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
    };

    Ok((filename, content_type))
}

impl fmt::Debug for AttachmentContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachmentContent::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            AttachmentContent::Text(text) => write!(f, "Text({} chars)", text.len()),
            AttachmentContent::Json(text) => write!(f, "Json({} chars)", text.len()),
            AttachmentContent::Reader(_) => f.write_str("Reader"),
            AttachmentContent::File(path) => write!(f, "File({})", path.display()),
        }
    }
}

impl From<Bytes> for AttachmentContent {
    fn from(bytes: Bytes) -> Self {
        AttachmentContent::Bytes(bytes)
    }
}

impl From<Vec<u8>> for AttachmentContent {
    fn from(bytes: Vec<u8>) -> Self {
        AttachmentContent::Bytes(Bytes::from(bytes))
    }
}

impl From<&[u8]> for AttachmentContent {
    fn from(bytes: &[u8]) -> Self {
        AttachmentContent::Bytes(Bytes::copy_from_slice(bytes))
    }
}

impl From<String> for AttachmentContent {
    fn from(text: String) -> Self {
        AttachmentContent::Text(text)
    }
}

impl From<&str> for AttachmentContent {
    fn from(text: &str) -> Self {
        AttachmentContent::Text(text.to_string())
    }
}

impl From<PathBuf> for AttachmentContent {
    fn from(path: PathBuf) -> Self {
        AttachmentContent::File(path)
    }
}

/// Downloaded attachment. The body is streamed; the connection goes back to
/// the pool once it has been read to the end.
#[derive(Debug)]
pub struct Attachment {
    content_type: Option<String>,
    length: Option<u64>,
    body: Body,
}

impl Attachment {
    pub(crate) fn new(content_type: Option<String>, length: Option<u64>, body: Body) -> Self {
        Self {
            content_type,
            length,
            body,
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Length announced by the server
    pub fn length(&self) -> Option<u64> {
        self.length
    }

    /// Next chunk, `None` at the end
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        self.body.chunk().await
    }

    pub async fn bytes(self) -> Result<Bytes> {
        self.body.bytes().await
    }

    pub async fn text(self) -> Result<String> {
        self.body.text().await
    }

    pub fn into_body(self) -> Body {
        self.body
    }

    pub fn close(self) {
        self.body.close();
    }
}
