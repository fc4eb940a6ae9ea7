use serde::Deserialize;
use std::fmt;

/// Error body returned by the server, e.g. `{"error": "conflict", "reason": "..."}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub reason: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            reason: reason.into(),
        }
    }

    /// Decode a raw response body. Bodies that are not the usual error object
    /// are kept verbatim as the reason.
    pub fn from_bytes(status: u16, bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return Self::new(status_text(status), String::new());
        }
        match serde_json::from_slice::<ErrorBody>(bytes) {
            Ok(body) if !body.error.is_empty() || !body.reason.is_empty() => body,
            _ => {
                tracing::warn!("Undecodable error body for HTTP {}", status);
                Self::new(
                    status_text(status),
                    String::from_utf8_lossy(bytes).into_owned(),
                )
            }
        }
    }
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.error)
        } else {
            write!(f, "{}: {}", self.error, self.reason)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("resource not found ({0})")]
    NotFound(ErrorBody),

    #[error("document update conflict ({0})")]
    Conflict(ErrorBody),

    #[error("precondition failed ({0})")]
    PreconditionFailed(ErrorBody),

    #[error("server error: {status} - {body}")]
    Server { status: u16, body: ErrorBody },

    #[error("request error: {status} - {body}")]
    Request { status: u16, body: ErrorBody },

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported input type: {0}")]
    UnsupportedType(String),

    /// The request was never written to the server
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response from server: {0}")]
    InvalidResponse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Map a non-success HTTP status and its body to the matching error.
    pub fn from_status(status: u16, bytes: &[u8]) -> Self {
        let body = ErrorBody::from_bytes(status, bytes);
        match status {
            404 => Error::NotFound(body),
            409 => Error::Conflict(body),
            412 => Error::PreconditionFailed(body),
            500..=599 => Error::Server { status, body },
            _ => Error::Request { status, body },
        }
    }

    /// Map a per-document error from a bulk response.
    pub fn from_bulk(error: &str, reason: &str) -> Self {
        let body = ErrorBody::new(error, reason);
        match error {
            "conflict" => Error::Conflict(body),
            "not_found" => Error::NotFound(body),
            "forbidden" => Error::Request { status: 403, body },
            "unauthorized" => Error::Request { status: 401, body },
            _ => Error::Request { status: 400, body },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Whether the request failed before reaching the server, so replaying
    /// it cannot apply a write twice.
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, Error::Connect(_))
    }

    /// HTTP status carried by the error, if it came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::NotFound(_) => Some(404),
            Error::Conflict(_) => Some(409),
            Error::PreconditionFailed(_) => Some(412),
            Error::Server { status, .. } | Error::Request { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Decoding failures. Encoding goes through `json::encode`, which maps to
/// `Error::Encoding` itself.
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidResponse(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Error::Connect(err.to_string())
        } else {
            Error::Transport(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

fn status_text(status: u16) -> &'static str {
    match status {
        400 => "bad_request",
        401 => "unauthorized",
        403 => "forbidden",
        404 => "not_found",
        405 => "method_not_allowed",
        409 => "conflict",
        412 => "precondition_failed",
        415 => "bad_content_type",
        500 => "internal_server_error",
        503 => "service_unavailable",
        _ => "http_error",
    }
}
