//! Settee Core Library
//!
//! Transport layer for talking to a CouchDB-compatible document server:
//! - Pluggable HTTP transport (`reqwest` by default)
//! - Connection pool keyed by (scheme, host:port)
//! - Response cache for conditional GETs
//! - Sessions and URL-addressable resources with JSON encoding and error mapping
//! - Streamed response bodies that recycle their connection at end of body
//! - Shared value models (documents, rows, change events)

pub mod body;
pub mod cache;
pub mod config;
pub mod error;
pub mod json;
pub mod models;
pub mod pool;
pub mod resource;
pub mod session;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

// Re-export commonly used types
pub use body::Body;
pub use cache::{CacheEntry, CacheStats, ResponseCache};
pub use config::Config;
pub use error::{Error, ErrorBody, Result};
pub use models::*;
pub use pool::{ConnectionPool, PoolKey, PooledConnection};
pub use resource::{
    decode_segment, encode_segment, Credentials, JsonResponse, Params, RequestBody, Resource,
};
pub use reqwest::Url;
pub use session::{ReadMode, Response, Session};
pub use transport::{Connection, Headers, HttpRequest, HttpResponse, Method, Transport};
