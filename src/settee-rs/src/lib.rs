//! Settee Client Library
//!
//! Native handles for a CouchDB-compatible document server: servers,
//! databases, documents, attachments, views and change feeds, built on the
//! pooled and cached transport of `settee-core`.

mod attachment;
mod changes;
mod database;
mod document;
mod server;
pub mod telemetry;
mod view;

pub use attachment::{Attachment, AttachmentContent};
pub use changes::{ChangeFeed, ChangesOptions, Feed};
pub use database::{Database, GetOptions, UpdateResult};
pub use document::{DocRef, DocumentLike, DocumentRef, Pairs};
pub use server::{ReplicationOptions, ReplicationResult, Server};
pub use view::{View, ViewOptions, ViewResults};

pub use settee_core::{
    Change, ChangeEvent, ChangesResponse, Config, Credentials, DatabaseInfo, Document, Error,
    ErrorBody, Params, Resource, Result, Row, Seq, ServerInfo, Session,
};
