use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use settee_core::{Config, Error, Params, RequestBody, Resource, Result, ServerInfo, Session};

use crate::database::Database;

static DB_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z][a-z0-9_$()+/-]*$").expect("database name pattern is valid")
});

const SYSTEM_DATABASES: &[&str] = &["_users", "_replicator", "_global_changes"];

/// Reject names the server would refuse, before any request is made
pub(crate) fn validate_db_name(name: &str) -> Result<()> {
    if DB_NAME.is_match(name) || SYSTEM_DATABASES.contains(&name) {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "invalid database name: {:?}",
            name
        )))
    }
}

/// Options for `_replicate`
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplicationOptions {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub continuous: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub create_target: bool,
    /// Cancel a running continuous replication with the same source and target
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cancel: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ReplicationOptions {
    pub fn continuous() -> Self {
        Self {
            continuous: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationResult {
    #[serde(default)]
    pub ok: bool,
    /// Identifier of a continuous replication; only newer servers report it
    #[serde(rename = "_local_id", default)]
    pub local_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Serialize)]
struct ReplicateRequest<'a> {
    source: &'a str,
    target: &'a str,
    #[serde(flatten)]
    options: &'a ReplicationOptions,
}

#[derive(Deserialize)]
struct Uuids {
    uuids: Vec<String>,
}

/// Handle on a server: a keyed collection of databases plus administrative
/// endpoints.
#[derive(Clone)]
pub struct Server {
    resource: Resource,
}

impl Server {
    pub fn new(url: &str) -> Result<Self> {
        Self::from_config(Config::default().with_url(url))
    }

    pub fn from_config(config: Config) -> Result<Self> {
        Ok(Self::from_resource(Resource::from_config(config)?))
    }

    /// Server at `COUCHDB_URI`, or the local default
    pub fn from_env() -> Result<Self> {
        Self::from_config(Config::from_env())
    }

    pub fn with_session(url: &str, session: Arc<Session>) -> Result<Self> {
        Ok(Self::from_resource(Resource::new(url, session)?))
    }

    pub fn from_resource(resource: Resource) -> Self {
        Self { resource }
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// Whether the server answers at all
    pub async fn exists(&self) -> bool {
        match self.resource.head(&[], &Params::new()).await {
            Ok(_) => true,
            Err(err) => {
                tracing::debug!("Server at {} unavailable: {}", self.resource.url(), err);
                false
            }
        }
    }

    pub async fn info(&self) -> Result<ServerInfo> {
        Ok(self.resource.get_json(&[], &Params::new()).await?.data)
    }

    pub async fn version(&self) -> Result<String> {
        Ok(self.info().await?.version)
    }

    /// Server configuration. Falls back to the node-local endpoint on servers
    /// without a global `_config`.
    pub async fn config(&self) -> Result<Value> {
        match self.resource.get_json(&["_config"], &Params::new()).await {
            Ok(response) => Ok(response.data),
            Err(err) if err.is_not_found() => Ok(self
                .resource
                .get_json(&["_node", "_local", "_config"], &Params::new())
                .await?
                .data),
            Err(err) => Err(err),
        }
    }

    pub async fn stats(&self, name: Option<&str>) -> Result<Value> {
        let mut segments = vec!["_stats"];
        if let Some(name) = name {
            segments.extend(name.split('/').filter(|s| !s.is_empty()));
        }
        Ok(self.resource.get_json(&segments, &Params::new()).await?.data)
    }

    pub async fn tasks(&self) -> Result<Vec<Value>> {
        Ok(self
            .resource
            .get_json(&["_active_tasks"], &Params::new())
            .await?
            .data)
    }

    /// `count` server-generated document ids
    pub async fn uuids(&self, count: usize) -> Result<Vec<String>> {
        let mut params = Params::new();
        params.push("count", count.to_string());
        let response = self.resource.get_json::<Uuids>(&["_uuids"], &params).await?;
        Ok(response.data.uuids)
    }

    pub async fn contains(&self, name: &str) -> Result<bool> {
        match self.resource.head(&[name], &Params::new()).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Names of all databases, in one roundtrip
    pub async fn names(&self) -> Result<Vec<String>> {
        Ok(self
            .resource
            .get_json(&["_all_dbs"], &Params::new())
            .await?
            .data)
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.names().await?.len())
    }

    /// Handle on an existing database; `NotFound` when it does not exist
    pub async fn get_database(&self, name: &str) -> Result<Database> {
        validate_db_name(name)?;
        let db = self.database(name);
        self.resource.head(&[name], &Params::new()).await?;
        Ok(db)
    }

    /// Handle without an existence check
    pub fn database(&self, name: &str) -> Database {
        Database::from_resource(self.resource.child(&[name]), name)
    }

    /// Create a database; `PreconditionFailed` when it already exists
    pub async fn create(&self, name: &str) -> Result<Database> {
        validate_db_name(name)?;
        self.resource
            .put_json::<Value>(&[name], RequestBody::Empty, &Params::new())
            .await?;
        tracing::info!("Created database {}", name);
        Ok(self.database(name))
    }

    /// Delete a database; `NotFound` when it does not exist
    pub async fn delete(&self, name: &str) -> Result<()> {
        validate_db_name(name)?;
        self.resource
            .delete_json::<Value>(&[name], &Params::new())
            .await?;
        tracing::info!("Deleted database {}", name);
        Ok(())
    }

    /// Ask the server to replicate `source` into `target`, both database
    /// names or URLs
    pub async fn replicate(
        &self,
        source: &str,
        target: &str,
        options: &ReplicationOptions,
    ) -> Result<ReplicationResult> {
        let body = RequestBody::json(&ReplicateRequest {
            source,
            target,
            options,
        })?;
        let response = self
            .resource
            .post_json(&["_replicate"], body, &Params::new())
            .await?;
        Ok(response.data)
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Server '{}'>", self.resource.url())
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("resource", &self.resource)
            .finish()
    }
}
