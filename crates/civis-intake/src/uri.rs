//! Connection strings for platform databases
//!
//! The platform does not hand out direct SQL endpoints to sources, but it does
//! know each database's host and login. These helpers turn that into a
//! `<scheme>://user:password@host:port/dbname?sslmode=require` URI for tools that
//! want to connect on their own.

use std::fmt;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::{RemoteClient, RemoteError};

pub const DEFAULT_PORT: u16 = 5432;
pub const DEFAULT_DB_NAME: &str = "dev";

/// Everything outside the RFC 3986 unreserved set
const USERINFO: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, Error)]
pub enum UriError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("No {0} database available on the platform")]
    NoDatabase(DatabaseKind),

    #[error("Database {0} has no host")]
    MissingHost(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Postgres,
    Redshift,
}

impl DatabaseKind {
    pub fn scheme(&self) -> &'static str {
        match self {
            DatabaseKind::Postgres => "postgresql",
            DatabaseKind::Redshift => "redshift",
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseKind::Postgres => f.write_str("postgres"),
            DatabaseKind::Redshift => f.write_str("redshift"),
        }
    }
}

/// A database as the platform lists it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    /// Platform-level name, the one sources and catalogs take
    pub name: String,
    pub kind: DatabaseKind,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Physical database name on the server
    #[serde(default)]
    pub db_name: Option<String>,
}

impl DatabaseInfo {
    pub fn new(name: impl Into<String>, kind: DatabaseKind) -> Self {
        Self {
            name: name.into(),
            kind,
            host: None,
            port: None,
            db_name: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = Some(host.into());
        self.port = Some(port);
        self
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct DbCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for DbCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbCredentials")
            .field("username", &self.username)
            .field("password", &"****")
            .finish()
    }
}

/// Build a connection URI for one database
pub fn connection_uri(info: &DatabaseInfo, credentials: &DbCredentials) -> Result<String, UriError> {
    let host = info
        .host
        .as_deref()
        .ok_or_else(|| UriError::MissingHost(info.name.clone()))?;

    Ok(format!(
        "{}://{}:{}@{}:{}/{}?sslmode=require",
        info.kind.scheme(),
        utf8_percent_encode(&credentials.username, USERINFO),
        utf8_percent_encode(&credentials.password, USERINFO),
        host,
        info.port.unwrap_or(DEFAULT_PORT),
        info.db_name.as_deref().unwrap_or(DEFAULT_DB_NAME),
    ))
}

/// First platform database of `kind`
pub fn find_database(client: &dyn RemoteClient, kind: DatabaseKind) -> Result<DatabaseInfo, UriError> {
    client
        .databases()?
        .into_iter()
        .find(|db| db.kind == kind)
        .ok_or(UriError::NoDatabase(kind))
}

/// Connection URI for the first platform database of `kind`
pub fn platform_db_uri(client: &dyn RemoteClient, kind: DatabaseKind) -> Result<String, UriError> {
    let info = find_database(client, kind)?;
    let credentials = client.credentials(&info.name)?;
    connection_uri(&info, &credentials)
}
