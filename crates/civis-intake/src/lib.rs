//! Civis data sources and catalogs
//!
//! Exposes remote tables and ad-hoc SQL queries as lazily-loaded, schema-described
//! in-memory tables, plus a catalog that discovers every table in a remote schema
//! and hands out one source per table.
//!
//! The remote platform itself sits behind the [`client::RemoteClient`] and
//! [`client::Connector`] traits; this crate never executes SQL on its own.

pub mod catalog;
pub mod client;
pub mod source;
pub mod table;
pub mod uri;

pub use catalog::{
    open_catalog_for_kind, open_postgres_catalog, open_redshift_catalog, CatalogArgs,
    CatalogEntries, CatalogEntry, CatalogError, CivisCatalog,
};
pub use client::{ApiKey, Connector, QueryResult, ReadOptions, RemoteClient, RemoteError};
pub use source::{CivisSource, DataSource, SourceArgs, SourceError};
pub use table::{Schema, Table};
pub use uri::{connection_uri, platform_db_uri, DatabaseInfo, DatabaseKind, DbCredentials, UriError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::catalog::{CatalogArgs, CivisCatalog};
    pub use crate::client::{ApiKey, Connector, RemoteClient};
    pub use crate::source::{CivisSource, DataSource, SourceArgs};
    pub use crate::table::{Schema, Table};
}
