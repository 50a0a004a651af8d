//! Catalog of every table in one platform schema
//!
//! Discovery runs a single metadata query against `information_schema.tables`
//! and rebuilds the full entry map from it. Access through [`CivisCatalog::entries`],
//! [`CivisCatalog::entry`] or [`CivisCatalog::source`] triggers discovery when the
//! catalog was never loaded or its TTL has passed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::{ApiKey, Connector, RemoteClient, RemoteError};
use crate::source::{CivisSource, SourceArgs, SourceError};
use crate::uri::{self, DatabaseKind, UriError};

pub const DEFAULT_SCHEMA: &str = "public";

/// Applied when no TTL, or a zero TTL, is configured
pub const DEFAULT_TTL: Duration = Duration::from_secs(100);

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Uri(#[from] UriError),

    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Metadata row {row} has no table name")]
    MalformedRow { row: usize },

    #[error("Invalid catalog configuration: {0}")]
    Config(String),
}

fn default_schema() -> String {
    DEFAULT_SCHEMA.to_string()
}

/// Constructor arguments for a [`CivisCatalog`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogArgs {
    pub database: String,

    /// Remote schema to list; serialized as `schema`
    #[serde(rename = "schema", default = "default_schema")]
    pub db_schema: String,

    /// Handed to every source; never serialized
    #[serde(default, skip_serializing)]
    pub api_key: Option<ApiKey>,

    /// Options shared by every source the catalog hands out
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub civis_kwargs: Map<String, Value>,

    /// Refresh interval in seconds
    #[serde(default)]
    pub ttl: Option<u64>,
}

impl CatalogArgs {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            db_schema: default_schema(),
            api_key: None,
            civis_kwargs: Map::new(),
            ttl: None,
        }
    }

    pub fn with_schema(mut self, db_schema: impl Into<String>) -> Self {
        self.db_schema = db_schema.into();
        self
    }

    pub fn with_api_key(mut self, api_key: ApiKey) -> Self {
        self.api_key = Some(api_key);
        self
    }

    pub fn with_options(mut self, civis_kwargs: Map<String, Value>) -> Self {
        self.civis_kwargs = civis_kwargs;
        self
    }

    pub fn with_ttl(mut self, seconds: u64) -> Self {
        self.ttl = Some(seconds);
        self
    }
}

/// Zero and missing TTLs fall back to [`DEFAULT_TTL`]
pub fn normalize_ttl(ttl: Option<u64>) -> Duration {
    match ttl {
        None | Some(0) => DEFAULT_TTL,
        Some(seconds) => Duration::from_secs(seconds),
    }
}

/// `"schema"."table"`
pub fn qualified_name(db_schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(db_schema), quote_ident(table))
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn tables_query(db_schema: &str) -> String {
    format!(
        "SELECT table_name FROM information_schema.tables WHERE table_schema = '{}'",
        db_schema.replace('\'', "''")
    )
}

/// Serializable recipe for one catalog source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Qualified table name
    pub name: String,
    pub description: String,
    pub driver: String,
    /// Usable without further setup
    pub direct_access: bool,
    pub args: SourceArgs,
    pub getenv: bool,
    pub getshell: bool,
}

impl CatalogEntry {
    fn for_table(args: &CatalogArgs, table: &str) -> Self {
        let name = qualified_name(&args.db_schema, table);
        Self {
            description: format!("Civis table {} from {}", table, args.database),
            driver: CivisSource::NAME.to_string(),
            direct_access: true,
            args: SourceArgs {
                database: args.database.clone(),
                table: Some(name.clone()),
                api_key: args.api_key.clone(),
                civis_kwargs: args.civis_kwargs.clone(),
                ..SourceArgs::default()
            },
            getenv: false,
            getshell: false,
            name,
        }
    }

    /// Build the source this entry describes
    pub fn instantiate(&self, connector: &dyn Connector) -> Result<CivisSource, SourceError> {
        if self.driver != CivisSource::NAME {
            return Err(SourceError::Config(format!(
                "entry {} uses unknown driver {}",
                self.name, self.driver
            )));
        }
        CivisSource::new(self.args.clone(), connector)
    }
}

/// Catalog entries keyed by bare table name, in the order discovery returned them
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogEntries {
    entries: Vec<(String, CatalogEntry)>,
    index: HashMap<String, usize>,
}

impl CatalogEntries {
    /// A repeated name keeps its first position and its last entry
    fn insert(&mut self, table: String, entry: CatalogEntry) {
        match self.index.get(&table) {
            Some(&i) => self.entries[i].1 = entry,
            None => {
                self.index.insert(table.clone(), self.entries.len());
                self.entries.push((table, entry));
            }
        }
    }

    pub fn get(&self, table: &str) -> Option<&CatalogEntry> {
        self.index.get(table).map(|&i| &self.entries[i].1)
    }

    pub fn contains_key(&self, table: &str) -> bool {
        self.index.contains_key(table)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(table, _)| table.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CatalogEntry)> {
        self.entries.iter().map(|(table, entry)| (table.as_str(), entry))
    }
}

impl FromIterator<(String, CatalogEntry)> for CatalogEntries {
    fn from_iter<I: IntoIterator<Item = (String, CatalogEntry)>>(iter: I) -> Self {
        let mut entries = CatalogEntries::default();
        for (table, entry) in iter {
            entries.insert(table, entry);
        }
        entries
    }
}

impl std::ops::Index<&str> for CatalogEntries {
    type Output = CatalogEntry;

    fn index(&self, table: &str) -> &CatalogEntry {
        match self.get(table) {
            Some(entry) => entry,
            None => panic!("no catalog entry for {}", table),
        }
    }
}

impl Serialize for CatalogEntries {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (table, entry) in self.iter() {
            map.serialize_entry(table, entry)?;
        }
        map.end()
    }
}

/// Tables of one platform schema, exposed as named sources
pub struct CivisCatalog {
    args: CatalogArgs,
    ttl: Duration,
    connector: Arc<dyn Connector>,
    client: Arc<dyn RemoteClient>,
    entries: CatalogEntries,
    loaded_at: Option<Instant>,
    last_refreshed: Option<DateTime<Utc>>,
}

impl CivisCatalog {
    pub const NAME: &'static str = "civis_cat";
    pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");

    /// Bind a client; no metadata is fetched until first access
    pub fn new(args: CatalogArgs, connector: Arc<dyn Connector>) -> Result<Self, CatalogError> {
        if args.database.is_empty() {
            return Err(CatalogError::Config("database must not be empty".to_string()));
        }
        let ttl = normalize_ttl(args.ttl);
        let client = connector.connect(args.api_key.as_ref())?;
        debug!(
            database = %args.database,
            schema = %args.db_schema,
            ttl_secs = ttl.as_secs(),
            "Created civis catalog"
        );
        Ok(Self {
            args,
            ttl,
            connector,
            client,
            entries: CatalogEntries::default(),
            loaded_at: None,
            last_refreshed: None,
        })
    }

    pub fn database(&self) -> &str {
        &self.args.database
    }

    pub fn db_schema(&self) -> &str {
        &self.args.db_schema
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn args(&self) -> &CatalogArgs {
        &self.args
    }

    /// Wall-clock time of the last successful discovery
    pub fn last_refreshed(&self) -> Option<DateTime<Utc>> {
        self.last_refreshed
    }

    /// Never loaded, or loaded at least one TTL ago
    pub fn is_stale(&self) -> bool {
        match self.loaded_at {
            None => true,
            Some(loaded_at) => loaded_at.elapsed() >= self.ttl,
        }
    }

    /// Current entries without triggering discovery
    pub fn cached_entries(&self) -> &CatalogEntries {
        &self.entries
    }

    /// Table names in `db_schema`, in the order the platform returned them
    pub fn discover_tables(&self) -> Result<Vec<String>, CatalogError> {
        let sql = tables_query(&self.args.db_schema);
        let result = self
            .client
            .submit_query(&sql, &self.args.database)?
            .result()?;

        result
            .rows
            .iter()
            .enumerate()
            .map(|(row, values)| {
                values
                    .first()
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or(CatalogError::MalformedRow { row })
            })
            .collect()
    }

    /// Run discovery now and replace every entry, regardless of TTL.
    ///
    /// On failure the previous entries stay in place and the catalog stays stale.
    pub fn reload(&mut self) -> Result<(), CatalogError> {
        let start = Instant::now();
        let tables = match self.discover_tables() {
            Ok(tables) => tables,
            Err(e) => {
                warn!(
                    database = %self.args.database,
                    schema = %self.args.db_schema,
                    error = %e,
                    "Catalog discovery failed, keeping previous entries"
                );
                return Err(e);
            }
        };

        let entries: CatalogEntries = tables
            .into_iter()
            .map(|table| {
                let entry = CatalogEntry::for_table(&self.args, &table);
                (table, entry)
            })
            .collect();

        let added = entries.keys().filter(|k| !self.entries.contains_key(k)).count();
        let removed = self.entries.keys().filter(|k| !entries.contains_key(k)).count();

        self.entries = entries;
        self.loaded_at = Some(Instant::now());
        self.last_refreshed = Some(Utc::now());

        info!(
            database = %self.args.database,
            schema = %self.args.db_schema,
            tables = self.entries.len(),
            added,
            removed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Refreshed civis catalog"
        );
        Ok(())
    }

    /// Reload if stale; returns whether discovery ran
    pub fn refresh_if_stale(&mut self) -> Result<bool, CatalogError> {
        if !self.is_stale() {
            return Ok(false);
        }
        self.reload()?;
        Ok(true)
    }

    /// Entries in the order the remote listed the tables
    pub fn entries(&mut self) -> Result<&CatalogEntries, CatalogError> {
        self.refresh_if_stale()?;
        Ok(&self.entries)
    }

    /// Sorted bare table names
    pub fn names(&mut self) -> Result<Vec<String>, CatalogError> {
        let mut names: Vec<String> = self.entries()?.keys().map(str::to_string).collect();
        names.sort();
        Ok(names)
    }

    pub fn entry(&mut self, table: &str) -> Result<&CatalogEntry, CatalogError> {
        self.refresh_if_stale()?;
        self.entries
            .get(table)
            .ok_or_else(|| CatalogError::NotFound(table.to_string()))
    }

    /// Instantiate the source for a bare table name
    pub fn source(&mut self, table: &str) -> Result<CivisSource, CatalogError> {
        let entry = self.entry(table)?.clone();
        Ok(entry.instantiate(self.connector.as_ref())?)
    }
}

/// Catalog over the first database of `kind` the platform lists
pub fn open_catalog_for_kind(
    kind: DatabaseKind,
    connector: Arc<dyn Connector>,
    db_schema: &str,
    api_key: Option<ApiKey>,
) -> Result<CivisCatalog, CatalogError> {
    let client = connector.connect(api_key.as_ref())?;
    let info = uri::find_database(client.as_ref(), kind)?;

    let mut args = CatalogArgs::new(info.name).with_schema(db_schema);
    args.api_key = api_key;
    CivisCatalog::new(args, connector)
}

pub fn open_postgres_catalog(
    connector: Arc<dyn Connector>,
    db_schema: &str,
    api_key: Option<ApiKey>,
) -> Result<CivisCatalog, CatalogError> {
    open_catalog_for_kind(DatabaseKind::Postgres, connector, db_schema, api_key)
}

pub fn open_redshift_catalog(
    connector: Arc<dyn Connector>,
    db_schema: &str,
    api_key: Option<ApiKey>,
) -> Result<CivisCatalog, CatalogError> {
    open_catalog_for_kind(DatabaseKind::Redshift, connector, db_schema, api_key)
}
