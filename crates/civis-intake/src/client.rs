//! Remote platform interface
//!
//! Everything that talks to the platform goes through two traits:
//! - [`Connector`] turns an optional API key into a client handle
//! - [`RemoteClient`] performs blocking reads and metadata queries
//!
//! [`MockClient`] / [`MockConnector`] are in-memory stand-ins that count calls,
//! for tests of the source and catalog state machines.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::table::Table;
use crate::uri::{DatabaseInfo, DbCredentials};

/// Option key forcing results to come back as an in-memory [`Table`]
pub const IN_MEMORY_KEY: &str = "in_memory";

/// Option key for the client binding; reads always run on the source's own client
pub const CLIENT_KEY: &str = "client";

static IN_MEMORY: Value = Value::Bool(true);

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RemoteError {
    #[error("No API key given and {} is not set", ApiKey::ENV_VAR)]
    MissingCredentials,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Database not found: {0}")]
    DatabaseNotFound(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not supported by this platform: {0}")]
    Unsupported(String),
}

/// Platform API key
///
/// Deserializable from config, never serialized back out.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    pub const ENV_VAR: &'static str = "CIVIS_API_KEY";

    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Read the key from `CIVIS_API_KEY`, treating an empty value as unset
    pub fn from_env() -> Option<Self> {
        std::env::var(Self::ENV_VAR)
            .ok()
            .filter(|key| !key.is_empty())
            .map(Self)
    }

    /// Resolve the key a client should use.
    ///
    /// Fallback order:
    /// 1. the explicitly supplied key
    /// 2. `CIVIS_API_KEY` from the process environment
    pub fn resolve(explicit: Option<&ApiKey>) -> Result<ApiKey, RemoteError> {
        explicit
            .cloned()
            .or_else(Self::from_env)
            .ok_or(RemoteError::MissingCredentials)
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(****)")
    }
}

/// Options passed through to every remote read.
///
/// Built fresh per source from the caller's option map. The two reserved keys
/// are forced: results always come back in memory, and the client is the one
/// the source bound at construction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadOptions {
    extra: Map<String, Value>,
}

impl ReadOptions {
    pub fn new(mut kwargs: Map<String, Value>) -> Self {
        for key in [IN_MEMORY_KEY, CLIENT_KEY] {
            if let Some(value) = kwargs.remove(key) {
                warn!(option = key, value = %value, "Overriding reserved read option");
            }
        }
        Self { extra: kwargs }
    }

    /// Always true; kept so platforms can assert it
    pub fn in_memory(&self) -> bool {
        true
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match key {
            IN_MEMORY_KEY => Some(&IN_MEMORY),
            _ => self.extra.get(key),
        }
    }

    /// Caller-supplied options, reserved keys excluded
    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }

    /// Row cap, from the `limit` option; sources reject non-integer values up front
    pub fn limit(&self) -> Option<usize> {
        self.extra
            .get("limit")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
    }

    /// Column projection, from the `columns` option
    pub fn columns(&self) -> Option<Vec<String>> {
        let columns = self.extra.get("columns")?.as_array()?;
        columns
            .iter()
            .map(|c| c.as_str().map(str::to_string))
            .collect()
    }
}

/// Rows returned by a metadata query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        let row_count = rows.len();
        Self {
            columns,
            rows,
            row_count,
        }
    }
}

/// A submitted query job
pub trait QueryFuture: Send {
    /// Block until the job finishes and return its rows
    fn result(self: Box<Self>) -> Result<QueryResult, RemoteError>;
}

/// A job that already finished
impl QueryFuture for QueryResult {
    fn result(self: Box<Self>) -> Result<QueryResult, RemoteError> {
        Ok(*self)
    }
}

/// Blocking access to the remote platform
pub trait RemoteClient: Send + Sync {
    /// Read a whole table into memory
    fn read_table(
        &self,
        table: &str,
        database: &str,
        options: &ReadOptions,
    ) -> Result<Table, RemoteError>;

    /// Run a SQL expression and read its result into memory
    fn read_sql(&self, sql: &str, database: &str, options: &ReadOptions)
        -> Result<Table, RemoteError>;

    /// Submit a query job; rows are fetched through the returned future
    fn submit_query(&self, sql: &str, database: &str) -> Result<Box<dyn QueryFuture>, RemoteError>;

    /// Databases visible to this client
    fn databases(&self) -> Result<Vec<DatabaseInfo>, RemoteError> {
        Err(RemoteError::Unsupported("listing databases".to_string()))
    }

    /// Login credentials for a database
    fn credentials(&self, database: &str) -> Result<DbCredentials, RemoteError> {
        Err(RemoteError::Unsupported(format!("credentials for {}", database)))
    }
}

/// Builds client handles
pub trait Connector: Send + Sync {
    /// Connect with an explicit key, or let the connector fall back per [`ApiKey::resolve`]
    fn connect(&self, api_key: Option<&ApiKey>) -> Result<Arc<dyn RemoteClient>, RemoteError>;
}

#[derive(Default)]
struct MockState {
    tables: HashMap<String, Table>,
    queries: HashMap<String, Table>,
    metadata_rows: Vec<Vec<Value>>,
    failure: Option<RemoteError>,
    databases: Vec<DatabaseInfo>,
    credentials: HashMap<String, DbCredentials>,
    last_options: Option<ReadOptions>,
    last_query: Option<(String, String)>,
}

/// In-memory client for tests
#[derive(Default)]
pub struct MockClient {
    state: Mutex<MockState>,
    read_table_calls: AtomicUsize,
    read_sql_calls: AtomicUsize,
    query_calls: AtomicUsize,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_table(&self, name: impl Into<String>, table: Table) {
        self.state().tables.insert(name.into(), table);
    }

    pub fn add_query(&self, sql: impl Into<String>, table: Table) {
        self.state().queries.insert(sql.into(), table);
    }

    /// Rows returned by every metadata query
    pub fn set_metadata_rows(&self, rows: Vec<Vec<Value>>) {
        self.state().metadata_rows = rows;
    }

    /// One single-column row per table name
    pub fn set_table_names(&self, names: &[&str]) {
        let rows = names
            .iter()
            .map(|name| vec![Value::String(name.to_string())])
            .collect();
        self.set_metadata_rows(rows);
    }

    /// Make every call fail with `failure`, or clear it with `None`
    pub fn fail_with(&self, failure: Option<RemoteError>) {
        self.state().failure = failure;
    }

    pub fn add_database(&self, info: DatabaseInfo, credentials: Option<DbCredentials>) {
        let mut state = self.state();
        if let Some(credentials) = credentials {
            state.credentials.insert(info.name.clone(), credentials);
        }
        state.databases.push(info);
    }

    pub fn read_table_calls(&self) -> usize {
        self.read_table_calls.load(Ordering::SeqCst)
    }

    pub fn read_sql_calls(&self) -> usize {
        self.read_sql_calls.load(Ordering::SeqCst)
    }

    /// Table and SQL reads combined
    pub fn load_calls(&self) -> usize {
        self.read_table_calls() + self.read_sql_calls()
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn last_options(&self) -> Option<ReadOptions> {
        self.state().last_options.clone()
    }

    /// (sql, database) of the last metadata query
    pub fn last_query(&self) -> Option<(String, String)> {
        self.state().last_query.clone()
    }
}

impl RemoteClient for MockClient {
    fn read_table(
        &self,
        table: &str,
        _database: &str,
        options: &ReadOptions,
    ) -> Result<Table, RemoteError> {
        self.read_table_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        state.last_options = Some(options.clone());
        if let Some(failure) = &state.failure {
            return Err(failure.clone());
        }
        state
            .tables
            .get(table)
            .cloned()
            .ok_or_else(|| RemoteError::Query(format!("relation {} does not exist", table)))
    }

    fn read_sql(
        &self,
        sql: &str,
        _database: &str,
        options: &ReadOptions,
    ) -> Result<Table, RemoteError> {
        self.read_sql_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        state.last_options = Some(options.clone());
        if let Some(failure) = &state.failure {
            return Err(failure.clone());
        }
        state
            .queries
            .get(sql)
            .cloned()
            .ok_or_else(|| RemoteError::Query(format!("no result registered for: {}", sql)))
    }

    fn submit_query(&self, sql: &str, database: &str) -> Result<Box<dyn QueryFuture>, RemoteError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        state.last_query = Some((sql.to_string(), database.to_string()));
        if let Some(failure) = &state.failure {
            return Err(failure.clone());
        }
        let columns = vec!["table_name".to_string()];
        Ok(Box::new(QueryResult::new(columns, state.metadata_rows.clone())))
    }

    fn databases(&self) -> Result<Vec<DatabaseInfo>, RemoteError> {
        Ok(self.state().databases.clone())
    }

    fn credentials(&self, database: &str) -> Result<DbCredentials, RemoteError> {
        self.state()
            .credentials
            .get(database)
            .cloned()
            .ok_or_else(|| RemoteError::DatabaseNotFound(database.to_string()))
    }
}

/// Connector handing out one shared [`MockClient`]
pub struct MockConnector {
    client: Arc<MockClient>,
    require_key: bool,
    keys: Mutex<Vec<Option<ApiKey>>>,
}

impl MockConnector {
    pub fn new(client: Arc<MockClient>) -> Self {
        Self {
            client,
            require_key: false,
            keys: Mutex::new(Vec::new()),
        }
    }

    /// Reject connections whose key does not resolve
    pub fn requiring_key(mut self) -> Self {
        self.require_key = true;
        self
    }

    pub fn client(&self) -> &Arc<MockClient> {
        &self.client
    }

    /// Keys passed to each `connect` call, in order
    pub fn keys_seen(&self) -> Vec<Option<ApiKey>> {
        self.keys.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Connector for MockConnector {
    fn connect(&self, api_key: Option<&ApiKey>) -> Result<Arc<dyn RemoteClient>, RemoteError> {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(api_key.cloned());
        if self.require_key {
            ApiKey::resolve(api_key)?;
        }
        Ok(self.client.clone())
    }
}
