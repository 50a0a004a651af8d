//! DuckDB-backed platform
//!
//! Stands in for the remote platform during local development and tests: each
//! platform database is a DuckDB connection registered under a name and kind.
//! Table and SQL reads come back as Arrow batches; metadata queries come back
//! as JSON rows.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use arrow::record_batch::RecordBatch;
use civis_intake::client::{ApiKey, Connector, QueryFuture, QueryResult, ReadOptions, RemoteClient, RemoteError};
use civis_intake::table::Table;
use civis_intake::uri::{DatabaseInfo, DatabaseKind};
use duckdb::types::ValueRef;
use duckdb::{Connection, Result as DuckResult};
use thiserror::Error;
use tracing::debug;

/// Options the DuckDB platform knows how to apply
const KNOWN_OPTIONS: [&str; 2] = ["limit", "columns"];

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("Database already attached: {0}")]
    AlreadyAttached(String),

    #[error("Database not found: {0}")]
    NotFound(String),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
}

impl From<PlatformError> for RemoteError {
    fn from(e: PlatformError) -> Self {
        match e {
            PlatformError::NotFound(name) => RemoteError::DatabaseNotFound(name),
            other => RemoteError::Query(other.to_string()),
        }
    }
}

struct DuckDatabase {
    kind: DatabaseKind,
    conn: Mutex<Connection>,
}

impl DuckDatabase {
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Named DuckDB databases behind the [`RemoteClient`] interface
#[derive(Default)]
pub struct DuckPlatform {
    databases: RwLock<HashMap<String, Arc<DuckDatabase>>>,
}

impl DuckPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach_in_memory(&self, name: &str, kind: DatabaseKind) -> Result<(), PlatformError> {
        self.attach_connection(name, kind, Connection::open_in_memory()?)
    }

    pub fn attach_file<P: AsRef<Path>>(
        &self,
        name: &str,
        kind: DatabaseKind,
        path: P,
    ) -> Result<(), PlatformError> {
        self.attach_connection(name, kind, Connection::open(path)?)
    }

    pub fn attach_connection(
        &self,
        name: &str,
        kind: DatabaseKind,
        conn: Connection,
    ) -> Result<(), PlatformError> {
        let mut databases = self.databases.write().unwrap_or_else(|e| e.into_inner());
        if databases.contains_key(name) {
            return Err(PlatformError::AlreadyAttached(name.to_string()));
        }
        databases.insert(
            name.to_string(),
            Arc::new(DuckDatabase {
                kind,
                conn: Mutex::new(conn),
            }),
        );
        debug!(database = name, kind = %kind, "Attached DuckDB database");
        Ok(())
    }

    /// Run setup statements (DDL, inserts) against a database
    pub fn execute_batch(&self, database: &str, sql: &str) -> Result<(), PlatformError> {
        let db = self.database(database)?;
        let conn = db.conn();
        conn.execute_batch(sql)?;
        Ok(())
    }

    fn database(&self, name: &str) -> Result<Arc<DuckDatabase>, PlatformError> {
        self.databases
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(name.to_string()))
    }

    fn fetch_table(&self, database: &str, sql: &str) -> Result<Table, PlatformError> {
        let db = self.database(database)?;
        let conn = db.conn();
        debug!(database, sql, "Executing DuckDB read");

        let mut stmt = conn.prepare(sql)?;
        let arrow = stmt.query_arrow([])?;
        let schema = arrow.get_schema();
        let batches: Vec<RecordBatch> = arrow.collect();
        let table = Table::try_new(schema, batches)?;
        Ok(table)
    }

    fn fetch_rows(&self, database: &str, sql: &str) -> Result<QueryResult, PlatformError> {
        let db = self.database(database)?;
        let conn = db.conn();
        debug!(database, sql, "Executing DuckDB query");

        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query([])?;
        let columns = rows
            .as_ref()
            .map(|stmt| stmt.column_names())
            .unwrap_or_default();

        let mut result_rows = Vec::new();
        while let Some(row) = rows.next()? {
            let values = (0..columns.len())
                .map(|i| row.get_ref(i).map(value_to_json))
                .collect::<DuckResult<Vec<_>>>()?;
            result_rows.push(values);
        }

        Ok(QueryResult::new(columns, result_rows))
    }
}

impl RemoteClient for DuckPlatform {
    fn read_table(
        &self,
        table: &str,
        database: &str,
        options: &ReadOptions,
    ) -> Result<Table, RemoteError> {
        log_ignored_options(options);
        Ok(self.fetch_table(database, &table_sql(table, options))?)
    }

    fn read_sql(&self, sql: &str, database: &str, options: &ReadOptions) -> Result<Table, RemoteError> {
        log_ignored_options(options);
        Ok(self.fetch_table(database, &limited_sql(sql, options))?)
    }

    fn submit_query(&self, sql: &str, database: &str) -> Result<Box<dyn QueryFuture>, RemoteError> {
        // DuckDB runs synchronously, so the job is already finished when handed back
        Ok(Box::new(self.fetch_rows(database, sql)?))
    }

    fn databases(&self) -> Result<Vec<DatabaseInfo>, RemoteError> {
        let databases = self.databases.read().unwrap_or_else(|e| e.into_inner());
        let mut infos: Vec<DatabaseInfo> = databases
            .iter()
            .map(|(name, db)| DatabaseInfo::new(name.clone(), db.kind))
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }
}

/// Hands out a shared [`DuckPlatform`], optionally checking the API key
pub struct DuckConnector {
    platform: Arc<DuckPlatform>,
    required_key: Option<ApiKey>,
}

impl DuckConnector {
    pub fn new(platform: Arc<DuckPlatform>) -> Self {
        Self {
            platform,
            required_key: None,
        }
    }

    /// Only accept clients whose resolved key matches `key`
    pub fn with_required_key(mut self, key: ApiKey) -> Self {
        self.required_key = Some(key);
        self
    }

    pub fn platform(&self) -> &Arc<DuckPlatform> {
        &self.platform
    }
}

impl Connector for DuckConnector {
    fn connect(&self, api_key: Option<&ApiKey>) -> Result<Arc<dyn RemoteClient>, RemoteError> {
        if let Some(required) = &self.required_key {
            let key = ApiKey::resolve(api_key)?;
            if &key != required {
                return Err(RemoteError::Unauthorized("invalid API key".to_string()));
            }
        }
        Ok(self.platform.clone())
    }
}

fn log_ignored_options(options: &ReadOptions) {
    for key in options.extra().keys() {
        if !KNOWN_OPTIONS.contains(&key.as_str()) {
            debug!(option = %key, "DuckDB platform ignores read option");
        }
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn table_sql(table: &str, options: &ReadOptions) -> String {
    let projection = match options.columns() {
        Some(columns) if !columns.is_empty() => columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", "),
        _ => "*".to_string(),
    };
    let mut sql = format!("SELECT {} FROM {}", projection, table);
    if let Some(limit) = options.limit() {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    sql
}

fn limited_sql(sql: &str, options: &ReadOptions) -> String {
    match options.limit() {
        Some(limit) => format!(
            "SELECT * FROM (\n{}\n) AS civis_query LIMIT {}",
            sql.trim().trim_end_matches(';'),
            limit
        ),
        None => sql.to_string(),
    }
}

fn value_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Boolean(b) => serde_json::Value::Bool(b),
        ValueRef::TinyInt(i) => serde_json::Value::from(i),
        ValueRef::SmallInt(i) => serde_json::Value::from(i),
        ValueRef::Int(i) => serde_json::Value::from(i),
        ValueRef::BigInt(i) => serde_json::Value::from(i),
        ValueRef::HugeInt(i) => match i64::try_from(i) {
            Ok(small) => serde_json::Value::from(small),
            Err(_) => serde_json::Value::String(i.to_string()),
        },
        ValueRef::UTinyInt(i) => serde_json::Value::from(i),
        ValueRef::USmallInt(i) => serde_json::Value::from(i),
        ValueRef::UInt(i) => serde_json::Value::from(i),
        ValueRef::UBigInt(i) => serde_json::Value::from(i),
        ValueRef::Float(f) => serde_json::Value::from(f),
        ValueRef::Double(f) => serde_json::Value::from(f),
        ValueRef::Text(bytes) => serde_json::Value::String(String::from_utf8_lossy(bytes).to_string()),
        ValueRef::Blob(b) => serde_json::Value::String(format!("<blob {} bytes>", b.len())),
        _ => serde_json::Value::String("<unsupported>".to_string()),
    }
}
