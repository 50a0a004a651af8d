//! One remote table or SQL query, loaded on first use
//!
//! A [`CivisSource`] starts Unloaded. The first schema or read request performs
//! exactly one blocking remote read and caches the result; later requests reuse
//! it until [`DataSource::close`] drops the cache.

use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::{ApiKey, Connector, ReadOptions, RemoteClient, RemoteError};
use crate::table::{Schema, Table};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Invalid source configuration: {0}")]
    Config(String),

    #[error("Internal invariant violated: {0}")]
    Invariant(&'static str),

    #[error("Not supported: {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Capabilities every data source exposes to catalog browsers
pub trait DataSource {
    /// Load if needed and describe the result
    fn load(&mut self) -> Result<Schema, SourceError>;

    /// Load if needed and return one partition
    fn read_partition(&mut self, index: usize) -> Result<Arc<Table>, SourceError>;

    /// Load if needed and return everything
    fn read_all(&mut self) -> Result<Arc<Table>, SourceError> {
        self.read_partition(0)
    }

    /// Drop any cached data; the next access loads again
    fn close(&mut self);

    fn metadata(&self) -> &Map<String, Value>;
}

/// Constructor arguments for a [`CivisSource`].
///
/// Exactly one of `table` / `sql_expr` must be given; empty strings count as
/// not given.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceArgs {
    pub database: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_expr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,

    /// Falls back to `CIVIS_API_KEY` when absent
    #[serde(default, skip_serializing)]
    pub api_key: Option<ApiKey>,

    /// Extra options passed to every remote read
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub civis_kwargs: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl SourceArgs {
    pub fn table(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: Some(table.into()),
            ..Self::default()
        }
    }

    pub fn sql(database: impl Into<String>, sql_expr: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            sql_expr: Some(sql_expr.into()),
            ..Self::default()
        }
    }

    pub fn with_api_key(mut self, api_key: ApiKey) -> Self {
        self.api_key = Some(api_key);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.civis_kwargs.insert(key.into(), value);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn validate(&self) -> Result<(), SourceError> {
        if self.database.is_empty() {
            return Err(SourceError::Config("database must not be empty".to_string()));
        }
        match (present(&self.table), present(&self.sql_expr)) {
            (Some(_), None) | (None, Some(_)) => {}
            _ => {
                return Err(SourceError::Config(
                    "Must provide a table OR a sql_expr".to_string(),
                ))
            }
        }
        check_read_options(&self.civis_kwargs)
    }

    fn target(&self) -> Result<Target<'_>, SourceError> {
        if let Some(table) = present(&self.table) {
            Ok(Target::Table(table))
        } else if let Some(sql) = present(&self.sql_expr) {
            Ok(Target::Sql(sql))
        } else {
            Err(SourceError::Invariant("source has neither a table nor a sql_expr"))
        }
    }
}

/// `limit` and `columns` are read by every platform; a malformed value would
/// otherwise be ignored silently
fn check_read_options(kwargs: &Map<String, Value>) -> Result<(), SourceError> {
    if let Some(limit) = kwargs.get("limit") {
        if limit.as_u64().is_none() {
            return Err(SourceError::Config(format!(
                "limit must be a non-negative integer, got {}",
                limit
            )));
        }
    }
    if let Some(columns) = kwargs.get("columns") {
        let valid = columns
            .as_array()
            .is_some_and(|cols| cols.iter().all(Value::is_string));
        if !valid {
            return Err(SourceError::Config(format!(
                "columns must be a list of column names, got {}",
                columns
            )));
        }
    }
    Ok(())
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Copy)]
enum Target<'a> {
    Table(&'a str),
    Sql(&'a str),
}

impl fmt::Display for Target<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Table(table) => write!(f, "table {}", table),
            Target::Sql(sql) => write!(f, "sql {}", sql),
        }
    }
}

#[derive(Debug, Clone)]
enum LoadState {
    Unloaded,
    Loaded(Arc<Table>),
}

/// One-shot reader for a platform table or query
pub struct CivisSource {
    args: SourceArgs,
    client: Arc<dyn RemoteClient>,
    options: ReadOptions,
    state: LoadState,
}

impl CivisSource {
    pub const NAME: &'static str = "civis";
    pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");
    pub const CONTAINER: &'static str = "dataframe";
    pub const PARTITION_ACCESS: bool = false;

    /// Validate `args` and bind a client from `connector`
    pub fn new(args: SourceArgs, connector: &dyn Connector) -> Result<Self, SourceError> {
        args.validate()?;
        let client = connector.connect(args.api_key.as_ref())?;
        Ok(Self::bind(args, client))
    }

    /// Validate `args` and use an already constructed client
    pub fn with_client(args: SourceArgs, client: Arc<dyn RemoteClient>) -> Result<Self, SourceError> {
        args.validate()?;
        Ok(Self::bind(args, client))
    }

    fn bind(args: SourceArgs, client: Arc<dyn RemoteClient>) -> Self {
        let options = ReadOptions::new(args.civis_kwargs.clone());
        debug!(
            database = %args.database,
            table = ?args.table,
            has_sql = args.sql_expr.is_some(),
            "Created civis source"
        );
        Self {
            args,
            client,
            options,
            state: LoadState::Unloaded,
        }
    }

    pub fn args(&self) -> &SourceArgs {
        &self.args
    }

    pub fn database(&self) -> &str {
        &self.args.database
    }

    pub fn options(&self) -> &ReadOptions {
        &self.options
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state, LoadState::Loaded(_))
    }

    /// Schema of the loaded result, loading first if needed
    pub fn schema(&mut self) -> Result<Schema, SourceError> {
        DataSource::load(self)
    }

    /// Main entry point: the whole result
    pub fn read(&mut self) -> Result<Arc<Table>, SourceError> {
        self.read_partition(0)
    }

    /// Lazy SQL expression over the table
    pub fn to_lazy_expr(&self) -> Result<Infallible, SourceError> {
        Err(SourceError::Unsupported(
            "lazy expressions need a direct database endpoint, which the platform does not expose",
        ))
    }

    /// Distributed dataframe backed by the database
    pub fn to_distributed(&self) -> Result<Infallible, SourceError> {
        Err(SourceError::Unsupported(
            "distributed dataframes need a direct database endpoint, which the platform does not expose",
        ))
    }

    fn ensure_loaded(&mut self) -> Result<Arc<Table>, SourceError> {
        if let LoadState::Loaded(table) = &self.state {
            return Ok(table.clone());
        }
        let table = Arc::new(self.fetch()?);
        self.state = LoadState::Loaded(table.clone());
        Ok(table)
    }

    fn fetch(&self) -> Result<Table, SourceError> {
        let target = self.args.target()?;
        let database = self.args.database.as_str();
        let start = Instant::now();
        info!(database, target = %target, "Loading civis source");

        let result = match target {
            Target::Table(table) => self.client.read_table(table, database, &self.options),
            Target::Sql(sql) => self.client.read_sql(sql, database, &self.options),
        };

        match result {
            Ok(table) => {
                info!(
                    database,
                    rows = table.num_rows(),
                    columns = table.num_columns(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Loaded civis source"
                );
                Ok(table)
            }
            Err(e) => {
                warn!(database, target = %target, error = %e, "Civis source load failed");
                Err(e.into())
            }
        }
    }
}

impl DataSource for CivisSource {
    fn load(&mut self) -> Result<Schema, SourceError> {
        let table = self.ensure_loaded()?;
        Ok(Schema::from_table(&table))
    }

    /// Sources are never partitioned; every index gets the full result
    fn read_partition(&mut self, _index: usize) -> Result<Arc<Table>, SourceError> {
        self.ensure_loaded()
    }

    fn close(&mut self) {
        if self.is_loaded() {
            debug!(database = %self.args.database, "Dropping cached civis result");
        }
        self.state = LoadState::Unloaded;
    }

    fn metadata(&self) -> &Map<String, Value> {
        &self.args.metadata
    }
}

impl fmt::Debug for CivisSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CivisSource")
            .field("args", &self.args)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockClient, MockConnector, CLIENT_KEY};
    use crate::table::tests::people;
    use serde_json::json;

    const TABLE: &str = "\"public\".\"people\"";
    const SQL: &str = "SELECT id, name FROM people";

    fn setup() -> (Arc<MockClient>, MockConnector) {
        let client = Arc::new(MockClient::new());
        client.add_table(TABLE, people(&[(1, "Alice"), (2, "Bob")]));
        client.add_query(SQL, people(&[(3, "Carol")]));
        let connector = MockConnector::new(client.clone());
        (client, connector)
    }

    #[test]
    fn test_table_xor_sql() {
        let (_, connector) = setup();

        let both = SourceArgs {
            sql_expr: Some(SQL.to_string()),
            ..SourceArgs::table("db", TABLE)
        };
        assert!(matches!(CivisSource::new(both, &connector), Err(SourceError::Config(_))));

        let neither = SourceArgs {
            database: "db".to_string(),
            ..SourceArgs::default()
        };
        assert!(matches!(CivisSource::new(neither, &connector), Err(SourceError::Config(_))));

        assert!(CivisSource::new(SourceArgs::table("db", TABLE), &connector).is_ok());
        assert!(CivisSource::new(SourceArgs::sql("db", SQL), &connector).is_ok());
    }

    #[test]
    fn test_empty_strings_count_as_absent() {
        let (_, connector) = setup();

        let blank_sql = SourceArgs {
            sql_expr: Some(String::new()),
            ..SourceArgs::table("db", TABLE)
        };
        assert!(CivisSource::new(blank_sql, &connector).is_ok());

        let both_blank = SourceArgs {
            sql_expr: Some(String::new()),
            ..SourceArgs::table("db", "")
        };
        assert!(matches!(CivisSource::new(both_blank, &connector), Err(SourceError::Config(_))));
    }

    #[test]
    fn test_malformed_read_options_rejected() {
        let (_, connector) = setup();
        for bad in [json!("5"), json!(-1), json!(2.5)] {
            let args = SourceArgs::table("db", TABLE).with_option("limit", bad);
            assert!(matches!(
                CivisSource::new(args, &connector),
                Err(SourceError::Config(msg)) if msg.starts_with("limit")
            ));
        }
        let args = SourceArgs::table("db", TABLE).with_option("columns", json!("name"));
        assert!(matches!(CivisSource::new(args, &connector), Err(SourceError::Config(_))));
        assert!(connector.keys_seen().is_empty());

        let args = SourceArgs::table("db", TABLE)
            .with_option("limit", json!(0))
            .with_option("columns", json!(["name"]));
        assert!(CivisSource::new(args, &connector).is_ok());
    }

    #[test]
    fn test_empty_database_rejected_before_connecting() {
        let (_, connector) = setup();
        let args = SourceArgs::table("", TABLE);
        assert!(matches!(CivisSource::new(args, &connector), Err(SourceError::Config(_))));
        assert!(connector.keys_seen().is_empty());
    }

    #[test]
    fn test_schema_then_read_loads_once() {
        let (client, connector) = setup();
        let mut source = CivisSource::new(SourceArgs::table("db", TABLE), &connector).unwrap();
        assert!(!source.is_loaded());

        let schema = source.schema().unwrap();
        let table = source.read().unwrap();

        assert_eq!(client.load_calls(), 1);
        assert_eq!(schema.shape, (2, 2));
        assert_eq!(schema.npartitions, 1);
        assert_eq!(schema.dtype, table.schema());
    }

    #[test]
    fn test_read_then_schema_loads_once() {
        let (client, connector) = setup();
        let mut source = CivisSource::new(SourceArgs::table("db", TABLE), &connector).unwrap();

        let first = source.read().unwrap();
        let schema = source.schema().unwrap();
        let second = source.read_all().unwrap();

        assert_eq!(client.read_table_calls(), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(schema.shape, first.shape());
    }

    #[test]
    fn test_close_invalidates_cache() {
        let (client, connector) = setup();
        let mut source = CivisSource::new(SourceArgs::table("db", TABLE), &connector).unwrap();

        source.read().unwrap();
        source.close();
        assert!(!source.is_loaded());
        assert_eq!(client.load_calls(), 1);

        source.schema().unwrap();
        source.read().unwrap();
        assert_eq!(client.load_calls(), 2);
    }

    #[test]
    fn test_every_partition_is_the_full_result() {
        let (_, connector) = setup();
        let mut source = CivisSource::new(SourceArgs::table("db", TABLE), &connector).unwrap();

        let zero = source.read_partition(0).unwrap();
        let seven = source.read_partition(7).unwrap();
        assert!(Arc::ptr_eq(&zero, &seven));
        assert_eq!(seven.num_rows(), 2);
    }

    #[test]
    fn test_sql_source_reads_sql() {
        let (client, connector) = setup();
        let mut source = CivisSource::new(SourceArgs::sql("db", SQL), &connector).unwrap();

        let table = source.read().unwrap();
        assert_eq!(table.num_rows(), 1);
        assert_eq!(client.read_sql_calls(), 1);
        assert_eq!(client.read_table_calls(), 0);
    }

    #[test]
    fn test_remote_failure_propagates_and_stays_unloaded() {
        let (client, connector) = setup();
        let mut source = CivisSource::new(SourceArgs::table("db", TABLE), &connector).unwrap();

        client.fail_with(Some(RemoteError::Query("permission denied".to_string())));
        let err = source.read().unwrap_err();
        assert!(matches!(err, SourceError::Remote(RemoteError::Query(ref msg)) if msg == "permission denied"));
        assert!(!source.is_loaded());

        client.fail_with(None);
        assert_eq!(source.read().unwrap().num_rows(), 2);
        assert_eq!(client.load_calls(), 2);
    }

    #[test]
    fn test_reserved_options_forced_on_reads() {
        let (client, connector) = setup();
        let args = SourceArgs::table("db", TABLE)
            .with_option(CLIENT_KEY, json!("not-this-one"))
            .with_option("limit", json!(5));
        let mut source = CivisSource::new(args, &connector).unwrap();
        source.read().unwrap();

        let options = client.last_options().unwrap();
        assert!(options.in_memory());
        assert!(options.extra().get(CLIENT_KEY).is_none());
        assert_eq!(options.limit(), Some(5));
        // The caller's own map is untouched
        assert!(source.args().civis_kwargs.contains_key(CLIENT_KEY));
    }

    #[test]
    fn test_api_key_goes_to_connector() {
        let (_, connector) = setup();
        let args = SourceArgs::table("db", TABLE).with_api_key(ApiKey::new("k1"));
        CivisSource::new(args, &connector).unwrap();
        CivisSource::new(SourceArgs::table("db", TABLE), &connector).unwrap();

        assert_eq!(connector.keys_seen(), vec![Some(ApiKey::new("k1")), None]);
    }

    #[test]
    fn test_unsupported_accessors() {
        let (_, connector) = setup();
        let source = CivisSource::new(SourceArgs::table("db", TABLE), &connector).unwrap();
        assert!(matches!(source.to_lazy_expr(), Err(SourceError::Unsupported(_))));
        assert!(matches!(source.to_distributed(), Err(SourceError::Unsupported(_))));
    }

    #[test]
    fn test_target_without_table_or_sql_is_invariant_error() {
        let args = SourceArgs {
            database: "db".to_string(),
            ..SourceArgs::default()
        };
        assert!(matches!(args.target(), Err(SourceError::Invariant(_))));
    }

    #[test]
    fn test_metadata_exposed() {
        let (_, connector) = setup();
        let args = SourceArgs::table("db", TABLE).with_metadata("owner", json!("analytics"));
        let source = CivisSource::new(args, &connector).unwrap();
        assert_eq!(source.metadata().get("owner"), Some(&json!("analytics")));
    }

    #[test]
    fn test_args_serde() {
        let args: SourceArgs = serde_json::from_value(json!({
            "database": "db",
            "table": "\"public\".\"people\"",
            "civis_kwargs": { "limit": 3 }
        }))
        .unwrap();
        assert_eq!(args.table.as_deref(), Some(TABLE));
        assert!(args.validate().is_ok());

        let back = serde_json::to_value(args.with_api_key(ApiKey::new("secret-key"))).unwrap();
        assert!(back.get("sql_expr").is_none());
        assert!(back.get("api_key").is_none());
        assert!(!back.to_string().contains("secret-key"));
    }
}
