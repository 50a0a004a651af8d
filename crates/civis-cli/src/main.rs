//! civis-intake: browse platform tables as lazily loaded sources
//!
//! Attaches the DuckDB databases listed in the config as a local platform,
//! builds a catalog over the configured schema, and lists, describes, or reads
//! its tables.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use arrow::util::pretty::pretty_format_batches;
use civis_duck::{DuckConnector, DuckPlatform};
use civis_intake::catalog::CivisCatalog;
use civis_intake::client::{ApiKey, Connector, RemoteClient};
use civis_intake::source::{CivisSource, DataSource, SourceArgs};
use civis_intake::table::Table;
use clap::{Parser, Subcommand};
use tracing::info;

mod config;
mod logging;

use config::{Config, PlatformConfig};

#[derive(Parser)]
#[command(name = "civis-intake", version, about)]
struct Cli {
    /// Path to config.yaml
    #[arg(short, long, env = "CIVIS_CONFIG")]
    config: Option<PathBuf>,

    /// Schema to list instead of the configured one
    #[arg(long)]
    schema: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the tables in the catalog schema
    List {
        /// Print full entries as YAML
        #[arg(long)]
        yaml: bool,
    },
    /// Show column types and shape of a table
    Describe { table: String },
    /// Print a table
    Read {
        table: String,
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Run a SQL query against the catalog database
    Sql {
        query: String,
        #[arg(long)]
        limit: Option<u64>,
    },
    /// List the databases the platform exposes
    Databases,
}

fn build_platform(config: &PlatformConfig) -> anyhow::Result<DuckPlatform> {
    let platform = DuckPlatform::new();
    for db in &config.databases {
        match &db.path {
            Some(path) => platform
                .attach_file(&db.name, db.kind, path)
                .with_context(|| format!("attaching {} from {}", db.name, path.display()))?,
            None => platform.attach_in_memory(&db.name, db.kind)?,
        }
        if let Some(sql) = &db.setup_sql {
            platform
                .execute_batch(&db.name, sql)
                .with_context(|| format!("running setup_sql for {}", db.name))?;
        }
    }
    Ok(platform)
}

fn print_table(table: &Table) -> anyhow::Result<()> {
    println!("{}", pretty_format_batches(table.batches())?);
    println!("({} rows)", table.num_rows());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    // CIVIS_API_KEY and overrides may live in .env
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::from_env()?,
    };
    if let Some(schema) = cli.schema {
        config.catalog.schema = schema;
    }
    config.validate()?;

    config.apply_logging_env();
    logging::init();

    let platform = Arc::new(build_platform(&config.platform)?);
    let connector: Arc<dyn Connector> = Arc::new(DuckConnector::new(platform.clone()));

    info!(
        database = %config.catalog.database,
        schema = %config.catalog.schema,
        has_api_key = ApiKey::from_env().is_some(),
        "Opening civis catalog"
    );
    let mut catalog = CivisCatalog::new(config.catalog.to_args(), connector.clone())?;

    match cli.command {
        Command::List { yaml } => {
            let entries = catalog.entries()?;
            if yaml {
                print!("{}", serde_yaml::to_string(entries)?);
            } else {
                for (name, entry) in entries.iter() {
                    println!("{:<32} {}", name, entry.description);
                }
            }
            log_event!(
                level: tracing::Level::DEBUG,
                event: "catalog_listed",
                tables: entries.len()
            );
        }
        Command::Describe { table } => {
            let mut source = catalog.source(&table)?;
            let schema = source.schema()?;
            println!("{}", source.args().table.as_deref().unwrap_or(&table));
            println!("rows: {}  columns: {}  partitions: {}", schema.shape.0, schema.shape.1, schema.npartitions);
            for (name, data_type) in schema.dtypes() {
                println!("  {:<24} {}", name, data_type);
            }
        }
        Command::Read { table, limit } => {
            let mut entry = catalog.entry(&table)?.clone();
            if let Some(limit) = limit {
                entry.args.civis_kwargs.insert("limit".to_string(), limit.into());
            }
            let mut source = entry.instantiate(connector.as_ref())?;
            print_table(&*source.read_all()?)?;
            log_event!(
                level: tracing::Level::DEBUG,
                event: "source_read",
                table: table
            );
        }
        Command::Sql { query, limit } => {
            let mut args = SourceArgs {
                civis_kwargs: config.catalog.civis_kwargs.clone(),
                ..SourceArgs::sql(catalog.database(), query)
            };
            if let Some(limit) = limit {
                args.civis_kwargs.insert("limit".to_string(), limit.into());
            }
            let mut source = CivisSource::new(args, connector.as_ref())?;
            print_table(&*source.read()?)?;
        }
        Command::Databases => {
            for db in platform.databases()? {
                println!("{:<24} {}", db.name, db.kind);
            }
        }
    }

    Ok(())
}
