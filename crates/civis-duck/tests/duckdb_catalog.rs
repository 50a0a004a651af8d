//! Catalog discovery against in-memory DuckDB databases

use std::sync::Arc;

use civis_duck::{DuckConnector, DuckPlatform};
use civis_intake::catalog::{open_redshift_catalog, CatalogArgs, CivisCatalog, DEFAULT_SCHEMA};
use civis_intake::client::Connector;
use civis_intake::source::DataSource;
use civis_intake::uri::DatabaseKind;
use serde_json::json;

fn platform() -> Arc<DuckPlatform> {
    let platform = Arc::new(DuckPlatform::new());
    platform
        .attach_in_memory("analytics", DatabaseKind::Redshift)
        .unwrap();
    platform
        .execute_batch(
            "analytics",
            "CREATE SCHEMA IF NOT EXISTS public;
             CREATE SCHEMA staging;
             CREATE TABLE public.users (id INTEGER, name VARCHAR);
             INSERT INTO public.users VALUES (1, 'Alice'), (2, 'Bob');
             CREATE TABLE public.orders (id INTEGER, user_id INTEGER, total DOUBLE);
             INSERT INTO public.orders VALUES (10, 1, 9.5);
             CREATE TABLE staging.raw_events (payload VARCHAR);",
        )
        .unwrap();
    platform
}

fn catalog(platform: &Arc<DuckPlatform>, args: CatalogArgs) -> CivisCatalog {
    let connector: Arc<dyn Connector> = Arc::new(DuckConnector::new(platform.clone()));
    CivisCatalog::new(args, connector).unwrap()
}

#[test]
fn test_discovers_schema_tables() {
    let platform = platform();
    let mut catalog = catalog(&platform, CatalogArgs::new("analytics"));

    assert_eq!(catalog.names().unwrap(), vec!["orders", "users"]);
    let users = catalog.entry("users").unwrap();
    assert_eq!(users.args.table.as_deref(), Some("\"public\".\"users\""));
    assert_eq!(users.description, "Civis table users from analytics");
}

#[test]
fn test_other_schema() {
    let platform = platform();
    let mut catalog = catalog(&platform, CatalogArgs::new("analytics").with_schema("staging"));

    assert_eq!(catalog.names().unwrap(), vec!["raw_events"]);
    let mut source = catalog.source("raw_events").unwrap();
    assert_eq!(source.read_all().unwrap().shape(), (0, 1));
}

#[test]
fn test_entry_source_reads_table() {
    let platform = platform();
    let mut catalog = catalog(&platform, CatalogArgs::new("analytics"));

    let mut source = catalog.source("orders").unwrap();
    let schema = source.load().unwrap();
    assert_eq!(schema.shape, (1, 3));
}

#[test]
fn test_shared_options_reach_sources() {
    let platform = platform();
    let options = json!({ "limit": 1 }).as_object().cloned().unwrap();
    let mut catalog = catalog(&platform, CatalogArgs::new("analytics").with_options(options));

    let mut source = catalog.source("users").unwrap();
    assert_eq!(source.read_all().unwrap().num_rows(), 1);
}

#[test]
fn test_reload_tracks_remote_changes() {
    let platform = platform();
    let mut catalog = catalog(&platform, CatalogArgs::new("analytics"));
    assert_eq!(catalog.names().unwrap().len(), 2);

    platform
        .execute_batch(
            "analytics",
            "DROP TABLE public.orders; CREATE TABLE public.invoices (id INTEGER);",
        )
        .unwrap();

    // Still within the TTL
    assert_eq!(catalog.names().unwrap(), vec!["orders", "users"]);

    catalog.reload().unwrap();
    assert_eq!(catalog.names().unwrap(), vec!["invoices", "users"]);
}

#[test]
fn test_reload_is_idempotent() {
    let platform = platform();
    let mut catalog = catalog(&platform, CatalogArgs::new("analytics"));

    catalog.reload().unwrap();
    let first = catalog.cached_entries().clone();
    catalog.reload().unwrap();
    assert_eq!(&first, catalog.cached_entries());
}

#[test]
fn test_missing_database_keeps_entries_empty() {
    let platform = platform();
    let mut catalog = catalog(&platform, CatalogArgs::new("elsewhere"));

    assert!(catalog.entries().is_err());
    assert!(catalog.cached_entries().is_empty());
    assert!(catalog.last_refreshed().is_none());
}

#[test]
fn test_open_redshift_catalog() {
    let platform = platform();
    platform
        .attach_in_memory("apps", DatabaseKind::Postgres)
        .unwrap();
    let connector: Arc<dyn Connector> = Arc::new(DuckConnector::new(platform));

    let mut catalog = open_redshift_catalog(connector, DEFAULT_SCHEMA, None).unwrap();
    assert_eq!(catalog.database(), "analytics");
    assert_eq!(catalog.names().unwrap(), vec!["orders", "users"]);
}
