//! postgres_fdw provisioning on the fresh store
//!
//! Every statement is repeatable: objects are dropped before they are
//! recreated, so running the bootstrap twice leaves the same state and
//! returns the same catalog.

use super::catalog::{CatalogError, FederatedColumn, FederationCatalog, FederationEntry};
use super::{quote_ident, quote_literal};
use crate::backend::{self, Backend, BackendError, BackendRole};
use previewdb_common::ProxyConfig;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// A provisioning or introspection statement failed; later steps were not run
    #[error("bootstrap statement failed on {backend} ({statement}): {source}")]
    Statement {
        backend: BackendRole,
        statement: String,
        #[source]
        source: BackendError,
    },

    #[error("identity column '{identity}' not found in production table '{table}'")]
    MissingIdentity { table: String, identity: String },

    #[error("production introspection returned a malformed row: {0}")]
    Introspection(String),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Provision the foreign-data link and build the catalog
pub async fn bootstrap(
    production: &dyn Backend,
    fresh: &dyn Backend,
    cfg: &ProxyConfig,
) -> Result<FederationCatalog, BootstrapError> {
    let fed = &cfg.federation;
    let server = quote_ident(&fed.server_name);
    let remote_host = fed
        .remote_host
        .as_deref()
        .unwrap_or(&cfg.production_db.host);
    let remote_port = fed.remote_port.unwrap_or(cfg.production_db.port);

    info!(
        server = %fed.server_name,
        remote = %format!("{}:{}/{}", remote_host, remote_port, cfg.production_db.dbname),
        tables = fed.tables.len(),
        "Bootstrapping federation"
    );

    run(fresh, "CREATE EXTENSION IF NOT EXISTS postgres_fdw").await?;

    run(fresh, &format!("DROP SERVER IF EXISTS {} CASCADE", server)).await?;
    run(
        fresh,
        &format!(
            "CREATE SERVER {} FOREIGN DATA WRAPPER postgres_fdw OPTIONS (host {}, port {}, dbname {})",
            server,
            quote_literal(remote_host),
            quote_literal(&remote_port.to_string()),
            quote_literal(&cfg.production_db.dbname),
        ),
    )
    .await?;

    run(
        fresh,
        &format!("DROP USER MAPPING IF EXISTS FOR CURRENT_USER SERVER {}", server),
    )
    .await?;
    let mapping = format!(
        "CREATE USER MAPPING FOR CURRENT_USER SERVER {} OPTIONS (user {}, password {})",
        server,
        quote_literal(&cfg.production_db.user),
        quote_literal(&cfg.production_db.password),
    );
    backend::execute(fresh, &mapping)
        .await
        .map_err(|source| BootstrapError::Statement {
            backend: fresh.role(),
            statement: format!(
                "CREATE USER MAPPING FOR CURRENT_USER SERVER {} OPTIONS (user {}, password '<redacted>')",
                server,
                quote_literal(&cfg.production_db.user),
            ),
            source,
        })?;

    let table_names: Vec<&str> = fed.tables.iter().map(|t| t.name.as_str()).collect();
    let introspection = introspection_sql(&fed.schema, &table_names);
    let rows = backend::fetch_rows(production, &introspection)
        .await
        .map_err(|source| BootstrapError::Statement {
            backend: production.role(),
            statement: "production catalog introspection".into(),
            source,
        })?;
    let mut production_tables = group_columns(rows)?;

    let mut entries = Vec::new();
    for table in &fed.tables {
        let Some(columns) = production_tables.remove(&table.name) else {
            warn!(table = %table.name, schema = %fed.schema, "Federated table not found on production, skipping");
            continue;
        };

        let entry = FederationEntry {
            local_table: table.name.clone(),
            foreign_table: fed.foreign_table_name(&table.name),
            columns,
            identity_column: table.identity_column.clone(),
        };
        if !entry.has_column(&entry.identity_column) {
            return Err(BootstrapError::MissingIdentity {
                table: entry.local_table,
                identity: entry.identity_column,
            });
        }

        let foreign = quote_ident(&entry.foreign_table);
        run(fresh, &format!("DROP FOREIGN TABLE IF EXISTS {}", foreign)).await?;
        run(fresh, &create_foreign_table_sql(&entry, &server, &fed.schema)).await?;

        if fed.ensure_local_tables {
            run(
                fresh,
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} (LIKE {})",
                    quote_ident(&entry.local_table),
                    foreign
                ),
            )
            .await?;
        }

        info!(
            table = %entry.local_table,
            foreign_table = %entry.foreign_table,
            columns = entry.columns.len(),
            "Federated table registered"
        );
        entries.push(entry);
    }

    let catalog = FederationCatalog::from_entries(entries)?;
    info!(federated_tables = catalog.len(), "Federation bootstrap complete");
    Ok(catalog)
}

async fn run(fresh: &dyn Backend, sql: &str) -> Result<(), BootstrapError> {
    debug!(sql = %sql, "Bootstrap statement");
    backend::execute(fresh, sql)
        .await
        .map(|_| ())
        .map_err(|source| BootstrapError::Statement {
            backend: fresh.role(),
            statement: sql.to_string(),
            source,
        })
}

/// Ordered base-table columns of the allow-listed tables
pub(crate) fn introspection_sql(schema: &str, tables: &[&str]) -> String {
    let names = if tables.is_empty() {
        "NULL".to_string()
    } else {
        tables
            .iter()
            .map(|t| quote_literal(t))
            .collect::<Vec<_>>()
            .join(", ")
    };

    format!(
        "SELECT c.relname, a.attname, pg_catalog.format_type(a.atttypid, a.atttypmod) \
         FROM pg_catalog.pg_class c \
         JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
         JOIN pg_catalog.pg_attribute a ON a.attrelid = c.oid \
         WHERE c.relkind = 'r' AND n.nspname = {} AND c.relname IN ({}) \
         AND a.attnum > 0 AND NOT a.attisdropped \
         ORDER BY c.relname, a.attnum",
        quote_literal(schema),
        names
    )
}

fn group_columns(
    rows: Vec<backend::TextRow>,
) -> Result<BTreeMap<String, Vec<FederatedColumn>>, BootstrapError> {
    let mut tables: BTreeMap<String, Vec<FederatedColumn>> = BTreeMap::new();
    for row in rows {
        match row.as_slice() {
            [Some(table), Some(column), Some(data_type)] => {
                tables
                    .entry(table.clone())
                    .or_default()
                    .push(FederatedColumn::new(column.clone(), data_type.clone()));
            }
            other => return Err(BootstrapError::Introspection(format!("{:?}", other))),
        }
    }
    Ok(tables)
}

fn create_foreign_table_sql(entry: &FederationEntry, server: &str, schema: &str) -> String {
    let columns = entry
        .columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), c.data_type))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "CREATE FOREIGN TABLE {} ({}) SERVER {} OPTIONS (schema_name {}, table_name {})",
        quote_ident(&entry.foreign_table),
        columns,
        server,
        quote_literal(schema),
        quote_literal(&entry.local_table),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{row, FakeBackend, Script};
    use previewdb_common::FederatedTableConfig;

    fn config() -> ProxyConfig {
        let mut cfg = ProxyConfig::default();
        cfg.production_db.host = "prod.internal".into();
        cfg.production_db.dbname = "app".into();
        cfg.production_db.user = "reader".into();
        cfg.production_db.password = "s3cret".into();
        cfg
    }

    fn production_with_users() -> FakeBackend {
        let production = FakeBackend::new(BackendRole::Production);
        production.script(
            &introspection_sql("public", &["users"]),
            Script::Rows {
                columns: vec![("relname", "NAME"), ("attname", "NAME"), ("format_type", "TEXT")],
                rows: vec![
                    row(&["users", "id", "integer"]),
                    row(&["users", "name", "character varying(255)"]),
                    row(&["users", "order", "integer"]),
                ],
            },
        );
        production
    }

    #[tokio::test]
    async fn test_bootstrap_provisions_link() {
        let production = production_with_users();
        let fresh = FakeBackend::new(BackendRole::Fresh);

        let catalog = bootstrap(&production, &fresh, &config()).await.unwrap();

        let entry = catalog.get("users").unwrap();
        assert_eq!(entry.foreign_table, "users_production");
        assert_eq!(entry.identity_column, "id");
        assert_eq!(
            entry.column_names().collect::<Vec<_>>(),
            vec!["id", "name", "order"]
        );

        let seen = fresh.seen();
        assert_eq!(
            seen,
            vec![
                "CREATE EXTENSION IF NOT EXISTS postgres_fdw".to_string(),
                "DROP SERVER IF EXISTS production_server CASCADE".to_string(),
                "CREATE SERVER production_server FOREIGN DATA WRAPPER postgres_fdw \
                 OPTIONS (host 'prod.internal', port '5432', dbname 'app')"
                    .to_string(),
                "DROP USER MAPPING IF EXISTS FOR CURRENT_USER SERVER production_server".to_string(),
                "CREATE USER MAPPING FOR CURRENT_USER SERVER production_server \
                 OPTIONS (user 'reader', password 's3cret')"
                    .to_string(),
                "DROP FOREIGN TABLE IF EXISTS users_production".to_string(),
                "CREATE FOREIGN TABLE users_production (id integer, name character varying(255), \
                 \"order\" integer) SERVER production_server \
                 OPTIONS (schema_name 'public', table_name 'users')"
                    .to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_bootstrap_is_repeatable() {
        let production = production_with_users();
        let fresh = FakeBackend::new(BackendRole::Fresh);
        let cfg = config();

        let first = bootstrap(&production, &fresh, &cfg).await.unwrap();
        let second = bootstrap(&production, &fresh, &cfg).await.unwrap();
        assert_eq!(first, second);

        // The second run replays exactly the same statements
        let seen = fresh.seen();
        let (a, b) = seen.split_at(seen.len() / 2);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_remote_overrides_and_local_tables() {
        let production = production_with_users();
        let fresh = FakeBackend::new(BackendRole::Fresh);
        let mut cfg = config();
        cfg.federation.remote_host = Some("host.docker.internal".into());
        cfg.federation.remote_port = Some(15432);
        cfg.federation.ensure_local_tables = true;

        bootstrap(&production, &fresh, &cfg).await.unwrap();

        let seen = fresh.seen();
        assert!(seen[2].contains("host 'host.docker.internal', port '15432'"));
        assert_eq!(
            seen.last().unwrap(),
            "CREATE TABLE IF NOT EXISTS users (LIKE users_production)"
        );
    }

    #[tokio::test]
    async fn test_missing_table_is_skipped() {
        let production = FakeBackend::new(BackendRole::Production);
        let fresh = FakeBackend::new(BackendRole::Fresh);

        let catalog = bootstrap(&production, &fresh, &config()).await.unwrap();
        assert!(catalog.is_empty());
        assert!(!fresh.seen().iter().any(|s| s.contains("FOREIGN TABLE")));
    }

    #[tokio::test]
    async fn test_missing_identity_fails() {
        let production = production_with_users();
        let fresh = FakeBackend::new(BackendRole::Fresh);
        let mut cfg = config();
        cfg.federation.tables = vec![FederatedTableConfig {
            name: "users".into(),
            identity_column: "uuid".into(),
        }];
        // Same allow-list, so the scripted introspection still matches
        let err = bootstrap(&production, &fresh, &cfg).await.unwrap_err();
        assert!(matches!(err, BootstrapError::MissingIdentity { .. }));
    }

    #[tokio::test]
    async fn test_first_failure_aborts() {
        let production = production_with_users();
        let fresh = FakeBackend::new(BackendRole::Fresh);
        fresh.script(
            "CREATE EXTENSION IF NOT EXISTS postgres_fdw",
            Script::Fail {
                code: "42501",
                message: "permission denied to create extension \"postgres_fdw\"",
            },
        );

        let err = bootstrap(&production, &fresh, &config()).await.unwrap_err();
        match err {
            BootstrapError::Statement { backend, statement, source } => {
                assert_eq!(backend, BackendRole::Fresh);
                assert_eq!(statement, "CREATE EXTENSION IF NOT EXISTS postgres_fdw");
                assert_eq!(source.code(), Some("42501"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fresh.seen().len(), 1);
    }

    #[tokio::test]
    async fn test_user_mapping_failure_redacts_password() {
        let production = production_with_users();
        let fresh = FakeBackend::new(BackendRole::Fresh);
        fresh.script(
            "CREATE USER MAPPING FOR CURRENT_USER SERVER production_server \
             OPTIONS (user 'reader', password 's3cret')",
            Script::Fail {
                code: "42704",
                message: "server \"production_server\" does not exist",
            },
        );

        let err = bootstrap(&production, &fresh, &config()).await.unwrap_err();
        assert!(!err.to_string().contains("s3cret"));
    }
}
