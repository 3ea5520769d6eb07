//! Configuration for the previewdb routing proxy
//!
//! Loaded once at startup from an optional YAML/TOML file layered with
//! `PREVIEWDB__SECTION__KEY` environment variables, then validated. The
//! resulting [`ProxyConfig`] is immutable for the lifetime of the process.

use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{PreviewError, Result};

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "PREVIEWDB";

/// Top-level proxy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Authoritative production store
    pub production_db: DbConfig,
    /// Fresh (preview) store, store of record for every mutation
    pub fresh_db: DbConfig,
    /// Listener settings
    pub server: ServerConfig,
    /// Operational limits
    pub limits: LimitsConfig,
    /// Federation (foreign-data link) settings
    pub federation: FederationConfig,
}

/// Connection parameters for one backend store
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    /// disable, allow, prefer, require, verify-ca, verify-full
    pub sslmode: String,
    /// Maximum connections in the backend pool
    pub max_connections: u32,
    /// Pool acquire / connect timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 5432,
            user: "postgres".into(),
            password: String::new(),
            dbname: "postgres".into(),
            sslmode: "prefer".into(),
            max_connections: 10,
            connect_timeout_secs: 30,
        }
    }
}

// Hand-written so passwords never reach the logs
impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("dbname", &self.dbname)
            .field("sslmode", &self.sslmode)
            .field("max_connections", &self.max_connections)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

impl DbConfig {
    /// Parse the configured sslmode
    pub fn ssl_mode(&self) -> Result<PgSslMode> {
        PgSslMode::from_str(&self.sslmode).map_err(|e| {
            PreviewError::ConfigError(format!("invalid sslmode '{}': {}", self.sslmode, e))
        })
    }

    /// Build sqlx connect options for this store
    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        Ok(PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.dbname)
            .ssl_mode(self.ssl_mode()?))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Short human-readable location, safe to log
    pub fn display_target(&self) -> String {
        format!("{}@{}:{}/{}", self.user, self.host, self.port, self.dbname)
    }
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// PostgreSQL wire protocol port
    pub port: u16,
    /// Admin HTTP port (health, metrics, federation refresh)
    pub http_port: u16,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit JSON formatted logs
    pub json_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 6432,
            http_port: 8080,
            log_level: "info".into(),
            json_logs: false,
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.host, self.http_port)
    }
}

/// Operational limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum concurrent client connections
    pub max_connections: usize,
    /// Per-query timeout in seconds (0 disables the timeout)
    pub query_timeout_secs: u64,
    /// TCP keepalive time for client sockets
    pub tcp_keepalive_secs: u64,
    /// Flush the client socket every N streamed rows
    pub flush_every_rows: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            query_timeout_secs: 600,
            tcp_keepalive_secs: 10,
            flush_every_rows: 100,
        }
    }
}

impl LimitsConfig {
    pub fn query_timeout(&self) -> Option<Duration> {
        (self.query_timeout_secs > 0).then(|| Duration::from_secs(self.query_timeout_secs))
    }
}

/// What to do with a federated read that carries a clause the rewriter
/// cannot federate (GROUP BY, DISTINCT, aggregates, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnsupportedClausePolicy {
    /// Fail the query with feature_not_supported
    #[default]
    Reject,
    /// Run the original query through the probe-and-fallback path
    Passthrough,
}

/// One allow-listed federated table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederatedTableConfig {
    /// Table name in the default schema (same name in both stores)
    pub name: String,
    /// Stable row key present in both stores, used for de-duplication
    #[serde(default = "default_identity_column")]
    pub identity_column: String,
}

fn default_identity_column() -> String {
    "id".to_string()
}

/// Federation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Run the bootstrap at startup and rewrite federated reads
    pub enabled: bool,
    /// Name of the foreign server object created on the fresh store
    pub server_name: String,
    /// Schema introspected on production and holding the local tables
    pub schema: String,
    /// Suffix appended to the local table name for its foreign table
    pub foreign_table_suffix: String,
    /// Production host as seen from the fresh store (defaults to production_db.host)
    pub remote_host: Option<String>,
    /// Production port as seen from the fresh store (defaults to production_db.port)
    pub remote_port: Option<u16>,
    /// Create missing local tables on the fresh store shaped like the foreign table
    pub ensure_local_tables: bool,
    pub unsupported_clause_policy: UnsupportedClausePolicy,
    /// Static allow-list of federated tables
    pub tables: Vec<FederatedTableConfig>,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            server_name: "production_server".into(),
            schema: "public".into(),
            foreign_table_suffix: "_production".into(),
            remote_host: None,
            remote_port: None,
            ensure_local_tables: false,
            unsupported_clause_policy: UnsupportedClausePolicy::Reject,
            tables: vec![FederatedTableConfig {
                name: "users".into(),
                identity_column: default_identity_column(),
            }],
        }
    }
}

impl FederationConfig {
    /// Allow-list lookup
    pub fn table(&self, name: &str) -> Option<&FederatedTableConfig> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn foreign_table_name(&self, local: &str) -> String {
        format!("{}{}", local, self.foreign_table_suffix)
    }
}

impl ProxyConfig {
    /// Load configuration from an optional file plus process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Load configuration, taking environment overrides from `env` when given
    /// instead of the process environment
    pub fn load_with_env(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let cfg: ProxyConfig = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations that cannot be served
    pub fn validate(&self) -> Result<()> {
        for (label, db) in [("production_db", &self.production_db), ("fresh_db", &self.fresh_db)] {
            if db.host.trim().is_empty() {
                return Err(PreviewError::ConfigError(format!("{}.host is empty", label)));
            }
            if db.dbname.trim().is_empty() {
                return Err(PreviewError::ConfigError(format!("{}.dbname is empty", label)));
            }
            if db.max_connections == 0 {
                return Err(PreviewError::ConfigError(format!(
                    "{}.max_connections must be positive",
                    label
                )));
            }
            db.ssl_mode()?;
        }

        if self.limits.max_connections == 0 {
            return Err(PreviewError::ConfigError(
                "limits.max_connections must be positive".into(),
            ));
        }

        let fed = &self.federation;
        if fed.enabled {
            if !is_plain_identifier(&fed.server_name) {
                return Err(PreviewError::ConfigError(format!(
                    "federation.server_name '{}' is not a plain identifier",
                    fed.server_name
                )));
            }
            if fed.foreign_table_suffix.is_empty() {
                return Err(PreviewError::ConfigError(
                    "federation.foreign_table_suffix must not be empty".into(),
                ));
            }
            let mut seen = std::collections::HashSet::new();
            for table in &fed.tables {
                if !is_plain_identifier(&table.name) || !is_plain_identifier(&table.identity_column) {
                    return Err(PreviewError::ConfigError(format!(
                        "federated table '{}' (identity '{}') must use plain identifiers",
                        table.name, table.identity_column
                    )));
                }
                if !seen.insert(table.name.as_str()) {
                    return Err(PreviewError::ConfigError(format!(
                        "federated table '{}' listed twice",
                        table.name
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Lowercase `[a-z_][a-z0-9_]*`, safe to splice into DDL unquoted
pub fn is_plain_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = ProxyConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.server.listen_addr(), "0.0.0.0:6432");
        assert_eq!(cfg.federation.tables.len(), 1);
        assert_eq!(cfg.federation.foreign_table_name("users"), "users_production");
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
production_db:
  host: prod.internal
  port: 5433
  user: app
  password: secret
  dbname: production
  sslmode: disable
fresh_db:
  host: fresh.internal
  dbname: fresh
  sslmode: disable
server:
  port: 15432
federation:
  unsupported_clause_policy: passthrough
  tables:
    - name: accounts
      identity_column: account_id
"#
        )
        .unwrap();

        let cfg = ProxyConfig::load_with_env(Some(file.path()), Some(HashMap::new())).unwrap();
        assert_eq!(cfg.production_db.host, "prod.internal");
        assert_eq!(cfg.production_db.port, 5433);
        assert_eq!(cfg.fresh_db.port, 5432);
        assert_eq!(cfg.server.port, 15432);
        assert_eq!(
            cfg.federation.unsupported_clause_policy,
            UnsupportedClausePolicy::Passthrough
        );
        assert_eq!(
            cfg.federation.table("accounts").map(|t| t.identity_column.as_str()),
            Some("account_id")
        );
    }

    #[test]
    fn test_env_overrides_file() {
        let mut env = HashMap::new();
        env.insert("PREVIEWDB__FRESH_DB__HOST".to_string(), "fresh.example".to_string());
        env.insert("PREVIEWDB__SERVER__PORT".to_string(), "7000".to_string());

        let cfg = ProxyConfig::load_with_env(None, Some(env)).unwrap();
        assert_eq!(cfg.fresh_db.host, "fresh.example");
        assert_eq!(cfg.server.port, 7000);
    }

    #[test]
    fn test_invalid_sslmode_rejected() {
        let mut cfg = ProxyConfig::default();
        cfg.fresh_db.sslmode = "sometimes".into();
        assert!(matches!(cfg.validate(), Err(PreviewError::ConfigError(_))));
    }

    #[test]
    fn test_duplicate_federated_table_rejected() {
        let mut cfg = ProxyConfig::default();
        cfg.federation.tables.push(FederatedTableConfig {
            name: "users".into(),
            identity_column: "id".into(),
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_password_is_redacted() {
        let mut db = DbConfig::default();
        db.password = "hunter2".into();
        let rendered = format!("{:?}", db);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_plain_identifier() {
        assert!(is_plain_identifier("users"));
        assert!(is_plain_identifier("_tmp_2"));
        assert!(!is_plain_identifier("Users"));
        assert!(!is_plain_identifier("users; drop"));
        assert!(!is_plain_identifier(""));
    }
}
