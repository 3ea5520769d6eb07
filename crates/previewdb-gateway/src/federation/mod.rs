//! Read federation across the fresh and production stores
//!
//! - `catalog` - federated table registry and its atomically swapped handle
//! - `bootstrap` - postgres_fdw provisioning on the fresh store
//! - `rewriter` - UNION ALL / anti-join rewrite of federated reads

pub mod bootstrap;
pub mod catalog;
pub mod rewriter;

pub use bootstrap::{bootstrap, BootstrapError};
pub use catalog::{FederatedColumn, FederationCatalog, FederationEntry, SharedCatalog};
pub use rewriter::{rewrite, Rewrite, RewriteError};

/// Reserved PostgreSQL keywords that cannot appear as bare column names
const RESERVED: &[&str] = &[
    "all", "analyse", "analyze", "and", "any", "array", "as", "asc", "asymmetric", "both",
    "case", "cast", "check", "collate", "column", "constraint", "create", "current_catalog",
    "current_date", "current_role", "current_time", "current_timestamp", "current_user",
    "default", "deferrable", "desc", "distinct", "do", "else", "end", "except", "false",
    "fetch", "for", "foreign", "from", "grant", "group", "having", "in", "initially",
    "intersect", "into", "lateral", "leading", "limit", "localtime", "localtimestamp", "not",
    "null", "offset", "on", "only", "or", "order", "placing", "primary", "references",
    "returning", "select", "session_user", "some", "symmetric", "system_user", "table", "then",
    "to", "trailing", "true", "union", "unique", "user", "using", "variadic", "when", "where",
    "window", "with",
];

/// Render an identifier, quoting it only when PostgreSQL requires it
pub fn quote_ident(name: &str) -> String {
    let plain = name
        .chars()
        .next()
        .map(|c| c.is_ascii_lowercase() || c == '_')
        .unwrap_or(false)
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if plain && !RESERVED.contains(&name) {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// Render a string literal
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
