//! Federated read rewriting
//!
//! A single-table `SELECT` against a federated table becomes
//!
//! ```text
//! SELECT * FROM (
//!     SELECT <proj> FROM <local> [AS a] [WHERE p]
//!     UNION ALL
//!     SELECT <proj> FROM <foreign> AS <a|local> WHERE [(p) AND] <a|local>.<id>
//!         NOT IN (SELECT <id> FROM <local> WHERE <id> IS NOT NULL)
//! ) AS <a|local>
//! [ORDER BY ...] [LIMIT ... OFFSET ... | FETCH ...]
//! ```
//!
//! so every identity key appears once and fresh rows shadow production rows
//! with the same key. The foreign branch and the derived table both take the
//! client's alias (or the local table name), so qualified references such as
//! `ORDER BY u.id` resolve. ORDER BY and LIMIT/OFFSET/FETCH stay on the outer
//! query exactly as the client wrote them; ORDER BY may only name columns the
//! projection produces, since the derived table exposes nothing else.

use super::catalog::{CatalogError, FederationCatalog, FederationEntry};
use super::quote_ident;
use sqlparser::ast::{
    visit_expressions, Expr, GroupByExpr, Ident, Query, Select, SelectItem, SetExpr, Statement,
    TableFactor,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::ops::ControlFlow;

/// Schema a client may use to qualify a federated table
pub const DEFAULT_SCHEMA: &str = "public";

const AGGREGATE_FUNCTIONS: &[&str] = &[
    "count", "sum", "avg", "min", "max", "array_agg", "string_agg", "bool_and", "bool_or",
    "every", "bit_and", "bit_or", "bit_xor", "json_agg", "jsonb_agg", "json_object_agg",
    "jsonb_object_agg", "xmlagg", "stddev", "stddev_pop", "stddev_samp", "variance", "var_pop",
    "var_samp", "corr", "covar_pop", "covar_samp", "regr_avgx", "regr_avgy", "regr_count",
    "regr_intercept", "regr_r2", "regr_slope", "regr_sxx", "regr_sxy", "regr_syy",
    "percentile_cont", "percentile_disc", "mode", "range_agg", "range_intersect_agg",
];

/// Outcome of a rewrite attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rewrite {
    /// Federation-aware SQL to run on the fresh store
    Applied(String),
    /// Not a federated read; run the original text unchanged
    NotApplicable,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RewriteError {
    /// The read targets a federated table but carries a clause the union
    /// rewrite cannot preserve
    #[error("{clause} is not supported on federated table \"{table}\"")]
    UnsupportedClause { table: String, clause: &'static str },

    #[error("invalid federation catalog entry: {0}")]
    InvalidCatalogEntry(#[from] CatalogError),

    /// The generated SQL did not re-parse
    #[error("failed to render federated query for \"{table}\": {reason}")]
    Render { table: String, reason: String },
}

/// Rewrite a parsed client query against the federation catalog
pub fn rewrite(statements: &[Statement], catalog: &FederationCatalog) -> Result<Rewrite, RewriteError> {
    if catalog.is_empty() {
        return Ok(Rewrite::NotApplicable);
    }

    let [Statement::Query(query)] = statements else {
        return Ok(Rewrite::NotApplicable);
    };

    let SetExpr::Select(select) = query.body.as_ref() else {
        return Ok(Rewrite::NotApplicable);
    };

    let Some(target) = single_table(select) else {
        return Ok(Rewrite::NotApplicable);
    };

    let Some(entry) = catalog.get(&target.table) else {
        return Ok(Rewrite::NotApplicable);
    };

    entry.validate()?;
    check_supported(query, select, &entry.local_table)?;
    check_order_by(query, &output_names(&select.projection, entry), &entry.local_table)?;

    let sql = render(query, select, entry, &target)?;
    Ok(Rewrite::Applied(sql))
}

/// The single plain table a SELECT reads from
struct TableRef {
    /// Normalized lookup key
    table: String,
    /// Client alias as written (`u`, `"U"`), if any
    alias: Option<String>,
}

fn single_table(select: &Select) -> Option<TableRef> {
    let [from] = select.from.as_slice() else {
        return None;
    };
    if !from.joins.is_empty() {
        return None;
    }

    match &from.relation {
        TableFactor::Table {
            name, alias, args, ..
        } if args.is_none() => {
            // Column aliases (`users AS u(a, b)`) would rename the projection
            if alias.as_ref().is_some_and(|a| !a.columns.is_empty()) {
                return None;
            }
            Some(TableRef {
                table: normalize_table_name(&name.to_string())?,
                alias: alias.as_ref().map(|a| a.name.to_string()),
            })
        }
        _ => None,
    }
}

/// `users`, `USERS`, `"users"`, `public.users` → `users`; other schemas → None
fn normalize_table_name(rendered: &str) -> Option<String> {
    let parts = split_qualified(rendered);
    let (schema, table) = match parts.as_slice() {
        [table] => (None, table),
        [schema, table] => (Some(schema), table),
        _ => return None,
    };

    if let Some(schema) = schema {
        if unquote(schema) != DEFAULT_SCHEMA {
            return None;
        }
    }
    Some(unquote(table))
}

/// Split on dots outside double quotes
fn split_qualified(name: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    for (i, c) in name.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '.' if !quoted => {
                parts.push(&name[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&name[start..]);
    parts
}

/// Quoted identifiers keep their case, bare ones fold to lower case
fn unquote(ident: &str) -> String {
    match ident.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(inner) => inner.replace("\"\"", "\""),
        None => ident.to_lowercase(),
    }
}

fn check_supported(query: &Query, select: &Select, table: &str) -> Result<(), RewriteError> {
    let unsupported = |clause: &'static str| RewriteError::UnsupportedClause {
        table: table.to_string(),
        clause,
    };

    if query.with.is_some() {
        return Err(unsupported("WITH"));
    }
    if !query.locks.is_empty() {
        return Err(unsupported("FOR UPDATE/SHARE"));
    }
    if select.into.is_some() {
        return Err(unsupported("SELECT INTO"));
    }
    if select.distinct.is_some() {
        return Err(unsupported("DISTINCT"));
    }
    match &select.group_by {
        GroupByExpr::Expressions(exprs, _) if exprs.is_empty() => {}
        _ => return Err(unsupported("GROUP BY")),
    }
    if select.having.is_some() {
        return Err(unsupported("HAVING"));
    }
    if !select.named_window.is_empty() {
        return Err(unsupported("WINDOW"));
    }

    for item in &select.projection {
        let found = visit_expressions(item, |expr| match expr {
            Expr::Function(func) if func.over.is_some() => ControlFlow::Break("window function"),
            Expr::Function(func) if is_aggregate(&func.name.to_string()) => {
                ControlFlow::Break("aggregate function")
            }
            _ => ControlFlow::Continue(()),
        });
        if let ControlFlow::Break(clause) = found {
            return Err(unsupported(clause));
        }
    }

    Ok(())
}

/// Column names the projection exposes through the derived table.
/// Expressions without a derivable name are skipped.
fn output_names(items: &[SelectItem], entry: &FederationEntry) -> Vec<String> {
    let mut names = Vec::with_capacity(items.len());
    for item in items {
        match item {
            SelectItem::UnnamedExpr(expr) => names.extend(expr_output_name(expr)),
            SelectItem::ExprWithAlias { alias, .. } => names.push(ident_name(alias)),
            _ => names.extend(entry.column_names().map(str::to_string)),
        }
    }
    names
}

fn expr_output_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident_name(ident)),
        Expr::CompoundIdentifier(parts) => parts.last().map(ident_name),
        Expr::Function(func) => split_qualified(&func.name.to_string()).last().map(|s| unquote(s)),
        _ => None,
    }
}

fn ident_name(ident: &Ident) -> String {
    match ident.quote_style {
        Some(_) => ident.value.clone(),
        None => ident.value.to_lowercase(),
    }
}

/// Every column an ORDER BY key references must be a projection output
fn check_order_by(query: &Query, outputs: &[String], table: &str) -> Result<(), RewriteError> {
    let outside = visit_expressions(&query.order_by, |expr| {
        let referenced = match expr {
            Expr::Identifier(ident) => Some(ident_name(ident)),
            Expr::CompoundIdentifier(parts) => parts.last().map(ident_name),
            _ => None,
        };
        match referenced {
            Some(name) if !outputs.contains(&name) => ControlFlow::Break(()),
            _ => ControlFlow::Continue(()),
        }
    });

    if outside.is_break() {
        return Err(RewriteError::UnsupportedClause {
            table: table.to_string(),
            clause: "ORDER BY on a column outside the select list",
        });
    }
    Ok(())
}

fn is_aggregate(function_name: &str) -> bool {
    let last = split_qualified(function_name)
        .last()
        .map(|s| unquote(s))
        .unwrap_or_default();
    AGGREGATE_FUNCTIONS.contains(&last.as_str())
}

fn render(
    query: &Query,
    select: &Select,
    entry: &FederationEntry,
    target: &TableRef,
) -> Result<String, RewriteError> {
    let render_error = |reason: String| RewriteError::Render {
        table: entry.local_table.clone(),
        reason,
    };

    let projection = expand_projection(&select.projection, entry)
        .map_err(|clause| RewriteError::UnsupportedClause {
            table: entry.local_table.clone(),
            clause,
        })?;

    let local = quote_ident(&entry.local_table);
    let foreign = quote_ident(&entry.foreign_table);
    let identity = quote_ident(&entry.identity_column);
    let binding = target.alias.clone().unwrap_or_else(|| local.clone());

    let local_from = match &target.alias {
        Some(alias) => format!("{} AS {}", local, alias),
        None => local.clone(),
    };
    let predicate = select.selection.as_ref().map(|p| p.to_string());

    let mut left = format!("SELECT {} FROM {}", projection, local_from);
    if let Some(p) = &predicate {
        left.push_str(" WHERE ");
        left.push_str(p);
    }

    let anti_join = format!(
        "{binding}.{identity} NOT IN (SELECT {identity} FROM {local} WHERE {identity} IS NOT NULL)"
    );
    let right_filter = match &predicate {
        Some(p) => format!("({}) AND {}", p, anti_join),
        None => anti_join,
    };
    let right = format!(
        "SELECT {} FROM {} AS {} WHERE {}",
        projection, foreign, binding, right_filter
    );

    let union_sql = format!(
        "SELECT * FROM ({} UNION ALL {}) AS {}",
        left, right, binding
    );
    let parsed = Parser::parse_sql(&PostgreSqlDialect {}, &union_sql)
        .map_err(|e| render_error(e.to_string()))?;
    let outer_body = match parsed.into_iter().next() {
        Some(Statement::Query(q)) => q.body,
        _ => return Err(render_error("union did not parse as a query".into())),
    };

    // Outer ORDER BY / LIMIT / OFFSET / FETCH are kept verbatim
    let mut rewritten = query.clone();
    rewritten.body = outer_body;
    Ok(rewritten.to_string())
}

/// Render the projection, expanding `*` and `alias.*` from the catalog
/// snapshot. Wildcards with dialect options are refused.
fn expand_projection(items: &[SelectItem], entry: &FederationEntry) -> Result<String, &'static str> {
    let mut rendered = Vec::with_capacity(items.len());

    for item in items {
        match item {
            SelectItem::Wildcard(..) => {
                if item.to_string() != "*" {
                    return Err("wildcard options");
                }
                rendered.extend(entry.column_names().map(quote_ident));
            }
            SelectItem::QualifiedWildcard(..) => {
                let text = item.to_string();
                let qualifier = text.strip_suffix(".*").ok_or("wildcard options")?;
                rendered.extend(
                    entry
                        .column_names()
                        .map(|c| format!("{}.{}", qualifier, quote_ident(c))),
                );
            }
            other => rendered.push(other.to_string()),
        }
    }

    Ok(rendered.join(", "))
}
