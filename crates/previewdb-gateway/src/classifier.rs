//! Statement classification
//!
//! Parses client SQL with the PostgreSQL dialect and assigns a coarse
//! [`StatementCategory`] used for routing. Classification never fails: a
//! parse error yields [`StatementCategory::Unknown`] together with the error
//! text, which the router treats conservatively.

use sqlparser::ast::{Query, SetExpr, Statement};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::fmt;

/// Coarse statement category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementCategory {
    Read,
    Write,
    Ddl,
    Transaction,
    Unknown,
}

impl StatementCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementCategory::Read => "read",
            StatementCategory::Write => "write",
            StatementCategory::Ddl => "ddl",
            StatementCategory::Transaction => "transaction",
            StatementCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for StatementCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying one client query string
#[derive(Debug, Clone)]
pub struct Classification {
    pub category: StatementCategory,
    /// Parsed statements (empty on parse failure or empty input)
    pub statements: Vec<Statement>,
    /// Parser error text when the input did not parse
    pub parse_error: Option<String>,
    /// Command-tag keyword per statement (`SELECT`, `INSERT`, `CREATE TABLE`, ...)
    pub command_keywords: Vec<String>,
}

impl Classification {
    /// Keyword for the `index`-th completed statement, falling back to the last one
    pub fn command_keyword(&self, index: usize) -> &str {
        self.command_keywords
            .get(index)
            .or_else(|| self.command_keywords.last())
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn is_empty_query(&self) -> bool {
        self.statements.is_empty() && self.parse_error.is_none()
    }

    /// Some statement opens a transaction block
    pub fn begins_transaction(&self) -> bool {
        self.has_keyword(&["BEGIN", "START TRANSACTION"])
    }

    /// Every statement closes the transaction block (COMMIT, END, ROLLBACK, ABORT)
    pub fn ends_transaction(&self) -> bool {
        !self.command_keywords.is_empty()
            && self
                .command_keywords
                .iter()
                .all(|k| k == "COMMIT" || k == "ROLLBACK")
            && !self
                .statements
                .iter()
                .any(|s| matches!(s, Statement::Rollback { savepoint: Some(_), .. }))
    }

    /// Some statement leaves state on the connection past its transaction:
    /// settings, prepared statements, notifications, temporary tables
    pub fn changes_session(&self) -> bool {
        self.has_keyword(&["SET", "RESET", "PREPARE", "LISTEN"])
            || self
                .statements
                .iter()
                .any(|s| matches!(s, Statement::CreateTable(table) if table.temporary))
    }

    /// The query has to run on a connection the session keeps
    pub fn needs_pinned_connection(&self) -> bool {
        self.begins_transaction() || self.changes_session()
    }

    fn has_keyword(&self, keywords: &[&str]) -> bool {
        self.command_keywords
            .iter()
            .any(|k| keywords.contains(&k.as_str()))
    }
}

/// Classify raw SQL text
pub fn classify(sql: &str) -> Classification {
    if sql.trim().is_empty() {
        return Classification {
            category: StatementCategory::Unknown,
            statements: Vec::new(),
            parse_error: None,
            command_keywords: Vec::new(),
        };
    }

    match Parser::parse_sql(&PostgreSqlDialect {}, sql) {
        Ok(statements) => {
            let categories: Vec<StatementCategory> =
                statements.iter().map(categorize_statement).collect();
            let category = combine(&categories);
            let command_keywords = statements
                .iter()
                .map(|stmt| match stmt {
                    Statement::Query(query) if !is_data_modifying(query) => "SELECT".to_string(),
                    other => command_keyword(&other.to_string()),
                })
                .collect();

            Classification {
                category,
                statements,
                parse_error: None,
                command_keywords,
            }
        }
        Err(e) => Classification {
            category: StatementCategory::Unknown,
            statements: Vec::new(),
            parse_error: Some(e.to_string()),
            command_keywords: split_statements(sql).map(command_keyword).collect(),
        },
    }
}

/// Read only when every statement reads; otherwise the first non-read category
fn combine(categories: &[StatementCategory]) -> StatementCategory {
    if categories.is_empty() {
        return StatementCategory::Unknown;
    }
    categories
        .iter()
        .copied()
        .find(|c| *c != StatementCategory::Read)
        .unwrap_or(StatementCategory::Read)
}

fn categorize_statement(stmt: &Statement) -> StatementCategory {
    match stmt {
        Statement::Query(query) => {
            if is_data_modifying(query) {
                StatementCategory::Write
            } else if selects_into(query) {
                // SELECT ... INTO creates a table
                StatementCategory::Ddl
            } else {
                StatementCategory::Read
            }
        }
        Statement::Insert { .. }
        | Statement::Update { .. }
        | Statement::Delete { .. }
        | Statement::Merge { .. } => StatementCategory::Write,
        Statement::StartTransaction { .. }
        | Statement::Commit { .. }
        | Statement::Rollback { .. }
        | Statement::Savepoint { .. }
        | Statement::ReleaseSavepoint { .. } => StatementCategory::Transaction,
        other => categorize_keyword(&other.to_string()),
    }
}

/// Category for the long tail of statement kinds, keyed on the leading keyword
/// of the statement's canonical rendering
fn categorize_keyword(rendered: &str) -> StatementCategory {
    let first = rendered
        .split_whitespace()
        .next()
        .map(|w| w.to_ascii_uppercase())
        .unwrap_or_default();

    match first.as_str() {
        "SHOW" => StatementCategory::Read,
        "INSERT" | "UPDATE" | "DELETE" | "MERGE" => StatementCategory::Write,
        "CREATE" | "ALTER" | "DROP" | "TRUNCATE" | "COMMENT" | "RENAME" | "GRANT" | "REVOKE" => {
            StatementCategory::Ddl
        }
        "SET" | "RESET" | "BEGIN" | "START" | "COMMIT" | "END" | "ROLLBACK" | "ABORT"
        | "SAVEPOINT" | "RELEASE" => StatementCategory::Transaction,
        _ => StatementCategory::Unknown,
    }
}

/// True when the query body or any of its CTEs writes
fn is_data_modifying(query: &Query) -> bool {
    let cte_writes = query
        .with
        .as_ref()
        .map(|with| with.cte_tables.iter().any(|cte| is_data_modifying(&cte.query)))
        .unwrap_or(false);

    cte_writes || set_expr_modifies(&query.body)
}

fn set_expr_modifies(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(_) | SetExpr::Values(_) | SetExpr::Table(_) => false,
        SetExpr::Insert(_) | SetExpr::Update(_) => true,
        SetExpr::Query(inner) => is_data_modifying(inner),
        SetExpr::SetOperation { left, right, .. } => {
            set_expr_modifies(left) || set_expr_modifies(right)
        }
        other => categorize_keyword(&other.to_string()) == StatementCategory::Write,
    }
}

fn selects_into(query: &Query) -> bool {
    match query.body.as_ref() {
        SetExpr::Select(select) => select.into.is_some(),
        _ => false,
    }
}

/// Split raw text on top-level semicolons (quote aware), used only when the
/// parser rejected the input and per-statement keywords are still wanted
fn split_statements(sql: &str) -> impl Iterator<Item = &str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_single = false;
    let mut in_double = false;

    for (i, c) in sql.char_indices() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            ';' if !in_single && !in_double => {
                parts.push(&sql[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&sql[start..]);
    parts.into_iter().filter(|p| !p.trim().is_empty())
}

/// PostgreSQL command-tag keyword for a statement's text
pub fn command_keyword(sql: &str) -> String {
    let words: Vec<String> = sql
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .take(8)
        .map(|w| w.to_ascii_uppercase())
        .collect();

    let Some(first) = words.first() else {
        return String::new();
    };

    match first.as_str() {
        "CREATE" | "ALTER" | "DROP" => {
            let mut rest = words[1..].iter().filter(|w| {
                !matches!(
                    w.as_str(),
                    "OR" | "REPLACE" | "TEMP" | "TEMPORARY" | "UNIQUE" | "UNLOGGED" | "GLOBAL"
                        | "LOCAL" | "RECURSIVE"
                )
            });
            match rest.next() {
                Some(object) if matches!(object.as_str(), "MATERIALIZED" | "FOREIGN" | "USER") => {
                    match rest.next() {
                        Some(kind) => format!("{} {} {}", first, object, kind),
                        None => format!("{} {}", first, object),
                    }
                }
                Some(object) => format!("{} {}", first, object),
                None => first.clone(),
            }
        }
        "WITH" | "VALUES" | "TABLE" => "SELECT".to_string(),
        "START" => "START TRANSACTION".to_string(),
        "TRUNCATE" => "TRUNCATE TABLE".to_string(),
        "END" => "COMMIT".to_string(),
        "ABORT" => "ROLLBACK".to_string(),
        other => other.to_string(),
    }
}
