//! Query Router - per-query routing between the fresh and production stores
//!
//! - Writes, DDL, transaction control and unparseable input go to fresh as-is
//! - Reads of federated tables are rewritten to union fresh and production rows
//! - Other reads probe fresh and fall back to production once if fresh errors
//!
//! Exactly one backend produces the client-visible result. Nothing reaches the
//! sink until that backend is selected.
//!
//! A [`Session`] carries per-client state. Once a client opens a transaction
//! or changes session settings, its session pins a fresh connection and every
//! later statement runs there until the block ends.

use crate::backend::{
    command_tag, returns_rows, Backend, BackendError, BackendEvent, BackendRole, BackendStream,
    ColumnMeta, PinnedConnection, StatementDescription, TextRow, TransactionState,
};
use crate::classifier::{classify, Classification, StatementCategory};
use crate::errors::{self, ClassifiedError};
use crate::federation::{self, BootstrapError, Rewrite, RewriteError, SharedCatalog};
use crate::metrics;
use async_trait::async_trait;
use futures::StreamExt;
use previewdb_common::{ProxyConfig, UnsupportedClausePolicy};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Receives the result of one client query
///
/// Implemented by the wire server; errors are I/O failures towards the client.
#[async_trait]
pub trait ResultSink: Send {
    /// Columns of the row set that follows (empty for a zero-row read)
    async fn describe(&mut self, columns: &[ColumnMeta]) -> anyhow::Result<()>;

    async fn row(&mut self, row: &TextRow) -> anyhow::Result<()>;

    /// One statement finished with this command tag
    async fn complete(&mut self, tag: &str) -> anyhow::Result<()>;

    /// The query failed; no further events follow
    async fn error(&mut self, error: &ClassifiedError) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Execute on the target, surface its errors
    Direct,
    /// Execute on fresh; on an error before any result, re-run on production
    ProbeThenFallback,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Direct => write!(f, "direct"),
            Strategy::ProbeThenFallback => write!(f, "probe"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub target: BackendRole,
    pub query: String,
    pub rewritten: bool,
    pub strategy: Strategy,
}

impl RoutingDecision {
    fn fresh(query: &str, strategy: Strategy) -> Self {
        Self {
            target: BackendRole::Fresh,
            query: query.to_string(),
            rewritten: false,
            strategy,
        }
    }
}

/// How a routed query ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    /// Every statement completed on this backend
    Completed(BackendRole),
    /// An error was sent to the client
    Failed,
}

pub struct QueryRouter {
    production: Arc<dyn Backend>,
    fresh: Arc<dyn Backend>,
    catalog: Arc<SharedCatalog>,
    config: Arc<ProxyConfig>,
    /// Serializes catalog rebuilds
    refresh: tokio::sync::Mutex<()>,
}

impl QueryRouter {
    pub fn new(
        production: Arc<dyn Backend>,
        fresh: Arc<dyn Backend>,
        catalog: Arc<SharedCatalog>,
        config: Arc<ProxyConfig>,
    ) -> Self {
        Self {
            production,
            fresh,
            catalog,
            config,
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    pub fn catalog(&self) -> &SharedCatalog {
        &self.catalog
    }

    pub fn federation_enabled(&self) -> bool {
        self.config.federation.enabled
    }

    pub fn backend(&self, role: BackendRole) -> &dyn Backend {
        match role {
            BackendRole::Production => self.production.as_ref(),
            BackendRole::Fresh => self.fresh.as_ref(),
        }
    }

    /// State for one client connection
    pub fn session(&self) -> Session<'_> {
        Session {
            router: self,
            pinned: None,
            sticky: false,
            state: TransactionState::Idle,
        }
    }

    /// Pick the backend, the final query text and the execution strategy
    ///
    /// Fails only when federation rejects the query under the reject policy.
    pub fn decide(
        &self,
        sql: &str,
        classification: &Classification,
    ) -> Result<RoutingDecision, ClassifiedError> {
        if classification.category != StatementCategory::Read {
            if let Some(parse_error) = &classification.parse_error {
                debug!(error = %parse_error, "Unparsed query, sending to fresh unmodified");
            }
            return Ok(RoutingDecision::fresh(sql, Strategy::Direct));
        }

        let catalog = self.catalog.load();
        match federation::rewrite(&classification.statements, &catalog) {
            Ok(Rewrite::Applied(query)) => {
                metrics::record_rewrite("applied");
                Ok(RoutingDecision {
                    target: BackendRole::Fresh,
                    query,
                    rewritten: true,
                    strategy: Strategy::Direct,
                })
            }
            Ok(Rewrite::NotApplicable) => {
                metrics::record_rewrite("not_applicable");
                Ok(RoutingDecision::fresh(sql, Strategy::ProbeThenFallback))
            }
            Err(err @ RewriteError::UnsupportedClause { .. }) => {
                match self.config.federation.unsupported_clause_policy {
                    UnsupportedClausePolicy::Reject => {
                        metrics::record_rewrite("rejected");
                        Err(errors::unsupported_federation(&err))
                    }
                    UnsupportedClausePolicy::Passthrough => {
                        metrics::record_rewrite("passthrough");
                        warn!(error = %err, "Federated read not rewritable, probing with original query");
                        Ok(RoutingDecision::fresh(sql, Strategy::ProbeThenFallback))
                    }
                }
            }
            Err(err) => {
                metrics::record_rewrite("error");
                warn!(error = %err, "Rewrite failed, probing with original query");
                Ok(RoutingDecision::fresh(sql, Strategy::ProbeThenFallback))
            }
        }
    }

    /// Route one query outside any client session and stream its result
    /// into `sink`; a connection pinned along the way is released after it
    ///
    /// Returns `Err` only when the sink itself fails.
    pub async fn handle(&self, sql: &str, sink: &mut dyn ResultSink) -> anyhow::Result<QueryOutcome> {
        let mut session = self.session();
        let outcome = session.handle(sql, sink).await;
        session.close().await;
        outcome
    }

    /// Pooled execution, no session state involved
    async fn route(
        &self,
        sql: &str,
        classification: &Classification,
        sink: &mut dyn ResultSink,
    ) -> anyhow::Result<QueryOutcome> {
        // Each statement of a multi-statement read gets its own fallback, so
        // one statement missing on fresh never replays the others on production
        if classification.category == StatementCategory::Read && classification.statements.len() > 1 {
            let mut outcome = QueryOutcome::Completed(BackendRole::Fresh);
            for statement in &classification.statements {
                let sql = statement.to_string();
                outcome = self.route_one(&sql, &classify(&sql), sink).await?;
                if outcome == QueryOutcome::Failed {
                    break;
                }
            }
            return Ok(outcome);
        }

        self.route_one(sql, classification, sink).await
    }

    async fn route_one(
        &self,
        sql: &str,
        classification: &Classification,
        sink: &mut dyn ResultSink,
    ) -> anyhow::Result<QueryOutcome> {
        let start = Instant::now();
        let Some(decision) = self.decide_or_reject(sql, classification, sink).await? else {
            return Ok(QueryOutcome::Failed);
        };
        self.log_decision(&decision, classification, false);

        let result = self
            .bounded(self.execute(&decision, classification, &mut *sink))
            .await;
        let outcome = match result {
            Some(result) => result?,
            None => self.report_timeout(sink).await?,
        };

        self.record_completion(&decision, outcome, start);
        Ok(outcome)
    }

    /// The routing decision, or `None` after sending the rejection to the client
    async fn decide_or_reject(
        &self,
        sql: &str,
        classification: &Classification,
        sink: &mut dyn ResultSink,
    ) -> anyhow::Result<Option<RoutingDecision>> {
        match self.decide(sql, classification) {
            Ok(decision) => Ok(Some(decision)),
            Err(err) => {
                info!(category = %classification.category, "Query rejected: {}", err.message);
                metrics::record_client_error(&err.category.to_string());
                sink.error(&err).await?;
                Ok(None)
            }
        }
    }

    fn log_decision(&self, decision: &RoutingDecision, classification: &Classification, pinned: bool) {
        metrics::record_query_routed(decision.target.as_str(), classification.category.as_str());
        info!(
            category = %classification.category,
            target = %decision.target,
            rewritten = decision.rewritten,
            strategy = %decision.strategy,
            pinned,
            "Query routed"
        );
        if decision.rewritten {
            debug!(query = %decision.query, "Rewritten query");
        }
    }

    fn record_completion(&self, decision: &RoutingDecision, outcome: QueryOutcome, start: Instant) {
        let (target, status) = match outcome {
            QueryOutcome::Completed(role) => (role.as_str(), "success"),
            QueryOutcome::Failed => (decision.target.as_str(), "error"),
        };
        metrics::record_query_completed(target, status, start.elapsed().as_secs_f64());
    }

    /// Run `work` under the query timeout; `None` when it expired
    async fn bounded<F>(&self, work: F) -> Option<anyhow::Result<QueryOutcome>>
    where
        F: Future<Output = anyhow::Result<QueryOutcome>>,
    {
        match self.config.limits.query_timeout() {
            Some(limit) => tokio::time::timeout(limit, work).await.ok(),
            None => Some(work.await),
        }
    }

    async fn report_timeout(&self, sink: &mut dyn ResultSink) -> anyhow::Result<QueryOutcome> {
        let secs = self
            .config
            .limits
            .query_timeout()
            .map(|limit| limit.as_secs())
            .unwrap_or_default();
        let err = errors::query_timeout(secs);
        warn!(timeout_secs = secs, "Query timed out");
        metrics::record_client_error(&err.category.to_string());
        sink.error(&err).await?;
        Ok(QueryOutcome::Failed)
    }

    async fn execute(
        &self,
        decision: &RoutingDecision,
        classification: &Classification,
        sink: &mut dyn ResultSink,
    ) -> anyhow::Result<QueryOutcome> {
        let primary = self.backend(decision.target);
        let mut stream = primary.query(&decision.query);
        let mut first = stream.next().await;
        let mut backend = primary;

        if decision.strategy == Strategy::ProbeThenFallback {
            if let Some(Err(err)) = &first {
                warn!(
                    probe = %primary.role(),
                    sqlstate = err.code().unwrap_or(""),
                    error = %err,
                    "Probe failed, falling back to production"
                );
                metrics::record_probe_fallback(err.code().unwrap_or("none"));
                drop(stream);

                backend = self.production.as_ref();
                stream = backend.query(&decision.query);
                first = stream.next().await;
            }
        }

        stream_results(backend.role(), first, stream, classification, sink).await
    }

    /// Statement metadata for the extended protocol: fresh first, production
    /// when fresh cannot describe it
    async fn describe_pooled(&self, sql: &str) -> Result<StatementDescription, BackendError> {
        match self.fresh.describe(sql).await {
            Ok(description) => Ok(description),
            Err(err) => {
                debug!(error = %err, "Fresh could not describe statement, asking production");
                self.production.describe(sql).await
            }
        }
    }

    /// Rerun the federation bootstrap and swap the catalog on success
    ///
    /// A failed run leaves the current catalog in place.
    pub async fn refresh_federation(&self) -> Result<usize, BootstrapError> {
        let _guard = self.refresh.lock().await;

        match federation::bootstrap(self.production.as_ref(), self.fresh.as_ref(), &self.config).await {
            Ok(catalog) => {
                let tables = catalog.len();
                self.catalog.swap(catalog);
                metrics::record_bootstrap(true, tables);
                Ok(tables)
            }
            Err(err) => {
                error!(error = %err, "Federation bootstrap failed, keeping current catalog");
                metrics::record_bootstrap(false, 0);
                Err(err)
            }
        }
    }
}

/// Per-client routing state
///
/// Unpinned, every query is routed on its own over the pools. A query that
/// opens a transaction or changes session settings pins a fresh connection;
/// from then on every statement runs there, directly, until the block ends
/// and no session settings are held. The transaction state reported to the
/// client is read back from that connection after each query.
pub struct Session<'r> {
    router: &'r QueryRouter,
    pinned: Option<Box<dyn PinnedConnection>>,
    /// Settings or other session state live on the pinned connection
    sticky: bool,
    state: TransactionState,
}

impl<'r> Session<'r> {
    pub fn transaction_state(&self) -> TransactionState {
        self.state
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.is_some()
    }

    /// Route one client query and stream its result into `sink`
    ///
    /// Returns `Err` only when the sink itself fails.
    pub async fn handle(&mut self, sql: &str, sink: &mut dyn ResultSink) -> anyhow::Result<QueryOutcome> {
        let classification = classify(sql);

        if let Some(conn) = self.pinned.take() {
            return self.handle_pinned(conn, sql, &classification, sink).await;
        }

        if self.state == TransactionState::Failed {
            return self.handle_orphaned(&classification, sink).await;
        }

        if classification.needs_pinned_connection() {
            match self.router.fresh.pin().await {
                Ok(conn) => {
                    debug!("Pinned fresh connection for session state");
                    metrics::record_session_pinned();
                    return self.handle_pinned(conn, sql, &classification, sink).await;
                }
                Err(err) => {
                    let classified = errors::classify_backend_error(&err);
                    warn!(error = %err, "Could not pin a fresh connection");
                    metrics::record_client_error(&classified.category.to_string());
                    sink.error(&classified).await?;
                    return Ok(QueryOutcome::Failed);
                }
            }
        }

        self.router.route(sql, &classification, sink).await
    }

    async fn handle_pinned(
        &mut self,
        mut conn: Box<dyn PinnedConnection>,
        sql: &str,
        classification: &Classification,
        sink: &mut dyn ResultSink,
    ) -> anyhow::Result<QueryOutcome> {
        let router = self.router;
        let start = Instant::now();
        let open_before = self.state != TransactionState::Idle || classification.begins_transaction();
        if classification.changes_session() {
            self.sticky = true;
        }

        let decision = match router.decide_or_reject(sql, classification, sink).await {
            Ok(Some(decision)) => RoutingDecision {
                strategy: Strategy::Direct,
                ..decision
            },
            Ok(None) => {
                self.pinned = Some(conn);
                return Ok(QueryOutcome::Failed);
            }
            Err(e) => {
                self.pinned = Some(conn);
                return Err(e);
            }
        };
        router.log_decision(&decision, classification, true);

        let work = async {
            let mut stream = conn.query(&decision.query);
            let first = stream.next().await;
            stream_results(BackendRole::Fresh, first, stream, classification, &mut *sink).await
        };

        let result = router.bounded(work).await;
        match result {
            Some(Ok(outcome)) => {
                router.record_completion(&decision, outcome, start);
                self.settle(conn, open_before).await;
                Ok(outcome)
            }
            Some(Err(e)) => {
                self.pinned = Some(conn);
                Err(e)
            }
            None => {
                // The statement may still be running; the connection cannot be reused
                conn.close().await;
                self.drop_pinned_state(open_before);
                let outcome = router.report_timeout(sink).await?;
                router.record_completion(&decision, outcome, start);
                Ok(outcome)
            }
        }
    }

    /// Read the connection's transaction state and keep or release it
    async fn settle(&mut self, mut conn: Box<dyn PinnedConnection>, open_before: bool) {
        match conn.transaction_status().await {
            Ok(state) => {
                self.state = state;
                if state == TransactionState::Idle && !self.sticky {
                    debug!("Transaction block ended, releasing pinned connection");
                } else {
                    self.pinned = Some(conn);
                }
            }
            Err(err) => {
                warn!(error = %err, "Lost pinned connection");
                conn.close().await;
                self.drop_pinned_state(open_before);
            }
        }
    }

    /// The pinned connection is gone. An open block stays failed for the
    /// client until it ends it.
    fn drop_pinned_state(&mut self, open_before: bool) {
        if self.sticky {
            warn!("Session settings lost with the pinned connection");
        }
        self.sticky = false;
        self.state = if open_before {
            TransactionState::Failed
        } else {
            TransactionState::Idle
        };
    }

    /// The block's connection is gone: only ending the block succeeds
    async fn handle_orphaned(
        &mut self,
        classification: &Classification,
        sink: &mut dyn ResultSink,
    ) -> anyhow::Result<QueryOutcome> {
        if classification.ends_transaction() {
            self.state = TransactionState::Idle;
            sink.complete("ROLLBACK").await?;
            return Ok(QueryOutcome::Completed(BackendRole::Fresh));
        }

        let err = errors::transaction_aborted();
        metrics::record_client_error(&err.category.to_string());
        sink.error(&err).await?;
        Ok(QueryOutcome::Failed)
    }

    /// Parameter and result metadata of one statement, without running it
    pub async fn describe(&mut self, sql: &str) -> Result<StatementDescription, ClassifiedError> {
        let classification = classify(sql);
        if classification.is_empty_query() || classification.category == StatementCategory::Transaction {
            return Ok(StatementDescription::default());
        }

        if let Some(conn) = self.pinned.as_mut() {
            return conn
                .describe(sql)
                .await
                .map_err(|e| errors::classify_backend_error(&e));
        }
        if self.state == TransactionState::Failed {
            return Err(errors::transaction_aborted());
        }

        self.router
            .describe_pooled(sql)
            .await
            .map_err(|e| errors::classify_backend_error(&e))
    }

    /// End the session; a connection still pinned carries client state and
    /// is discarded rather than returned to the pool
    pub async fn close(mut self) {
        if let Some(conn) = self.pinned.take() {
            debug!(state = ?self.state, "Discarding pinned connection at session end");
            conn.close().await;
        }
    }
}

/// Forward backend events to the sink, building command tags per statement
async fn stream_results(
    role: BackendRole,
    first: Option<Result<BackendEvent, BackendError>>,
    mut stream: BackendStream<'_>,
    classification: &Classification,
    sink: &mut dyn ResultSink,
) -> anyhow::Result<QueryOutcome> {
    let mut statement = 0;
    let mut described = false;
    let mut next = first;

    while let Some(event) = next {
        match event {
            Ok(BackendEvent::Describe(columns)) => {
                sink.describe(&columns).await?;
                described = true;
            }
            Ok(BackendEvent::Row(row)) => sink.row(&row).await?,
            Ok(BackendEvent::Complete { rows_affected }) => {
                let keyword = classification.command_keyword(statement);
                if returns_rows(keyword) && !described {
                    sink.describe(&[]).await?;
                }
                sink.complete(&command_tag(keyword, rows_affected)).await?;
                statement += 1;
                described = false;
            }
            Err(err) => {
                let classified = errors::classify_backend_error(&err);
                warn!(
                    backend = %role,
                    sqlstate = %classified.sqlstate,
                    "Query failed: {}",
                    classified.message
                );
                metrics::record_client_error(&classified.category.to_string());
                sink.error(&classified).await?;
                return Ok(QueryOutcome::Failed);
            }
        }
        next = stream.next().await;
    }

    Ok(QueryOutcome::Completed(role))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum SinkEvent {
        Describe(Vec<String>),
        Row(TextRow),
        Complete(String),
        Error { sqlstate: String, message: String },
    }

    /// Sink that records everything it receives
    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Vec<SinkEvent>,
    }

    impl RecordingSink {
        pub fn rows(&self) -> Vec<TextRow> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    SinkEvent::Row(r) => Some(r.clone()),
                    _ => None,
                })
                .collect()
        }

        pub fn error(&self) -> Option<(&str, &str)> {
            self.events.iter().find_map(|e| match e {
                SinkEvent::Error { sqlstate, message } => Some((sqlstate.as_str(), message.as_str())),
                _ => None,
            })
        }
    }

    #[async_trait]
    impl ResultSink for RecordingSink {
        async fn describe(&mut self, columns: &[ColumnMeta]) -> anyhow::Result<()> {
            self.events
                .push(SinkEvent::Describe(columns.iter().map(|c| c.name.clone()).collect()));
            Ok(())
        }

        async fn row(&mut self, row: &TextRow) -> anyhow::Result<()> {
            self.events.push(SinkEvent::Row(row.clone()));
            Ok(())
        }

        async fn complete(&mut self, tag: &str) -> anyhow::Result<()> {
            self.events.push(SinkEvent::Complete(tag.to_string()));
            Ok(())
        }

        async fn error(&mut self, error: &ClassifiedError) -> anyhow::Result<()> {
            self.events.push(SinkEvent::Error {
                sqlstate: error.sqlstate.to_string(),
                message: error.message.clone(),
            });
            Ok(())
        }
    }
}
