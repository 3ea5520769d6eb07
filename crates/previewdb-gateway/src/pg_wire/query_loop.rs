//! Main query processing loop
//!
//! Simple Query messages run straight through the client's session. Extended
//! Query messages go to [`ExtendedState`]; after an error they are skipped
//! until the next Sync. ReadyForQuery reports the session's transaction state.

use super::extended::{ExtendedState, MessageResult};
use super::messages::{
    send_classified_error, send_command_complete, send_data_row, send_empty_query_response,
    send_ready_for_query, send_row_description, transaction_status,
};
use crate::backend::{ColumnMeta, TextRow};
use crate::errors::{sqlstate, ClassifiedError, ErrorCategory};
use crate::router::{QueryRouter, ResultSink, Session};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Upper bound on a single frontend message
const MAX_MESSAGE_LEN: usize = 1 << 30;

/// Run the main query loop until Terminate or disconnect
pub(crate) async fn run_query_loop<S>(
    socket: &mut S,
    router: &QueryRouter,
    flush_every_rows: usize,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut session = router.session();
    let result = serve(socket, &mut session, flush_every_rows).await;
    session.close().await;
    result
}

async fn serve<S>(
    socket: &mut S,
    session: &mut Session<'_>,
    flush_every_rows: usize,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut extended = ExtendedState::default();
    let mut ignore_till_sync = false;

    loop {
        let mut msg_type = [0u8; 1];
        if socket.read_exact(&mut msg_type).await.is_err() {
            debug!("Client disconnected");
            break;
        }
        let body = read_message_body(socket).await?;

        if ignore_till_sync && !matches!(msg_type[0], b'S' | b'X') {
            debug!("Skip-till-sync: Skipped message type '{}'", msg_type[0] as char);
            continue;
        }

        match msg_type[0] {
            b'X' => {
                debug!("Client sent Terminate message");
                break;
            }
            b'Q' => {
                let query = String::from_utf8_lossy(&body)
                    .trim_end_matches('\0')
                    .to_string();
                debug!("Received query: {}", truncate(&query, 100));

                if query.trim().trim_matches(';').trim().is_empty() {
                    send_empty_query_response(socket).await?;
                } else {
                    let mut sink = WireSink::new(&mut *socket, flush_every_rows);
                    session.handle(&query, &mut sink).await?;
                }

                send_ready_for_query(socket, transaction_status(session.transaction_state())).await?;
                socket.flush().await?;
            }
            b'S' => {
                ignore_till_sync = false;
                send_ready_for_query(socket, transaction_status(session.transaction_state())).await?;
                socket.flush().await?;
            }
            b'H' => socket.flush().await?,
            kind @ (b'P' | b'B' | b'D' | b'E' | b'C' | b'F') => {
                match extended
                    .handle(kind, &body, session, &mut *socket, flush_every_rows)
                    .await?
                {
                    MessageResult::Done => {}
                    MessageResult::Error(err) => {
                        debug!(message = %(kind as char), "Extended query error: {}", err);
                        send_classified_error(socket, &err).await?;
                        ignore_till_sync = true;
                    }
                    MessageResult::ErrorSent => ignore_till_sync = true,
                }
            }
            // Stray COPY sub-protocol messages
            b'd' | b'c' | b'f' => {
                debug!("Ignoring COPY message '{}'", msg_type[0] as char);
            }
            other => {
                let err = ClassifiedError::new(
                    sqlstate::PROTOCOL_VIOLATION,
                    ErrorCategory::Connection,
                    format!("invalid frontend message type {}", other),
                );
                send_classified_error(socket, &err).await?;
                socket.flush().await?;
                return Err(anyhow::anyhow!("invalid frontend message type {}", other));
            }
        }
    }

    Ok(())
}

async fn read_message_body<S>(socket: &mut S) -> anyhow::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4];
    socket.read_exact(&mut buf).await?;
    let len = (u32::from_be_bytes(buf) as usize)
        .checked_sub(4)
        .filter(|len| *len <= MAX_MESSAGE_LEN)
        .ok_or_else(|| anyhow::anyhow!("Invalid message length: {}", u32::from_be_bytes(buf)))?;

    let mut body = vec![0u8; len];
    socket.read_exact(&mut body).await?;
    Ok(body)
}

pub(super) fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Writes routed results to the client socket
pub(super) struct WireSink<'a, S> {
    socket: &'a mut S,
    flush_every_rows: usize,
    rows_since_flush: usize,
    send_descriptions: bool,
}

impl<'a, S> WireSink<'a, S> {
    pub(super) fn new(socket: &'a mut S, flush_every_rows: usize) -> Self {
        Self {
            socket,
            flush_every_rows: flush_every_rows.max(1),
            rows_since_flush: 0,
            send_descriptions: true,
        }
    }

    /// Sink for Execute, where RowDescription was already sent by Describe
    pub(super) fn without_descriptions(socket: &'a mut S, flush_every_rows: usize) -> Self {
        Self {
            send_descriptions: false,
            ..Self::new(socket, flush_every_rows)
        }
    }
}

#[async_trait]
impl<'a, S> ResultSink for WireSink<'a, S>
where
    S: AsyncWrite + Unpin + Send,
{
    async fn describe(&mut self, columns: &[ColumnMeta]) -> anyhow::Result<()> {
        if !self.send_descriptions {
            return Ok(());
        }
        send_row_description(&mut *self.socket, columns).await
    }

    async fn row(&mut self, row: &TextRow) -> anyhow::Result<()> {
        send_data_row(&mut *self.socket, row).await?;
        self.rows_since_flush += 1;
        if self.rows_since_flush >= self.flush_every_rows {
            self.socket.flush().await?;
            self.rows_since_flush = 0;
        }
        Ok(())
    }

    async fn complete(&mut self, tag: &str) -> anyhow::Result<()> {
        send_command_complete(&mut *self.socket, tag).await
    }

    async fn error(&mut self, error: &ClassifiedError) -> anyhow::Result<()> {
        send_classified_error(&mut *self.socket, error).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{columns, row, FakeBackend, Script};
    use crate::backend::{BackendRole, StatementDescription};
    use crate::federation::{FederationCatalog, SharedCatalog};
    use previewdb_common::ProxyConfig;
    use std::sync::Arc;

    fn frame(kind: u8, body: &[u8]) -> Vec<u8> {
        let mut msg = vec![kind];
        msg.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
        msg.extend_from_slice(body);
        msg
    }

    fn router(fresh: FakeBackend) -> QueryRouter {
        QueryRouter::new(
            Arc::new(FakeBackend::new(BackendRole::Production)),
            Arc::new(fresh),
            Arc::new(SharedCatalog::new(FederationCatalog::empty())),
            Arc::new(ProxyConfig::default()),
        )
    }

    /// Message type bytes in the server's reply stream
    fn message_types(mut out: &[u8]) -> Vec<u8> {
        let mut types = Vec::new();
        while out.len() >= 5 {
            let len = u32::from_be_bytes([out[1], out[2], out[3], out[4]]) as usize;
            types.push(out[0]);
            out = &out[1 + len..];
        }
        types
    }

    async fn run(router: &QueryRouter, input: Vec<u8>) -> Vec<u8> {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        client.write_all(&input).await.unwrap();
        client.write_all(&frame(b'X', &[])).await.unwrap();

        run_query_loop(&mut server, router, 100).await.unwrap();
        drop(server);

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_simple_query_round_trip() {
        let fresh = FakeBackend::new(BackendRole::Fresh);
        fresh.script(
            "SELECT 1 AS one",
            Script::Rows {
                columns: vec![("one", "INT4")],
                rows: vec![row(&["1"])],
            },
        );
        let router = router(fresh);

        let out = run(&router, frame(b'Q', b"SELECT 1 AS one\0")).await;
        assert_eq!(message_types(&out), vec![b'T', b'D', b'C', b'Z']);
        assert_eq!(&out[out.len() - 6..], &[b'Z', 0, 0, 0, 5, b'I']);
    }

    #[tokio::test]
    async fn test_empty_query() {
        let router = router(FakeBackend::new(BackendRole::Fresh));
        let out = run(&router, frame(b'Q', b" ;\0")).await;
        assert_eq!(message_types(&out), vec![b'I', b'Z']);
    }

    #[tokio::test]
    async fn test_transaction_status_tracking() {
        let fresh = FakeBackend::new(BackendRole::Fresh);
        fresh.script(
            "INSERT INTO t VALUES (1)",
            Script::Fail {
                code: "23505",
                message: "duplicate key",
            },
        );
        let router = router(fresh);

        let mut input = frame(b'Q', b"BEGIN\0");
        input.extend(frame(b'Q', b"INSERT INTO t VALUES (1)\0"));
        input.extend(frame(b'Q', b"ROLLBACK\0"));
        let out = run(&router, input).await;

        let statuses: Vec<u8> = out
            .windows(6)
            .filter(|w| w[..5] == [b'Z', 0, 0, 0, 5])
            .map(|w| w[5])
            .collect();
        assert_eq!(statuses, vec![b'T', b'E', b'I']);
    }

    fn statuses(out: &[u8]) -> Vec<u8> {
        out.windows(6)
            .filter(|w| w[..5] == [b'Z', 0, 0, 0, 5])
            .map(|w| w[5])
            .collect()
    }

    fn parse(name: &str, sql: &str) -> Vec<u8> {
        let mut body = format!("{}\0{}\0", name, sql).into_bytes();
        body.extend_from_slice(&0i16.to_be_bytes());
        frame(b'P', &body)
    }

    /// Bind text values (None is NULL) with text results
    fn bind(portal: &str, statement: &str, values: &[Option<&str>], result_format: i16) -> Vec<u8> {
        let mut body = format!("{}\0{}\0", portal, statement).into_bytes();
        body.extend_from_slice(&0i16.to_be_bytes());
        body.extend_from_slice(&(values.len() as i16).to_be_bytes());
        for value in values {
            match value {
                Some(v) => {
                    body.extend_from_slice(&(v.len() as i32).to_be_bytes());
                    body.extend_from_slice(v.as_bytes());
                }
                None => body.extend_from_slice(&(-1i32).to_be_bytes()),
            }
        }
        body.extend_from_slice(&1i16.to_be_bytes());
        body.extend_from_slice(&result_format.to_be_bytes());
        frame(b'B', &body)
    }

    fn execute(portal: &str) -> Vec<u8> {
        let mut body = format!("{}\0", portal).into_bytes();
        body.extend_from_slice(&0i32.to_be_bytes());
        frame(b'E', &body)
    }

    fn describe(kind: u8, name: &str) -> Vec<u8> {
        let mut body = vec![kind];
        body.extend_from_slice(name.as_bytes());
        body.push(0);
        frame(b'D', &body)
    }

    #[tokio::test]
    async fn test_extended_query_flow() {
        let fresh = FakeBackend::new(BackendRole::Fresh);
        let bound = "SELECT name FROM users WHERE id = '7'";
        fresh.script_description(
            bound,
            StatementDescription {
                parameters: vec![],
                columns: columns(&[("name", "TEXT")]),
            },
        );
        fresh.script(
            bound,
            Script::Rows {
                columns: vec![("name", "TEXT")],
                rows: vec![row(&["ada"])],
            },
        );
        let router = router(fresh);

        let mut input = parse("", "SELECT name FROM users WHERE id = $1");
        input.extend(bind("", "", &[Some("7")], 0));
        input.extend(describe(b'P', ""));
        input.extend(execute(""));
        input.extend(frame(b'S', &[]));

        let out = run(&router, input).await;
        // RowDescription comes from Describe only, not again from Execute
        assert_eq!(message_types(&out), vec![b'1', b'2', b'T', b'D', b'C', b'Z']);
        assert_eq!(statuses(&out), vec![b'I']);
    }

    #[tokio::test]
    async fn test_describe_statement_reports_parameter_types() {
        let fresh = FakeBackend::new(BackendRole::Fresh);
        let sql = "SELECT name FROM users WHERE id = $1";
        fresh.script_description(
            sql,
            StatementDescription {
                parameters: vec!["INT4".to_string()],
                columns: columns(&[("name", "TEXT")]),
            },
        );
        let router = router(fresh);

        let mut input = parse("by_id", sql);
        input.extend(describe(b'S', "by_id"));
        input.extend(parse("", "SET search_path TO public"));
        input.extend(describe(b'S', ""));
        input.extend(frame(b'S', &[]));

        let out = run(&router, input).await;
        assert_eq!(
            message_types(&out),
            vec![b'1', b't', b'T', b'1', b't', b'n', b'Z']
        );
        let t = out.iter().position(|b| *b == b't').unwrap();
        assert_eq!(&out[t..t + 11], &[b't', 0, 0, 0, 10, 0, 1, 0, 0, 0, 23]);
    }

    #[tokio::test]
    async fn test_extended_error_skips_until_sync() {
        let router = router(FakeBackend::new(BackendRole::Fresh));
        let mut input = bind("", "missing", &[], 0);
        input.extend(describe(b'P', ""));
        input.extend(execute(""));
        input.extend(frame(b'S', &[]));
        input.extend(frame(b'Q', b"SELECT 2\0"));

        let out = run(&router, input).await;
        // One error for the whole batch, then ReadyForQuery, then the simple query
        assert_eq!(message_types(&out), vec![b'E', b'Z', b'T', b'C', b'Z']);
    }

    #[tokio::test]
    async fn test_execute_error_is_sent_once() {
        let fresh = FakeBackend::new(BackendRole::Fresh);
        fresh.script(
            "INSERT INTO t VALUES (1)",
            Script::Fail {
                code: "23505",
                message: "duplicate key",
            },
        );
        let router = router(fresh);

        let mut input = parse("", "INSERT INTO t VALUES ($1)");
        input.extend(bind("", "", &[Some("1")], 0));
        input.extend(execute(""));
        input.extend(execute(""));
        input.extend(frame(b'S', &[]));

        let out = run(&router, input).await;
        assert_eq!(message_types(&out), vec![b'1', b'2', b'E', b'Z']);
    }

    #[tokio::test]
    async fn test_binary_results_rejected() {
        let router = router(FakeBackend::new(BackendRole::Fresh));
        let mut input = parse("", "SELECT 1");
        input.extend(bind("", "", &[], 1));
        input.extend(frame(b'S', &[]));

        let out = run(&router, input).await;
        assert_eq!(message_types(&out), vec![b'1', b'E', b'Z']);
        assert!(out.windows(5).any(|w| w == b"0A000"));
    }

    #[tokio::test]
    async fn test_extended_begin_reports_open_block() {
        let fresh = FakeBackend::new(BackendRole::Fresh);
        let router = router(fresh);

        let mut input = parse("", "BEGIN");
        input.extend(bind("", "", &[], 0));
        input.extend(execute(""));
        input.extend(frame(b'S', &[]));
        input.extend(frame(b'Q', b"COMMIT\0"));

        let out = run(&router, input).await;
        assert_eq!(message_types(&out), vec![b'1', b'2', b'C', b'Z', b'C', b'Z']);
        assert_eq!(statuses(&out), vec![b'T', b'I']);
    }

    #[tokio::test]
    async fn test_open_block_is_discarded_on_disconnect() {
        let fresh = Arc::new(FakeBackend::new(BackendRole::Fresh));
        let router = QueryRouter::new(
            Arc::new(FakeBackend::new(BackendRole::Production)),
            fresh.clone(),
            Arc::new(SharedCatalog::new(FederationCatalog::empty())),
            Arc::new(ProxyConfig::default()),
        );

        let out = run(&router, frame(b'Q', b"BEGIN\0")).await;
        assert_eq!(statuses(&out), vec![b'T']);
        assert_eq!(fresh.pinned_count(), 1);
        assert_eq!(fresh.closed_count(), 1);
    }
}
