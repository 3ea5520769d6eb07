//! PostgreSQL wire protocol listener
//!
//! One tokio task per client. Concurrent clients are capped by a semaphore;
//! clients over the cap receive `53300 too_many_connections` and are closed.
//! Accept errors never stop the listener.

use super::connection::{configure_tcp_keepalive, handle_connection};
use super::messages::send_classified_error;
use crate::errors;
use crate::metrics;
use crate::router::QueryRouter;
use previewdb_common::LimitsConfig;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufStream};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

pub struct PgWireServer {
    addr: String,
    router: Arc<QueryRouter>,
    limits: Arc<LimitsConfig>,
    connections: Arc<Semaphore>,
}

impl PgWireServer {
    pub fn new(addr: impl Into<String>, router: Arc<QueryRouter>, limits: LimitsConfig) -> Self {
        let connections = Arc::new(Semaphore::new(limits.max_connections));
        Self {
            addr: addr.into(),
            router,
            limits: Arc::new(limits),
            connections,
        }
    }

    /// Bind the listen address; failure here is fatal for the process
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .map_err(|e| anyhow::anyhow!("failed to bind {}: {}", self.addr, e))?;
        info!(
            "PostgreSQL wire protocol server listening on {} (max {} connections)",
            self.addr, self.limits.max_connections
        );
        Ok(listener)
    }

    /// Accept clients forever
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (socket, peer_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    let backoff = accept_backoff(&e);
                    warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "Accept error");
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            };
            debug!("New PostgreSQL connection from {}", peer_addr);

            configure_tcp_keepalive(&socket, self.limits.tcp_keepalive_secs);

            let Ok(permit) = self.connections.clone().try_acquire_owned() else {
                warn!(peer = %peer_addr, "Connection limit reached, rejecting client");
                let limit = self.limits.max_connections;
                tokio::spawn(async move {
                    let mut socket = socket;
                    let err = errors::too_many_connections(limit);
                    if send_classified_error(&mut socket, &err).await.is_ok() {
                        let _ = socket.shutdown().await;
                    }
                });
                continue;
            };

            let router = self.router.clone();
            let limits = self.limits.clone();

            tokio::spawn(async move {
                let _permit = permit;
                metrics::connection_opened();

                let mut stream = BufStream::new(socket);
                let result = handle_connection(&mut stream, &router, &limits).await;
                metrics::connection_closed();

                if let Err(e) = result {
                    let err_str = e.to_string();
                    if err_str.contains("early eof") || err_str.contains("connection reset") {
                        debug!("Client disconnected: {}", err_str);
                    } else {
                        error!("Error handling PostgreSQL connection from {}: {}", peer_addr, e);
                    }
                }
            });
        }
    }
}

/// Pause before the next accept; running out of descriptors or memory
/// would otherwise spin the loop
fn accept_backoff(err: &io::Error) -> Duration {
    // EMFILE, ENFILE, ENOBUFS, ENOMEM
    match err.raw_os_error() {
        Some(23 | 24 | 105 | 12) => Duration::from_secs(1),
        _ if err.kind() == io::ErrorKind::OutOfMemory => Duration::from_secs(1),
        _ => Duration::from_millis(10),
    }
}
