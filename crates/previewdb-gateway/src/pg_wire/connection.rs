//! Connection handling for PostgreSQL wire protocol
//!
//! SSL/GSSAPI negotiation (always declined), startup message processing,
//! cleartext password passthrough and TCP keepalive configuration.

use super::messages::{
    send_auth_cleartext_request, send_auth_ok, send_backend_key_data, send_parameter_status,
    send_ready_for_query, TRANSACTION_STATUS_IDLE,
};
use super::query_loop::run_query_loop;
use crate::router::QueryRouter;
use previewdb_common::LimitsConfig;
use socket2::SockRef;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

const SSL_REQUEST_CODE: u32 = 80877103;
const GSSENC_REQUEST_CODE: u32 = 80877104;
const CANCEL_REQUEST_CODE: u32 = 80877102;

/// Configure TCP keepalive on a socket for faster dead connection detection
pub fn configure_tcp_keepalive(stream: &tokio::net::TcpStream, keepalive_secs: u64) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    let socket = SockRef::from(stream);

    if let Err(e) = socket.set_keepalive(true) {
        warn!("Failed to enable TCP keepalive: {}", e);
        return;
    }

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(keepalive_secs))
        .with_interval(Duration::from_secs(keepalive_secs / 2 + 1));

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    let keepalive = keepalive.with_retries(3);

    if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
        warn!("Failed to configure TCP keepalive timing: {}", e);
    } else {
        debug!("TCP keepalive configured: {}s", keepalive_secs);
    }
}

/// Serve one client from its first byte to Terminate or disconnect
pub(crate) async fn handle_connection<S>(
    socket: &mut S,
    router: &QueryRouter,
    limits: &LimitsConfig,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let Some(startup_msg) = read_startup_message(socket).await? else {
        return Ok(());
    };

    let user = extract_startup_param(&startup_msg, "user").unwrap_or_else(|| "anonymous".to_string());
    let database = extract_startup_param(&startup_msg, "database").unwrap_or_else(|| user.clone());
    info!(user = %user, database = %database, "PostgreSQL client connected");

    perform_auth(socket, &user).await?;

    send_parameter_status(socket, "server_version", "15.0.0").await?;
    send_parameter_status(socket, "client_encoding", "UTF8").await?;
    send_parameter_status(socket, "server_encoding", "UTF8").await?;
    send_parameter_status(socket, "DateStyle", "ISO, MDY").await?;
    send_parameter_status(socket, "TimeZone", "UTC").await?;
    send_parameter_status(socket, "integer_datetimes", "on").await?;
    send_parameter_status(socket, "standard_conforming_strings", "on").await?;

    let pid = std::process::id();
    let secret = pid.wrapping_mul(1103515245).wrapping_add(12345);
    send_backend_key_data(socket, pid, secret).await?;

    send_ready_for_query(socket, TRANSACTION_STATUS_IDLE).await?;
    socket.flush().await?;

    run_query_loop(socket, router, limits.flush_every_rows).await
}

/// Read the startup message, declining any SSL/GSSAPI requests before it
///
/// Returns `None` for a CancelRequest, which ends the connection.
async fn read_startup_message<S>(socket: &mut S) -> anyhow::Result<Option<Vec<u8>>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 4];

    loop {
        socket.read_exact(&mut buf).await?;
        let len = u32::from_be_bytes(buf) as usize;

        if !(8..=10000).contains(&len) {
            return Err(anyhow::anyhow!("Invalid message length: {}", len));
        }

        let mut msg = vec![0u8; len - 4];
        socket.read_exact(&mut msg).await?;

        let code = u32::from_be_bytes([msg[0], msg[1], msg[2], msg[3]]);
        match code {
            SSL_REQUEST_CODE | GSSENC_REQUEST_CODE if len == 8 => {
                debug!("SSL/GSSAPI negotiation requested, declining");
                socket.write_all(&[b'N']).await?;
                socket.flush().await?;
            }
            CANCEL_REQUEST_CODE => {
                let backend_pid = msg
                    .get(4..8)
                    .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
                    .unwrap_or(0);
                warn!(
                    backend_pid = backend_pid,
                    "CancelRequest received; cancellation is not forwarded to the backends"
                );
                return Ok(None);
            }
            _ => return Ok(Some(msg)),
        }
    }
}

/// Cleartext password exchange in passthrough mode
///
/// The password is read and discarded; backend credentials come from configuration.
async fn perform_auth<S>(socket: &mut S, user: &str) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_auth_cleartext_request(socket).await?;
    socket.flush().await?;

    let mut msg_type = [0u8; 1];
    socket.read_exact(&mut msg_type).await?;

    if msg_type[0] != b'p' {
        return Err(anyhow::anyhow!("Expected password message, got: {:?}", msg_type[0]));
    }

    let mut len_buf = [0u8; 4];
    socket.read_exact(&mut len_buf).await?;
    let len = (u32::from_be_bytes(len_buf) as usize)
        .checked_sub(4)
        .filter(|len| *len <= 10000)
        .ok_or_else(|| anyhow::anyhow!("Invalid password message length"))?;

    let mut password_data = vec![0u8; len];
    socket.read_exact(&mut password_data).await?;

    send_auth_ok(socket).await?;
    info!("Authentication completed for user: {} (passthrough)", user);
    Ok(())
}

/// Extract parameter from startup message
pub(crate) fn extract_startup_param(msg: &[u8], key: &str) -> Option<String> {
    if msg.len() < 8 {
        return None;
    }
    let params = &msg[4..];
    let mut iter = params.split(|&b| b == 0);
    while let Some(k) = iter.next() {
        if k.is_empty() {
            break;
        }
        let v = iter.next()?;
        if k == key.as_bytes() {
            return String::from_utf8(v.to_vec()).ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn startup_message(params: &[(&str, &str)]) -> Vec<u8> {
        let mut body = 196608u32.to_be_bytes().to_vec(); // protocol 3.0
        for (k, v) in params {
            body.extend_from_slice(k.as_bytes());
            body.push(0);
            body.extend_from_slice(v.as_bytes());
            body.push(0);
        }
        body.push(0);
        body
    }

    fn framed(body: &[u8]) -> Vec<u8> {
        let mut msg = ((body.len() + 4) as u32).to_be_bytes().to_vec();
        msg.extend_from_slice(body);
        msg
    }

    #[test]
    fn test_extract_startup_param() {
        let msg = startup_message(&[("user", "alice"), ("database", "app")]);
        assert_eq!(extract_startup_param(&msg, "user").as_deref(), Some("alice"));
        assert_eq!(extract_startup_param(&msg, "database").as_deref(), Some("app"));
        assert_eq!(extract_startup_param(&msg, "application_name"), None);
    }

    #[tokio::test]
    async fn test_ssl_request_declined_then_startup() {
        let mut input = framed(&SSL_REQUEST_CODE.to_be_bytes());
        input.extend(framed(&startup_message(&[("user", "bob")])));

        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(&input).await.unwrap();

        let msg = read_startup_message(&mut server).await.unwrap().unwrap();
        assert_eq!(extract_startup_param(&msg, "user").as_deref(), Some("bob"));

        let mut reply = [0u8; 1];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], b'N');
    }

    #[tokio::test]
    async fn test_cancel_request_ends_connection() {
        let mut body = CANCEL_REQUEST_CODE.to_be_bytes().to_vec();
        body.extend_from_slice(&42u32.to_be_bytes());
        body.extend_from_slice(&7u32.to_be_bytes());

        let (mut client, mut server) = tokio::io::duplex(4096);
        client.write_all(&framed(&body)).await.unwrap();
        assert!(read_startup_message(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_length_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&3u32.to_be_bytes()).await.unwrap();
        assert!(read_startup_message(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn test_password_passthrough() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let mut password = vec![b'p'];
        password.extend(framed(b"secret\0"));
        client.write_all(&password).await.unwrap();

        perform_auth(&mut server, "alice").await.unwrap();

        let mut reply = [0u8; 18];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..9], &[b'R', 0, 0, 0, 8, 0, 0, 0, 3]);
        assert_eq!(&reply[9..], &[b'R', 0, 0, 0, 8, 0, 0, 0, 0]);
    }
}
