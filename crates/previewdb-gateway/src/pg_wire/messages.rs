//! PostgreSQL wire protocol message builders
//!
//! Functions for constructing and sending backend messages to clients.

use super::types::{pg_type_len, pg_type_oid};
use crate::backend::{ColumnMeta, TransactionState};
use crate::errors::ClassifiedError;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Transaction status: Idle (not in a transaction)
pub const TRANSACTION_STATUS_IDLE: u8 = b'I';

/// Transaction status: In a transaction block
pub const TRANSACTION_STATUS_IN_TRANSACTION: u8 = b'T';

/// Transaction status: In a failed transaction block
pub const TRANSACTION_STATUS_FAILED: u8 = b'E';

/// ReadyForQuery status byte for a session's transaction state
pub fn transaction_status(state: TransactionState) -> u8 {
    match state {
        TransactionState::Idle => TRANSACTION_STATUS_IDLE,
        TransactionState::InTransaction => TRANSACTION_STATUS_IN_TRANSACTION,
        TransactionState::Failed => TRANSACTION_STATUS_FAILED,
    }
}

/// Send AuthenticationCleartextPassword
pub async fn send_auth_cleartext_request<S>(socket: &mut S) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    socket.write_all(&[b'R', 0, 0, 0, 8, 0, 0, 0, 3]).await?;
    Ok(())
}

/// Send AuthenticationOk
pub async fn send_auth_ok<S>(socket: &mut S) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    socket.write_all(&[b'R', 0, 0, 0, 8, 0, 0, 0, 0]).await?;
    Ok(())
}

/// Send ParameterStatus message
pub async fn send_parameter_status<S>(socket: &mut S, name: &str, value: &str) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut msg = Vec::new();
    msg.push(b'S'); // ParameterStatus
    msg.extend_from_slice(&[0, 0, 0, 0]); // Length placeholder
    msg.extend_from_slice(name.as_bytes());
    msg.push(0);
    msg.extend_from_slice(value.as_bytes());
    msg.push(0);
    let len = (msg.len() - 1) as u32;
    msg[1..5].copy_from_slice(&len.to_be_bytes());
    socket.write_all(&msg).await?;
    Ok(())
}

/// Send BackendKeyData
pub async fn send_backend_key_data<S>(socket: &mut S, pid: u32, secret: u32) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut key_data = vec![b'K', 0, 0, 0, 12];
    key_data.extend_from_slice(&pid.to_be_bytes());
    key_data.extend_from_slice(&secret.to_be_bytes());
    socket.write_all(&key_data).await?;
    Ok(())
}

/// Send a rich ErrorResponse with SQLSTATE code, message, hint, and detail
/// This follows the PostgreSQL wire protocol ErrorResponse format:
/// - 'S' Severity: ERROR
/// - 'V' Severity (non-localized): ERROR
/// - 'C' SQLSTATE code
/// - 'M' Message (primary human-readable message)
/// - 'D' Detail (optional secondary message)
/// - 'H' Hint (optional suggestion)
pub async fn send_classified_error<S>(socket: &mut S, error: &ClassifiedError) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    buf.push(b'E'); // ErrorResponse

    let mut fields = Vec::new();
    push_field(&mut fields, b'S', "ERROR");
    push_field(&mut fields, b'V', "ERROR");
    push_field(&mut fields, b'C', &error.sqlstate);
    push_field(&mut fields, b'M', &error.message);

    if let Some(ref detail) = error.detail {
        if !detail.is_empty() {
            push_field(&mut fields, b'D', detail);
        }
    }

    if let Some(ref hint) = error.hint {
        push_field(&mut fields, b'H', hint);
    }

    // Terminator
    fields.push(0);

    let len = (4 + fields.len()) as u32;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&fields);

    socket.write_all(&buf).await?;
    Ok(())
}

fn push_field(fields: &mut Vec<u8>, code: u8, value: &str) {
    fields.push(code);
    // Embedded NULs would terminate the field early
    fields.extend(value.bytes().filter(|&b| b != 0));
    fields.push(0);
}

/// Send RowDescription message
pub async fn send_row_description<S>(socket: &mut S, columns: &[ColumnMeta]) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut msg = Vec::new();
    msg.push(b'T'); // RowDescription
    msg.extend_from_slice(&[0, 0, 0, 0]); // Length placeholder
    msg.extend_from_slice(&(columns.len() as i16).to_be_bytes()); // Field count

    for column in columns {
        msg.extend_from_slice(column.name.as_bytes());
        msg.push(0);
        msg.extend_from_slice(&0u32.to_be_bytes()); // table OID
        msg.extend_from_slice(&0i16.to_be_bytes()); // column attr
        msg.extend_from_slice(&pg_type_oid(&column.type_name).to_be_bytes());
        msg.extend_from_slice(&pg_type_len(&column.type_name).to_be_bytes());
        msg.extend_from_slice(&(-1i32).to_be_bytes()); // type modifier
        msg.extend_from_slice(&0i16.to_be_bytes()); // format code (text)
    }

    let len = (msg.len() - 1) as u32;
    msg[1..5].copy_from_slice(&len.to_be_bytes());

    socket.write_all(&msg).await?;
    Ok(())
}

/// Send a single DataRow; `None` is sent as SQL NULL
pub async fn send_data_row<S>(socket: &mut S, row: &[Option<String>]) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut data_row = Vec::with_capacity(7 + row.len() * 16);
    data_row.push(b'D');
    data_row.extend_from_slice(&[0, 0, 0, 0]); // Length placeholder
    data_row.extend_from_slice(&(row.len() as i16).to_be_bytes());

    for value in row {
        match value {
            Some(value) => {
                data_row.extend_from_slice(&(value.len() as i32).to_be_bytes());
                data_row.extend_from_slice(value.as_bytes());
            }
            None => data_row.extend_from_slice(&(-1i32).to_be_bytes()),
        }
    }

    let len = (data_row.len() - 1) as u32;
    data_row[1..5].copy_from_slice(&len.to_be_bytes());

    socket.write_all(&data_row).await?;
    Ok(())
}

/// Send CommandComplete message
pub async fn send_command_complete<S>(socket: &mut S, tag: &str) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut msg = Vec::new();
    msg.push(b'C'); // CommandComplete
    let tag_bytes = tag.as_bytes();
    let len = (4 + tag_bytes.len() + 1) as u32;
    msg.extend_from_slice(&len.to_be_bytes());
    msg.extend_from_slice(tag_bytes);
    msg.push(0); // Null terminator
    socket.write_all(&msg).await?;
    Ok(())
}

/// Send EmptyQueryResponse
pub async fn send_empty_query_response<S>(socket: &mut S) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    socket.write_all(&[b'I', 0, 0, 0, 4]).await?;
    Ok(())
}

/// Send ParseComplete
pub async fn send_parse_complete<S>(socket: &mut S) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    socket.write_all(&[b'1', 0, 0, 0, 4]).await?;
    Ok(())
}

/// Send BindComplete
pub async fn send_bind_complete<S>(socket: &mut S) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    socket.write_all(&[b'2', 0, 0, 0, 4]).await?;
    Ok(())
}

/// Send CloseComplete
pub async fn send_close_complete<S>(socket: &mut S) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    socket.write_all(&[b'3', 0, 0, 0, 4]).await?;
    Ok(())
}

/// Send NoData (Describe of a statement that returns no rows)
pub async fn send_no_data<S>(socket: &mut S) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    socket.write_all(&[b'n', 0, 0, 0, 4]).await?;
    Ok(())
}

/// Send ParameterDescription with one type OID per parameter
pub async fn send_parameter_description<S>(socket: &mut S, type_oids: &[u32]) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut msg = Vec::with_capacity(7 + type_oids.len() * 4);
    msg.push(b't');
    msg.extend_from_slice(&((6 + type_oids.len() * 4) as u32).to_be_bytes());
    msg.extend_from_slice(&(type_oids.len() as i16).to_be_bytes());
    for oid in type_oids {
        msg.extend_from_slice(&oid.to_be_bytes());
    }
    socket.write_all(&msg).await?;
    Ok(())
}

/// Send ReadyForQuery message with transaction status
pub async fn send_ready_for_query<S>(socket: &mut S, status: u8) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    socket.write_all(&[b'Z', 0, 0, 0, 5, status]).await?;
    Ok(())
}
