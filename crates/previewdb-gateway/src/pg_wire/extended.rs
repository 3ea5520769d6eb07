//! Extended Query protocol (Parse, Bind, Describe, Execute, Close)
//!
//! Prepared statements and portals live per client connection. Bind inlines
//! the bound values into the statement text, so Execute runs an ordinary
//! text query through the client's session and is routed like any simple
//! query. Results always travel in text format. Execute runs a portal to
//! completion: a row limit is ignored and PortalSuspended is never sent.

use super::messages::{
    send_bind_complete, send_close_complete, send_empty_query_response, send_no_data,
    send_parameter_description, send_parse_complete, send_row_description,
};
use super::params::{
    decode_value, format_for, render_literal, substitute_parameters, Format,
};
use super::query_loop::{truncate, WireSink};
use super::types::pg_type_oid;
use crate::backend::ColumnMeta;
use crate::classifier::classify;
use crate::errors::{self, sqlstate, ClassifiedError, ErrorCategory};
use crate::router::{QueryOutcome, Session};
use std::collections::HashMap;
use tokio::io::AsyncWrite;
use tracing::debug;

/// A parsed statement, by name (`""` is the unnamed statement)
struct PreparedStatement {
    sql: String,
    /// Parameter type OIDs; 0 leaves the type to the server
    param_types: Vec<u32>,
    /// Result columns once a Describe has fetched them
    columns: Option<Vec<ColumnMeta>>,
}

/// A bound statement ready to execute
struct Portal {
    /// Statement text with the bound values inlined
    sql: String,
    columns: Option<Vec<ColumnMeta>>,
}

/// How an extended-protocol message ended
#[derive(Debug)]
pub(crate) enum MessageResult {
    Done,
    /// Send this error, then skip messages until Sync
    Error(ClassifiedError),
    /// The error already reached the client; skip messages until Sync
    ErrorSent,
}

impl From<ClassifiedError> for MessageResult {
    fn from(err: ClassifiedError) -> Self {
        MessageResult::Error(err)
    }
}

/// Per-connection statements and portals
#[derive(Default)]
pub(crate) struct ExtendedState {
    statements: HashMap<String, PreparedStatement>,
    portals: HashMap<String, Portal>,
}

impl ExtendedState {
    /// Handle one of `P`, `B`, `D`, `E`, `C`, `F`
    pub(crate) async fn handle<S>(
        &mut self,
        kind: u8,
        body: &[u8],
        session: &mut Session<'_>,
        socket: &mut S,
        flush_every_rows: usize,
    ) -> anyhow::Result<MessageResult>
    where
        S: AsyncWrite + Unpin + Send,
    {
        match kind {
            b'P' => match self.parse(body) {
                Ok(()) => {
                    send_parse_complete(socket).await?;
                    Ok(MessageResult::Done)
                }
                Err(err) => Ok(err.into()),
            },
            b'B' => match self.bind(body) {
                Ok(()) => {
                    send_bind_complete(socket).await?;
                    Ok(MessageResult::Done)
                }
                Err(err) => Ok(err.into()),
            },
            b'D' => self.describe(body, session, socket).await,
            b'E' => self.execute(body, session, socket, flush_every_rows).await,
            b'C' => match self.close(body) {
                Ok(()) => {
                    send_close_complete(socket).await?;
                    Ok(MessageResult::Done)
                }
                Err(err) => Ok(err.into()),
            },
            _ => Ok(ClassifiedError::new(
                sqlstate::FEATURE_NOT_SUPPORTED,
                ErrorCategory::Unsupported,
                "function call protocol is not supported",
            )
            .into()),
        }
    }

    fn parse(&mut self, body: &[u8]) -> Result<(), ClassifiedError> {
        let mut reader = Reader::new(body, "Parse");
        let name = reader.cstr()?;
        let sql = reader.cstr()?;
        let count = reader.count()?;
        let mut param_types = Vec::with_capacity(count);
        for _ in 0..count {
            param_types.push(reader.u32()?);
        }

        if classify(&sql).statements.len() > 1 {
            return Err(ClassifiedError::new(
                sqlstate::SYNTAX_ERROR,
                ErrorCategory::Syntax,
                "cannot insert multiple commands into a prepared statement",
            ));
        }

        debug!(statement = %name, "Parse: {}", truncate(&sql, 100));
        self.statements.insert(
            name,
            PreparedStatement {
                sql,
                param_types,
                columns: None,
            },
        );
        Ok(())
    }

    fn bind(&mut self, body: &[u8]) -> Result<(), ClassifiedError> {
        let mut reader = Reader::new(body, "Bind");
        let portal = reader.cstr()?;
        let statement_name = reader.cstr()?;
        let statement = self
            .statements
            .get(&statement_name)
            .ok_or_else(|| errors::unknown_statement(&statement_name))?;

        let format_count = reader.count()?;
        let mut formats = Vec::with_capacity(format_count);
        for _ in 0..format_count {
            formats.push(Format::from_code(reader.i16()?)?);
        }

        let param_count = reader.count()?;
        let mut literals = Vec::with_capacity(param_count);
        for index in 0..param_count {
            let type_oid = statement.param_types.get(index).copied().unwrap_or(0);
            let len = reader.i32()?;
            let value = match usize::try_from(len) {
                Ok(len) => Some(decode_value(
                    index,
                    reader.take(len)?,
                    format_for(&formats, index),
                    type_oid,
                )?),
                // -1 is NULL
                Err(_) => None,
            };
            literals.push(render_literal(value.as_deref(), type_oid));
        }

        let result_format_count = reader.count()?;
        for _ in 0..result_format_count {
            if Format::from_code(reader.i16()?)? == Format::Binary {
                return Err(errors::binary_format_unsupported("result columns"));
            }
        }

        let sql = substitute_parameters(&statement.sql, &literals)?;
        debug!(portal = %portal, params = param_count, "Bind: {}", truncate(&sql, 100));
        self.portals.insert(
            portal,
            Portal {
                sql,
                columns: statement.columns.clone(),
            },
        );
        Ok(())
    }

    async fn describe<S>(
        &mut self,
        body: &[u8],
        session: &mut Session<'_>,
        socket: &mut S,
    ) -> anyhow::Result<MessageResult>
    where
        S: AsyncWrite + Unpin + Send,
    {
        let (kind, name) = match target(body, "Describe") {
            Ok(target) => target,
            Err(err) => return Ok(err.into()),
        };

        match kind {
            b'S' => {
                let Some(statement) = self.statements.get_mut(&name) else {
                    return Ok(errors::unknown_statement(&name).into());
                };
                let description = match session.describe(&statement.sql).await {
                    Ok(description) => description,
                    Err(err) => return Ok(err.into()),
                };

                // Declared types win; the server fills in the rest
                for (index, type_name) in description.parameters.iter().enumerate() {
                    let described = pg_type_oid(type_name);
                    match statement.param_types.get_mut(index) {
                        Some(oid) if *oid == 0 => *oid = described,
                        Some(_) => {}
                        None => statement.param_types.push(described),
                    }
                }
                statement.columns = Some(description.columns.clone());

                send_parameter_description(socket, &statement.param_types).await?;
                send_columns(socket, &description.columns).await?;
            }
            b'P' => {
                let Some(portal) = self.portals.get_mut(&name) else {
                    return Ok(errors::unknown_portal(&name).into());
                };
                if portal.columns.is_none() {
                    match session.describe(&portal.sql).await {
                        Ok(description) => portal.columns = Some(description.columns),
                        Err(err) => return Ok(err.into()),
                    }
                }
                send_columns(socket, portal.columns.as_deref().unwrap_or_default()).await?;
            }
            other => {
                return Ok(errors::protocol_violation(format!(
                    "invalid Describe target '{}'",
                    other as char
                ))
                .into())
            }
        }
        Ok(MessageResult::Done)
    }

    async fn execute<S>(
        &mut self,
        body: &[u8],
        session: &mut Session<'_>,
        socket: &mut S,
        flush_every_rows: usize,
    ) -> anyhow::Result<MessageResult>
    where
        S: AsyncWrite + Unpin + Send,
    {
        let mut reader = Reader::new(body, "Execute");
        let (name, max_rows) = match reader.cstr().and_then(|name| Ok((name, reader.i32()?))) {
            Ok(parsed) => parsed,
            Err(err) => return Ok(err.into()),
        };
        let Some(portal) = self.portals.get(&name) else {
            return Ok(errors::unknown_portal(&name).into());
        };
        if max_rows > 0 {
            debug!(max_rows, "Execute row limit ignored, running portal to completion");
        }

        if classify(&portal.sql).is_empty_query() {
            send_empty_query_response(socket).await?;
            return Ok(MessageResult::Done);
        }

        // RowDescription comes from Describe, never from Execute
        let mut sink = WireSink::without_descriptions(&mut *socket, flush_every_rows);
        match session.handle(&portal.sql, &mut sink).await? {
            QueryOutcome::Completed(_) => Ok(MessageResult::Done),
            QueryOutcome::Failed => Ok(MessageResult::ErrorSent),
        }
    }

    fn close(&mut self, body: &[u8]) -> Result<(), ClassifiedError> {
        // Closing a name that does not exist is not an error
        match target(body, "Close")? {
            (b'S', name) => {
                self.statements.remove(&name);
            }
            (b'P', name) => {
                self.portals.remove(&name);
            }
            (other, _) => {
                return Err(errors::protocol_violation(format!(
                    "invalid Close target '{}'",
                    other as char
                )))
            }
        }
        Ok(())
    }
}

/// `S`/`P` byte and name of a Describe or Close
fn target(body: &[u8], message: &'static str) -> Result<(u8, String), ClassifiedError> {
    let mut reader = Reader::new(body, message);
    let kind = reader.u8()?;
    let name = reader.cstr()?;
    Ok((kind, name))
}

async fn send_columns<S>(socket: &mut S, columns: &[ColumnMeta]) -> anyhow::Result<()>
where
    S: AsyncWrite + Unpin,
{
    if columns.is_empty() {
        send_no_data(socket).await
    } else {
        send_row_description(socket, columns).await
    }
}

/// Cursor over a frontend message body
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    message: &'static str,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], message: &'static str) -> Self {
        Self {
            buf,
            pos: 0,
            message,
        }
    }

    fn malformed(&self) -> ClassifiedError {
        errors::protocol_violation(format!("malformed {} message", self.message))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ClassifiedError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| self.malformed())?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn cstr(&mut self) -> Result<String, ClassifiedError> {
        let rest = self.buf.get(self.pos..).unwrap_or_default();
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| self.malformed())?;
        let value = String::from_utf8_lossy(&rest[..nul]).into_owned();
        self.pos += nul + 1;
        Ok(value)
    }

    fn u8(&mut self) -> Result<u8, ClassifiedError> {
        Ok(self.take(1)?[0])
    }

    fn i16(&mut self) -> Result<i16, ClassifiedError> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> Result<i32, ClassifiedError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u32(&mut self) -> Result<u32, ClassifiedError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Non-negative Int16 element count
    fn count(&mut self) -> Result<usize, ClassifiedError> {
        let n = self.i16()?;
        usize::try_from(n).map_err(|_| self.malformed())
    }
}
