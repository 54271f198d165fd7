//! Query execution: parameter binding, eager result materialization, and
//! the lazy streaming row sequence.

use std::collections::HashMap;

use crate::bind::{self, Bind};
use crate::connection::Connection;
use crate::error::{ConnectionError, Error, QueryError, Result};
use crate::protocol::backend::{self, CommandComplete, DataRow, ReadyForQuery, RowDescription, msg_type};
use crate::protocol::frontend;
use crate::protocol::types::Oid;
use crate::registry::SessionConfig;
use crate::value::{Row, Value};

/// Result status for one completed query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    /// A command that returns no rows was acknowledged.
    CommandOk,
    /// A row-returning query completed.
    TuplesOk,
}

/// The decoded outcome of one query.
#[derive(Debug)]
pub struct QueryResult {
    /// Result status
    pub status: ResultStatus,
    /// All rows, decoded eagerly in server order
    pub rows: Vec<Row>,
    /// Rows affected, from the command tag where applicable
    pub rows_affected: Option<u64>,
}

impl QueryResult {
    /// The first row, or [`QueryError::NoResults`].
    pub fn first(&self) -> Result<&Row, QueryError> {
        self.rows.first().ok_or(QueryError::NoResults)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Owned column metadata for one result shape.
#[derive(Debug, Clone)]
struct Columns {
    fields: Vec<(String, Oid)>,
}

impl Columns {
    fn parse(payload: &[u8]) -> Result<Self, QueryError> {
        let description = RowDescription::parse(payload)?;
        Ok(Self {
            fields: description
                .fields()
                .iter()
                .map(|f| (f.name.to_string(), f.type_oid))
                .collect(),
        })
    }
}

/// Decode one DataRow into the reusable scratch map.
///
/// The scratch is cleared first; duplicate column names resolve to the
/// later column, matching the server's tolerance for duplicate output
/// names. Unknown type OIDs become raw-bytes nodes rather than failing
/// the row.
fn decode_row(
    columns: &Columns,
    payload: &[u8],
    config: &SessionConfig,
    scratch: &mut Row,
) -> Result<(), QueryError> {
    scratch.clear();

    let data_row = DataRow::parse(payload)?;
    let mut decoded = 0usize;

    for ((name, type_oid), cell) in columns.fields.iter().zip(data_row.iter()) {
        let value = match cell {
            None => Value::Null,
            Some(bytes) => Bind::from_column(*type_oid, Some(bytes)).decode(config)?,
        };
        scratch.insert(name.clone(), value);
        decoded += 1;
    }

    if decoded != columns.fields.len() {
        return Err(QueryError::BadResponse(format!(
            "row has {} columns, description has {}",
            decoded,
            columns.fields.len()
        )));
    }

    Ok(())
}

impl Connection {
    /// Stage and send Parse/Bind/Describe/Execute/Sync for one statement.
    fn send_extended_query(&mut self, sql: &str, params: &[Value]) -> Result<()> {
        if sql.is_empty() {
            return Err(QueryError::EmptyQuery.into());
        }
        if self.stream.is_none() {
            return Err(ConnectionError::DoesNotExist.into());
        }

        let (param_oids, binds) = bind::encode_params(params)?;

        self.write_buf.clear();
        frontend::write_parse(&mut self.write_buf, "", sql, &param_oids);
        frontend::write_bind(&mut self.write_buf, "", "", &binds);
        frontend::write_describe_portal(&mut self.write_buf, "");
        frontend::write_execute(&mut self.write_buf, "", 0);
        frontend::write_sync(&mut self.write_buf);
        self.send()
    }

    /// Execute a parameterized query and materialize every row.
    ///
    /// Results are requested in binary format and decoded through the type
    /// registry. A single scratch row is reused across rows; each finished
    /// row is snapshotted into the result before the scratch is reused, so
    /// callers never observe a half-built row.
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.send_extended_query(sql, params)?;

        let config = *self.session_config();
        let mut columns: Option<Columns> = None;
        let mut rows: Vec<Row> = Vec::new();
        let mut scratch: Row = HashMap::new();
        let mut rows_affected = None;
        let mut failure: Option<QueryError> = None;

        loop {
            self.read_next()?;

            match self.msg.type_byte {
                msg_type::PARSE_COMPLETE
                | msg_type::BIND_COMPLETE
                | msg_type::CLOSE_COMPLETE
                | msg_type::NO_DATA
                | msg_type::PORTAL_SUSPENDED => {}
                msg_type::ROW_DESCRIPTION => {
                    columns = Some(Columns::parse(&self.msg.payload)?);
                }
                msg_type::DATA_ROW => {
                    if failure.is_some() {
                        continue;
                    }
                    match &columns {
                        Some(cols) => {
                            decode_row(cols, &self.msg.payload, &config, &mut scratch)?;
                            rows.push(scratch.clone());
                        }
                        None => {
                            failure = Some(QueryError::BadResponse(
                                "DataRow before RowDescription".into(),
                            ));
                        }
                    }
                }
                msg_type::COMMAND_COMPLETE => {
                    let done = CommandComplete::parse(&self.msg.payload)?;
                    rows_affected = done.rows_affected();
                }
                msg_type::EMPTY_QUERY_RESPONSE => {
                    failure = Some(QueryError::EmptyQuery);
                }
                msg_type::ERROR_RESPONSE => {
                    let server = backend::parse_server_message(&self.msg.payload)?;
                    self.last_error = server.to_string();
                    if server.is_fatal() {
                        self.fatal = true;
                    }
                    failure = Some(QueryError::InvalidSql(server));
                }
                msg_type::READY_FOR_QUERY => {
                    let ready = ReadyForQuery::parse(&self.msg.payload)?;
                    self.txn_status = ready.transaction_status().unwrap_or_default();
                    break;
                }
                other => self.handle_async_message(other)?,
            }
        }

        match failure {
            Some(err) => Err(err.into()),
            None => Ok(QueryResult {
                status: if columns.is_some() {
                    ResultStatus::TuplesOk
                } else {
                    ResultStatus::CommandOk
                },
                rows,
                rows_affected,
            }),
        }
    }

    /// Execute a parameterized query as a lazy row sequence.
    ///
    /// Rows are pulled from the transport one message per advance; the
    /// sequence is not restartable. If the stream is dropped before
    /// exhaustion, the remaining buffered messages are drained so the
    /// connection stays usable for the next command.
    pub fn execute_streaming(&mut self, sql: &str, params: &[Value]) -> Result<RowStream<'_>> {
        self.send_extended_query(sql, params)?;

        let config = *self.session_config();
        let mut columns: Option<Columns> = None;
        let mut rows_affected = None;
        let mut failure: Option<QueryError> = None;

        // Advance past the setup replies so the stream starts at row traffic.
        loop {
            self.read_next()?;

            match self.msg.type_byte {
                msg_type::PARSE_COMPLETE | msg_type::BIND_COMPLETE | msg_type::NO_DATA => {}
                msg_type::ROW_DESCRIPTION => {
                    columns = Some(Columns::parse(&self.msg.payload)?);
                    break;
                }
                msg_type::COMMAND_COMPLETE => {
                    let done = CommandComplete::parse(&self.msg.payload)?;
                    rows_affected = done.rows_affected();
                }
                msg_type::EMPTY_QUERY_RESPONSE => {
                    failure = Some(QueryError::EmptyQuery);
                }
                msg_type::ERROR_RESPONSE => {
                    let server = backend::parse_server_message(&self.msg.payload)?;
                    self.last_error = server.to_string();
                    if server.is_fatal() {
                        self.fatal = true;
                    }
                    failure = Some(QueryError::InvalidSql(server));
                }
                msg_type::READY_FOR_QUERY => {
                    let ready = ReadyForQuery::parse(&self.msg.payload)?;
                    self.txn_status = ready.transaction_status().unwrap_or_default();
                    return match failure {
                        Some(err) => Err(err.into()),
                        // command without rows: an already-finished stream
                        None => Ok(RowStream {
                            conn: self,
                            columns: None,
                            config,
                            scratch: HashMap::new(),
                            rows_affected,
                            finished: true,
                        }),
                    };
                }
                other => self.handle_async_message(other)?,
            }
        }

        Ok(RowStream {
            conn: self,
            columns,
            config,
            scratch: HashMap::new(),
            rows_affected,
            finished: false,
        })
    }
}

/// A lazy, non-restartable sequence of decoded rows.
///
/// Borrows the connection exclusively until dropped, so no other command
/// can interleave with the in-flight result.
pub struct RowStream<'c> {
    conn: &'c mut Connection,
    columns: Option<Columns>,
    config: SessionConfig,
    scratch: Row,
    rows_affected: Option<u64>,
    finished: bool,
}

impl RowStream<'_> {
    /// Rows affected by the command, known once the sequence is exhausted.
    pub fn rows_affected(&self) -> Option<u64> {
        self.rows_affected
    }

    /// Read and discard messages until the server is ready again.
    fn drain_to_ready(&mut self) {
        while !self.finished {
            match self.conn.read_next() {
                Err(e) => {
                    tracing::warn!(error = %e, "abandoned row stream could not be drained");
                    break;
                }
                Ok(()) => match self.conn.msg.type_byte {
                    msg_type::READY_FOR_QUERY => {
                        if let Ok(ready) = ReadyForQuery::parse(&self.conn.msg.payload) {
                            self.conn.txn_status = ready.transaction_status().unwrap_or_default();
                        }
                        break;
                    }
                    msg_type::ERROR_RESPONSE => {
                        if let Ok(server) = backend::parse_server_message(&self.conn.msg.payload) {
                            self.conn.last_error = server.to_string();
                        }
                    }
                    _ => {}
                },
            }
        }
        self.finished = true;
    }

    fn fail(&mut self, err: Error) -> Option<Result<Row>> {
        self.drain_to_ready();
        Some(Err(err))
    }
}

impl Iterator for RowStream<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            if let Err(e) = self.conn.read_next() {
                self.finished = true;
                return Some(Err(e));
            }

            match self.conn.msg.type_byte {
                msg_type::DATA_ROW => {
                    let Some(columns) = &self.columns else {
                        return self.fail(
                            QueryError::BadResponse("DataRow before RowDescription".into()).into(),
                        );
                    };
                    match decode_row(columns, &self.conn.msg.payload, &self.config, &mut self.scratch)
                    {
                        Ok(()) => return Some(Ok(self.scratch.clone())),
                        Err(e) => return self.fail(e.into()),
                    }
                }
                msg_type::COMMAND_COMPLETE => {
                    match CommandComplete::parse(&self.conn.msg.payload) {
                        Ok(done) => self.rows_affected = done.rows_affected(),
                        Err(e) => return self.fail(e.into()),
                    }
                }
                msg_type::EMPTY_QUERY_RESPONSE => {
                    return self.fail(QueryError::EmptyQuery.into());
                }
                msg_type::ERROR_RESPONSE => {
                    let err = match backend::parse_server_message(&self.conn.msg.payload) {
                        Ok(server) => {
                            self.conn.last_error = server.to_string();
                            if server.is_fatal() {
                                self.conn.fatal = true;
                            }
                            QueryError::InvalidSql(server).into()
                        }
                        Err(e) => e.into(),
                    };
                    return self.fail(err);
                }
                msg_type::READY_FOR_QUERY => {
                    if let Ok(ready) = ReadyForQuery::parse(&self.conn.msg.payload) {
                        self.conn.txn_status = ready.transaction_status().unwrap_or_default();
                    }
                    self.finished = true;
                    return None;
                }
                other => {
                    if let Err(e) = self.conn.handle_async_message(other) {
                        return self.fail(e);
                    }
                }
            }
        }
    }
}

impl Drop for RowStream<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.drain_to_ready();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::oid;

    fn columns(fields: &[(&str, Oid)]) -> Columns {
        Columns {
            fields: fields
                .iter()
                .map(|(name, type_oid)| (name.to_string(), *type_oid))
                .collect(),
        }
    }

    fn data_row(cells: &[Option<&[u8]>]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(cells.len() as u16).to_be_bytes());
        for cell in cells {
            match cell {
                None => payload.extend_from_slice(&(-1_i32).to_be_bytes()),
                Some(bytes) => {
                    payload.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                    payload.extend_from_slice(bytes);
                }
            }
        }
        payload
    }

    #[test]
    fn duplicate_column_names_last_write_wins() {
        let cols = columns(&[("x", oid::INT4), ("x", oid::INT4)]);
        let payload = data_row(&[
            Some(&1_i32.to_be_bytes()[..]),
            Some(&2_i32.to_be_bytes()[..]),
        ]);

        let mut scratch = Row::new();
        decode_row(&cols, &payload, &SessionConfig::default(), &mut scratch).unwrap();

        assert_eq!(scratch.len(), 1);
        assert_eq!(scratch["x"], Value::Int(2));
    }

    #[test]
    fn null_columns_decode_to_null() {
        let cols = columns(&[("a", oid::TIMESTAMP), ("b", oid::INT8)]);
        let payload = data_row(&[None, Some(&7_i64.to_be_bytes()[..])]);

        let mut scratch = Row::new();
        decode_row(&cols, &payload, &SessionConfig::default(), &mut scratch).unwrap();

        assert_eq!(scratch["a"], Value::Null);
        assert_eq!(scratch["b"], Value::Int(7));
    }

    #[test]
    fn scratch_is_cleared_between_rows() {
        let cols = columns(&[("a", oid::INT4)]);
        let mut scratch = Row::new();
        scratch.insert("stale".into(), Value::Int(9));

        let payload = data_row(&[Some(&1_i32.to_be_bytes()[..])]);
        decode_row(&cols, &payload, &SessionConfig::default(), &mut scratch).unwrap();

        assert_eq!(scratch.len(), 1);
        assert!(!scratch.contains_key("stale"));
    }

    #[test]
    fn column_count_mismatch_is_bad_response() {
        let cols = columns(&[("a", oid::INT4), ("b", oid::INT4)]);
        let payload = data_row(&[Some(&1_i32.to_be_bytes()[..])]);

        let mut scratch = Row::new();
        let err = decode_row(&cols, &payload, &SessionConfig::default(), &mut scratch);
        assert!(matches!(err, Err(QueryError::BadResponse(_))));
    }

    #[test]
    fn unknown_oid_column_falls_back_to_bytes() {
        let cols = columns(&[("mystery", 987_654)]);
        let payload = data_row(&[Some(&[0xde, 0xad][..])]);

        let mut scratch = Row::new();
        decode_row(&cols, &payload, &SessionConfig::default(), &mut scratch).unwrap();

        assert_eq!(scratch["mystery"], Value::Bytes(vec![0xde, 0xad]));
    }

    #[test]
    fn first_requires_rows() {
        let result = QueryResult {
            status: ResultStatus::CommandOk,
            rows: Vec::new(),
            rows_affected: Some(0),
        };
        assert!(matches!(result.first(), Err(QueryError::NoResults)));
    }
}
