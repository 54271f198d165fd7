//! Backend (server → client) messages.

use std::mem::size_of;

use zerocopy::byteorder::big_endian::{U16 as U16BE, U32 as U32BE};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::{QueryError, Result, ServerMessage};
use crate::protocol::codec::{read_cstr, read_i32, read_u32};
use crate::protocol::types::{Oid, TransactionStatus};

/// Backend message type bytes.
pub mod msg_type {
    /// Authentication request
    pub const AUTHENTICATION: u8 = b'R';
    /// BackendKeyData
    pub const BACKEND_KEY_DATA: u8 = b'K';
    /// ParameterStatus
    pub const PARAMETER_STATUS: u8 = b'S';
    /// ReadyForQuery
    pub const READY_FOR_QUERY: u8 = b'Z';
    /// RowDescription
    pub const ROW_DESCRIPTION: u8 = b'T';
    /// DataRow
    pub const DATA_ROW: u8 = b'D';
    /// CommandComplete
    pub const COMMAND_COMPLETE: u8 = b'C';
    /// EmptyQueryResponse
    pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
    /// ErrorResponse
    pub const ERROR_RESPONSE: u8 = b'E';
    /// NoticeResponse
    pub const NOTICE_RESPONSE: u8 = b'N';
    /// NotificationResponse
    pub const NOTIFICATION_RESPONSE: u8 = b'A';
    /// ParseComplete
    pub const PARSE_COMPLETE: u8 = b'1';
    /// BindComplete
    pub const BIND_COMPLETE: u8 = b'2';
    /// CloseComplete
    pub const CLOSE_COMPLETE: u8 = b'3';
    /// NoData
    pub const NO_DATA: u8 = b'n';
    /// PortalSuspended
    pub const PORTAL_SUSPENDED: u8 = b's';
}

/// True for message types that can arrive at any point in the session.
pub fn is_async_type(type_byte: u8) -> bool {
    matches!(
        type_byte,
        msg_type::NOTICE_RESPONSE | msg_type::NOTIFICATION_RESPONSE | msg_type::PARAMETER_STATUS
    )
}

/// One framed message read off the wire.
///
/// The payload buffer is reused between reads; parsed views borrow from it.
#[derive(Debug, Default)]
pub struct MessageBuf {
    /// Message type byte
    pub type_byte: u8,
    /// Message payload (after the length field)
    pub payload: Vec<u8>,
}

impl MessageBuf {
    pub fn new() -> Self {
        Self {
            type_byte: 0,
            payload: Vec::with_capacity(4096),
        }
    }
}

/// Authentication request variants the driver understands.
#[derive(Debug)]
pub enum AuthenticationRequest<'a> {
    /// Authentication successful
    Ok,
    /// Cleartext password required
    CleartextPassword,
    /// MD5 password required, with the per-session salt
    Md5Password { salt: [u8; 4] },
    /// SASL authentication, with the advertised mechanisms
    Sasl { mechanisms: Vec<&'a str> },
    /// SASL continuation (server-first-message)
    SaslContinue { data: &'a [u8] },
    /// SASL final (server-final-message)
    SaslFinal { data: &'a [u8] },
    /// A method this driver does not implement
    Unsupported(i32),
}

impl<'a> AuthenticationRequest<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self, QueryError> {
        let (auth_type, rest) = read_i32(payload)?;

        Ok(match auth_type {
            0 => AuthenticationRequest::Ok,
            3 => AuthenticationRequest::CleartextPassword,
            5 => {
                if rest.len() < 4 {
                    return Err(QueryError::BadResponse("MD5Password: missing salt".into()));
                }
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&rest[..4]);
                AuthenticationRequest::Md5Password { salt }
            }
            10 => {
                let mut mechanisms = Vec::new();
                let mut data = rest;
                while !data.is_empty() && data[0] != 0 {
                    let (mechanism, remaining) = read_cstr(data)?;
                    mechanisms.push(mechanism);
                    data = remaining;
                }
                AuthenticationRequest::Sasl { mechanisms }
            }
            11 => AuthenticationRequest::SaslContinue { data: rest },
            12 => AuthenticationRequest::SaslFinal { data: rest },
            other => AuthenticationRequest::Unsupported(other),
        })
    }
}

/// BackendKeyData message: process ID and secret key for cancellation.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct BackendKeyData {
    pid: U32BE,
    secret_key: U32BE,
}

impl BackendKeyData {
    pub fn parse(payload: &[u8]) -> Result<&Self, QueryError> {
        Self::ref_from_bytes(payload)
            .map_err(|e| QueryError::BadResponse(format!("BackendKeyData: {e:?}")))
    }

    /// Process ID of the backend.
    pub fn process_id(&self) -> u32 {
        self.pid.get()
    }

    /// Secret key for cancel requests.
    pub fn secret(&self) -> u32 {
        self.secret_key.get()
    }
}

/// ParameterStatus message: a server parameter name and value.
#[derive(Debug, Clone)]
pub struct ParameterStatus<'a> {
    pub name: &'a str,
    pub value: &'a str,
}

impl<'a> ParameterStatus<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self, QueryError> {
        let (name, rest) = read_cstr(payload)?;
        let (value, _) = read_cstr(rest)?;
        Ok(Self { name, value })
    }
}

/// ReadyForQuery message: the server is ready for the next command.
#[derive(Debug, Clone, Copy)]
pub struct ReadyForQuery {
    pub status: u8,
}

impl ReadyForQuery {
    pub fn parse(payload: &[u8]) -> Result<Self, QueryError> {
        match payload {
            [status] => Ok(Self { status: *status }),
            _ => Err(QueryError::BadResponse(format!(
                "ReadyForQuery: unexpected length {}",
                payload.len()
            ))),
        }
    }

    pub fn transaction_status(&self) -> Option<TransactionStatus> {
        TransactionStatus::from_byte(self.status)
    }
}

/// RowDescription field header, after the name (18 bytes).
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
struct FieldDescriptionTail {
    table_oid: U32BE,
    column_id: U16BE,
    type_oid: U32BE,
    type_size: U16BE,
    type_modifier: U32BE,
    format: U16BE,
}

/// One column description within a RowDescription.
#[derive(Debug, Clone)]
pub struct FieldDescription<'a> {
    /// Column name as labeled in the result
    pub name: &'a str,
    /// Data type OID
    pub type_oid: Oid,
}

/// RowDescription message: the shape of the rows that follow.
#[derive(Debug)]
pub struct RowDescription<'a> {
    fields: Vec<FieldDescription<'a>>,
}

impl<'a> RowDescription<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self, QueryError> {
        const TAIL_SIZE: usize = size_of::<FieldDescriptionTail>();

        let (num_fields, mut data) = crate::protocol::codec::read_u16(payload)?;
        let mut fields = Vec::with_capacity(num_fields as usize);

        for _ in 0..num_fields {
            let (name, rest) = read_cstr(data)?;
            if rest.len() < TAIL_SIZE {
                return Err(QueryError::BadResponse(
                    "RowDescription: truncated field".into(),
                ));
            }
            let tail = FieldDescriptionTail::ref_from_bytes(&rest[..TAIL_SIZE])
                .map_err(|e| QueryError::BadResponse(format!("FieldDescription: {e:?}")))?;

            fields.push(FieldDescription {
                name,
                type_oid: tail.type_oid.get(),
            });

            data = &rest[TAIL_SIZE..];
        }

        Ok(Self { fields })
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[FieldDescription<'a>] {
        &self.fields
    }
}

/// DataRow message: one row of column values.
#[derive(Debug, Clone, Copy)]
pub struct DataRow<'a> {
    num_columns: u16,
    columns_data: &'a [u8],
}

impl<'a> DataRow<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self, QueryError> {
        let (num_columns, rest) = crate::protocol::codec::read_u16(payload)?;
        Ok(Self {
            num_columns,
            columns_data: rest,
        })
    }

    pub fn len(&self) -> usize {
        self.num_columns as usize
    }

    pub fn is_empty(&self) -> bool {
        self.num_columns == 0
    }

    /// Iterate over column values; `None` represents SQL NULL.
    pub fn iter(&self) -> DataRowIter<'a> {
        DataRowIter {
            remaining: self.columns_data,
        }
    }
}

/// Iterator over column values in a DataRow.
#[derive(Debug, Clone)]
pub struct DataRowIter<'a> {
    remaining: &'a [u8],
}

impl<'a> Iterator for DataRowIter<'a> {
    type Item = Option<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        let len;
        (len, self.remaining) = self.remaining.split_at_checked(4)?;
        let len = i32::from_be_bytes([len[0], len[1], len[2], len[3]]);

        if len < 0 {
            // NULL column
            Some(None)
        } else {
            let value;
            (value, self.remaining) = self.remaining.split_at_checked(len as usize)?;
            Some(Some(value))
        }
    }
}

/// CommandComplete message: a command finished, with its tag.
#[derive(Debug, Clone, Copy)]
pub struct CommandComplete<'a> {
    /// Command tag, e.g. "SELECT 5", "INSERT 0 1"
    pub tag: &'a str,
}

impl<'a> CommandComplete<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self, QueryError> {
        let (tag, _) = read_cstr(payload)?;
        Ok(Self { tag })
    }

    /// Rows affected, parsed from the command tag where applicable.
    pub fn rows_affected(&self) -> Option<u64> {
        let parts: Vec<&str> = self.tag.split_whitespace().collect();

        match parts.as_slice() {
            ["SELECT", count] => count.parse().ok(),
            ["INSERT", _oid, count] => count.parse().ok(),
            ["UPDATE", count] => count.parse().ok(),
            ["DELETE", count] => count.parse().ok(),
            ["COPY", count] => count.parse().ok(),
            ["FETCH", count] => count.parse().ok(),
            _ => None,
        }
    }
}

/// NotificationResponse message: an asynchronous LISTEN/NOTIFY event.
#[derive(Debug, Clone)]
pub struct NotificationResponse<'a> {
    /// PID of the notifying backend
    pub pid: u32,
    /// Channel name
    pub channel: &'a str,
    /// Notification payload (empty string if none was given)
    pub payload: &'a str,
}

impl<'a> NotificationResponse<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self, QueryError> {
        let (pid, rest) = read_u32(payload)?;
        let (channel, rest) = read_cstr(rest)?;
        let (payload_str, _) = read_cstr(rest)?;
        Ok(Self {
            pid,
            channel,
            payload: payload_str,
        })
    }
}

/// Parse ErrorResponse/NoticeResponse fields into a [`ServerMessage`].
pub fn parse_server_message(payload: &[u8]) -> Result<ServerMessage, QueryError> {
    let mut msg = ServerMessage::default();
    let mut data = payload;

    while !data.is_empty() && data[0] != 0 {
        let field_type = data[0];
        data = &data[1..];

        let (value, rest) = read_cstr(data)?;
        data = rest;

        match field_type {
            b'S' => msg.severity = Some(value.to_string()),
            b'C' => msg.code = Some(value.to_string()),
            b'M' => msg.message = Some(value.to_string()),
            b'D' => msg.detail = Some(value.to_string()),
            b'H' => msg.hint = Some(value.to_string()),
            b'P' => msg.position = value.parse().ok(),
            other => {
                tracing::debug!("skipping error field {:?}", other as char);
            }
        }
    }

    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ready_for_query() {
        let ready = ReadyForQuery::parse(&[b'I']).unwrap();
        assert_eq!(ready.transaction_status(), Some(TransactionStatus::Idle));
        assert!(ReadyForQuery::parse(&[]).is_err());
    }

    #[test]
    fn parse_backend_key() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&42_u32.to_be_bytes());
        payload.extend_from_slice(&7_u32.to_be_bytes());
        let key = BackendKeyData::parse(&payload).unwrap();
        assert_eq!(key.process_id(), 42);
        assert_eq!(key.secret(), 7);
    }

    #[test]
    fn parse_parameter_status() {
        let status = ParameterStatus::parse(b"integer_datetimes\0on\0").unwrap();
        assert_eq!(status.name, "integer_datetimes");
        assert_eq!(status.value, "on");
    }

    #[test]
    fn parse_row_description() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1_u16.to_be_bytes());
        payload.extend_from_slice(b"id\0");
        payload.extend_from_slice(&0_u32.to_be_bytes()); // table oid
        payload.extend_from_slice(&0_u16.to_be_bytes()); // column id
        payload.extend_from_slice(&23_u32.to_be_bytes()); // type oid (int4)
        payload.extend_from_slice(&4_u16.to_be_bytes()); // type size
        payload.extend_from_slice(&u32::MAX.to_be_bytes()); // type modifier
        payload.extend_from_slice(&1_u16.to_be_bytes()); // format

        let desc = RowDescription::parse(&payload).unwrap();
        assert_eq!(desc.len(), 1);
        assert_eq!(desc.fields()[0].name, "id");
        assert_eq!(desc.fields()[0].type_oid, 23);
    }

    #[test]
    fn parse_data_row_with_null() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&2_u16.to_be_bytes());
        payload.extend_from_slice(&(-1_i32).to_be_bytes());
        payload.extend_from_slice(&3_i32.to_be_bytes());
        payload.extend_from_slice(b"abc");

        let row = DataRow::parse(&payload).unwrap();
        assert_eq!(row.len(), 2);
        let cols: Vec<_> = row.iter().collect();
        assert_eq!(cols, vec![None, Some(&b"abc"[..])]);
    }

    #[test]
    fn parse_command_tag() {
        let done = CommandComplete::parse(b"INSERT 0 3\0").unwrap();
        assert_eq!(done.rows_affected(), Some(3));
        let done = CommandComplete::parse(b"LISTEN\0").unwrap();
        assert_eq!(done.rows_affected(), None);
    }

    #[test]
    fn parse_notification() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&99_u32.to_be_bytes());
        payload.extend_from_slice(b"jobs\0payload text\0");

        let note = NotificationResponse::parse(&payload).unwrap();
        assert_eq!(note.pid, 99);
        assert_eq!(note.channel, "jobs");
        assert_eq!(note.payload, "payload text");
    }

    #[test]
    fn parse_error_fields() {
        let payload = b"SERROR\0C42601\0Msyntax error\0Pposition\0\0";
        let msg = parse_server_message(payload).unwrap();
        assert_eq!(msg.severity.as_deref(), Some("ERROR"));
        assert_eq!(msg.code.as_deref(), Some("42601"));
        assert_eq!(msg.message.as_deref(), Some("syntax error"));
        // unparseable position is dropped, not an error
        assert_eq!(msg.position, None);
    }
}
