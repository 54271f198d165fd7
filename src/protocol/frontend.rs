//! Frontend (client → server) messages.

use crate::bind::Bind;
use crate::protocol::codec::MessageBuilder;
use crate::protocol::types::{FormatCode, Oid};

/// Protocol version 3.0 (0x00030000)
pub const PROTOCOL_VERSION_3_0: i32 = 196608;

/// Cancel request code
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Frontend message type bytes.
pub mod msg_type {
    /// Password/SASL response (all auth response types use 'p')
    pub const PASSWORD: u8 = b'p';
    /// Query (simple query protocol)
    pub const QUERY: u8 = b'Q';
    /// Parse (extended query protocol)
    pub const PARSE: u8 = b'P';
    /// Bind (extended query protocol)
    pub const BIND: u8 = b'B';
    /// Execute (extended query protocol)
    pub const EXECUTE: u8 = b'E';
    /// Describe (extended query protocol)
    pub const DESCRIBE: u8 = b'D';
    /// Close (extended query protocol)
    pub const CLOSE: u8 = b'C';
    /// Sync (extended query protocol)
    pub const SYNC: u8 = b'S';
    /// Terminate
    pub const TERMINATE: u8 = b'X';
}

/// Write a StartupMessage.
///
/// Parameters is a list of (name, value) pairs. "user" is required;
/// "database", "application_name", "client_encoding" etc. are optional.
pub fn write_startup(buf: &mut Vec<u8>, params: &[(&str, &str)]) {
    let mut msg = MessageBuilder::new_startup(buf);
    msg.write_i32(PROTOCOL_VERSION_3_0);

    for (name, value) in params {
        msg.write_cstr(name);
        msg.write_cstr(value);
    }

    // Terminator
    msg.write_u8(0);
    msg.finish();
}

/// Write a CancelRequest message.
///
/// Sent on a NEW connection to cancel a query running on another connection.
/// The server closes the connection immediately with no response.
pub fn write_cancel_request(buf: &mut Vec<u8>, pid: u32, secret_key: u32) {
    let mut msg = MessageBuilder::new_startup(buf);
    msg.write_i32(CANCEL_REQUEST_CODE);
    msg.write_u32(pid);
    msg.write_u32(secret_key);
    msg.finish();
}

/// Write a Terminate message for a clean connection shutdown.
pub fn write_terminate(buf: &mut Vec<u8>) {
    let msg = MessageBuilder::new(buf, msg_type::TERMINATE);
    msg.finish();
}

/// Write a Query message (simple query protocol).
pub fn write_query(buf: &mut Vec<u8>, sql: &str) {
    let mut msg = MessageBuilder::new(buf, msg_type::QUERY);
    msg.write_cstr(sql);
    msg.finish();
}

/// Write a Parse message to create a prepared statement.
///
/// - `name`: Statement name (empty string for the unnamed statement)
/// - `query`: SQL with $1, $2, ... placeholders
/// - `param_oids`: Parameter type OIDs (0 = let the server infer)
pub fn write_parse(buf: &mut Vec<u8>, name: &str, query: &str, param_oids: &[Oid]) {
    let mut msg = MessageBuilder::new(buf, msg_type::PARSE);
    msg.write_cstr(name);
    msg.write_cstr(query);
    msg.write_i16(param_oids.len() as i16);
    for &oid in param_oids {
        msg.write_i32(oid as i32);
    }
    msg.finish();
}

/// Write a Bind message carrying encoded parameter values.
///
/// All parameters are sent in binary format, and all result columns are
/// requested in binary format.
pub fn write_bind(buf: &mut Vec<u8>, portal: &str, statement: &str, params: &[Bind<'_>]) {
    let mut msg = MessageBuilder::new(buf, msg_type::BIND);

    msg.write_cstr(portal);
    msg.write_cstr(statement);

    // Parameter format codes
    msg.write_i16(params.len() as i16);
    for param in params {
        msg.write_i16(param.format as i16);
    }

    // Parameter values, length-prefixed; -1 marks SQL NULL
    msg.write_i16(params.len() as i16);
    for param in params {
        match param.bytes() {
            Some(bytes) => {
                msg.write_i32(bytes.len() as i32);
                msg.write_bytes(bytes);
            }
            None => msg.write_i32(-1),
        }
    }

    // One result format code applying to all columns
    msg.write_i16(1);
    msg.write_i16(FormatCode::Binary as i16);

    msg.finish();
}

/// Write a Describe message for a portal.
pub fn write_describe_portal(buf: &mut Vec<u8>, name: &str) {
    let mut msg = MessageBuilder::new(buf, msg_type::DESCRIBE);
    msg.write_u8(b'P');
    msg.write_cstr(name);
    msg.finish();
}

/// Write an Execute message to run a portal.
///
/// `max_rows` of 0 fetches all rows.
pub fn write_execute(buf: &mut Vec<u8>, portal: &str, max_rows: u32) {
    let mut msg = MessageBuilder::new(buf, msg_type::EXECUTE);
    msg.write_cstr(portal);
    msg.write_i32(max_rows as i32);
    msg.finish();
}

/// Write a Close message for a portal.
pub fn write_close_portal(buf: &mut Vec<u8>, name: &str) {
    let mut msg = MessageBuilder::new(buf, msg_type::CLOSE);
    msg.write_u8(b'P');
    msg.write_cstr(name);
    msg.finish();
}

/// Write a Sync message, ending an extended query sequence.
///
/// The server responds with ReadyForQuery once all preceding messages
/// are processed.
pub fn write_sync(buf: &mut Vec<u8>) {
    let msg = MessageBuilder::new(buf, msg_type::SYNC);
    msg.finish();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn startup_message() {
        let mut buf = Vec::new();
        write_startup(&mut buf, &[("user", "postgres"), ("database", "test")]);

        let len = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(len as usize, buf.len());

        let version = i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        assert_eq!(version, PROTOCOL_VERSION_3_0);
        assert_eq!(*buf.last().unwrap(), 0);
    }

    #[test]
    fn terminate_message() {
        let mut buf = Vec::new();
        write_terminate(&mut buf);

        assert_eq!(buf.len(), 5);
        assert_eq!(buf[0], b'X');
        assert_eq!(&buf[1..5], &4_i32.to_be_bytes());
    }

    #[test]
    fn cancel_request_message() {
        let mut buf = Vec::new();
        write_cancel_request(&mut buf, 1234, 5678);

        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[0..4], &16_i32.to_be_bytes());
        assert_eq!(&buf[4..8], &CANCEL_REQUEST_CODE.to_be_bytes());
        assert_eq!(&buf[8..12], &1234_u32.to_be_bytes());
        assert_eq!(&buf[12..16], &5678_u32.to_be_bytes());
    }

    #[test]
    fn parse_message() {
        let mut buf = Vec::new();
        write_parse(&mut buf, "", "SELECT $1", &[0]);

        assert_eq!(buf[0], b'P');
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        assert_eq!(len as usize, buf.len() - 1);
    }

    #[test]
    fn bind_message_null_and_value() {
        let params = [
            Bind::from_value(&Value::Null).unwrap(),
            Bind::from_value(&Value::Int(7)).unwrap(),
        ];
        let mut buf = Vec::new();
        write_bind(&mut buf, "", "", &params);

        assert_eq!(buf[0], b'B');
        // portal "" + statement "" follow the length field
        assert_eq!(&buf[5..7], &[0, 0]);
        // two format codes, both binary
        assert_eq!(&buf[7..9], &2_i16.to_be_bytes());
        assert_eq!(&buf[9..11], &1_i16.to_be_bytes());
        assert_eq!(&buf[11..13], &1_i16.to_be_bytes());
        // two values: NULL (-1), then 8-byte int
        assert_eq!(&buf[13..15], &2_i16.to_be_bytes());
        assert_eq!(&buf[15..19], &(-1_i32).to_be_bytes());
        assert_eq!(&buf[19..23], &8_i32.to_be_bytes());
        assert_eq!(&buf[23..31], &7_i64.to_be_bytes());
    }

    #[test]
    fn sync_message() {
        let mut buf = Vec::new();
        write_sync(&mut buf);

        assert_eq!(buf.len(), 5);
        assert_eq!(buf[0], b'S');
        assert_eq!(&buf[1..5], &4_i32.to_be_bytes());
    }

    #[test]
    fn execute_message() {
        let mut buf = Vec::new();
        write_execute(&mut buf, "", 0);

        assert_eq!(buf[0], b'E');
        assert_eq!(buf.len(), 10);
        assert_eq!(&buf[6..10], &0_i32.to_be_bytes());
    }
}
