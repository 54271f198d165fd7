//! Connection lifecycle: transport ownership, startup, authentication,
//! status introspection, and cancellation.

use std::io::{BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use once_cell::sync::OnceCell;

use crate::error::{CancelError, ConnectionError, Error, QueryError, Result};
use crate::opts::Opts;
use crate::protocol::auth::{
    ScramClient, md5_password, write_password, write_sasl_initial_response, write_sasl_response,
};
use crate::protocol::backend::{
    self, AuthenticationRequest, BackendKeyData, CommandComplete, MessageBuf, NotificationResponse,
    ParameterStatus, ReadyForQuery, msg_type,
};
use crate::protocol::frontend;
use crate::protocol::types::TransactionStatus;
use crate::registry::SessionConfig;

/// Buffered transport stream, exclusively owned by one [`Connection`].
pub(crate) enum Stream {
    Tcp(BufReader<TcpStream>),
    Unix(BufReader<UnixStream>),
}

impl Stream {
    fn tcp(stream: TcpStream) -> Self {
        Self::Tcp(BufReader::new(stream))
    }

    fn unix(stream: UnixStream) -> Self {
        Self::Unix(BufReader::new(stream))
    }

    pub(crate) fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        match self {
            Stream::Tcp(r) => r.read_exact(buf),
            Stream::Unix(r) => r.read_exact(buf),
        }
    }

    pub(crate) fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Stream::Tcp(r) => r.get_mut().write_all(buf),
            Stream::Unix(r) => r.get_mut().write_all(buf),
        }
    }

    pub(crate) fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tcp(r) => r.get_mut().flush(),
            Stream::Unix(r) => r.get_mut().flush(),
        }
    }

    fn take_error(&self) -> std::io::Result<Option<std::io::Error>> {
        match self {
            Stream::Tcp(r) => r.get_ref().take_error(),
            Stream::Unix(r) => r.get_ref().take_error(),
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        match self {
            Stream::Tcp(r) => r.get_ref().set_read_timeout(timeout),
            Stream::Unix(r) => r.get_ref().set_read_timeout(timeout),
        }
    }

    fn shutdown_handle(&self) -> std::io::Result<ShutdownHandle> {
        match self {
            Stream::Tcp(r) => Ok(ShutdownHandle::Tcp(r.get_ref().try_clone()?)),
            Stream::Unix(r) => Ok(ShutdownHandle::Unix(r.get_ref().try_clone()?)),
        }
    }
}

/// A cloned socket handle used only to wake a blocked reader during teardown.
pub(crate) enum ShutdownHandle {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl ShutdownHandle {
    pub(crate) fn shutdown(&self) {
        let _ = match self {
            ShutdownHandle::Tcp(s) => s.shutdown(Shutdown::Both),
            ShutdownHandle::Unix(s) => s.shutdown(Shutdown::Both),
        };
    }
}

/// Read one framed message into the reusable buffer.
pub(crate) fn read_message(stream: &mut Stream, msg: &mut MessageBuf) -> Result<()> {
    let mut type_byte = [0u8; 1];
    stream.read_exact(&mut type_byte)?;
    msg.type_byte = type_byte[0];

    let mut length_bytes = [0u8; 4];
    stream.read_exact(&mut length_bytes)?;
    let length = u32::from_be_bytes(length_bytes);

    if length < 4 {
        return Err(QueryError::BadResponse(format!("invalid message length: {}", length)).into());
    }

    let payload_len = (length - 4) as usize;
    msg.payload.clear();
    msg.payload.resize(payload_len, 0);
    stream.read_exact(&mut msg.payload)?;

    Ok(())
}

/// Live transport status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// The transport is usable.
    Ok,
    /// The transport is closed, failed, or was never opened.
    Bad,
}

/// An open session with the server.
///
/// The transport handle is owned exclusively; there is no way to get at the
/// raw stream from outside this module. Dropping the connection releases the
/// transport exactly once, on every exit path.
pub struct Connection {
    pub(crate) stream: Option<Stream>,
    pub(crate) opts: Opts,
    pub(crate) msg: MessageBuf,
    pub(crate) write_buf: Vec<u8>,
    pub(crate) backend_key: Option<BackendKeyData>,
    pub(crate) server_params: Vec<(String, String)>,
    pub(crate) txn_status: TransactionStatus,
    pub(crate) fatal: bool,
    pub(crate) last_error: String,
    session_config: OnceCell<SessionConfig>,
}

struct Handshake {
    stream: Stream,
    backend_key: Option<BackendKeyData>,
    server_params: Vec<(String, String)>,
    txn_status: TransactionStatus,
}

impl Connection {
    /// Connect and run the startup handshake to the ready state.
    ///
    /// Accepts [`Opts`], a conninfo string, or a `postgres://` URL.
    pub fn connect<O>(opts: O) -> Result<Self, ConnectionError>
    where
        O: TryInto<Opts>,
        ConnectionError: From<O::Error>,
    {
        let opts = opts.try_into()?;
        let handshake = Self::establish(&opts)?;

        Ok(Self {
            stream: Some(handshake.stream),
            opts,
            msg: MessageBuf::new(),
            write_buf: Vec::with_capacity(1024),
            backend_key: handshake.backend_key,
            server_params: handshake.server_params,
            txn_status: handshake.txn_status,
            fatal: false,
            last_error: String::new(),
            session_config: OnceCell::new(),
        })
    }

    fn establish(opts: &Opts) -> Result<Handshake, ConnectionError> {
        let mut stream = match &opts.socket {
            Some(path) => Stream::unix(UnixStream::connect(path)?),
            None => {
                let tcp = TcpStream::connect((opts.host.as_str(), opts.port))?;
                tcp.set_nodelay(true)?;
                Stream::tcp(tcp)
            }
        };

        match Self::run_handshake(&mut stream, opts) {
            Ok((backend_key, server_params, txn_status)) => Ok(Handshake {
                stream,
                backend_key,
                server_params,
                txn_status,
            }),
            Err(Error::Connection(err)) => Err(err),
            Err(other) => Err(ConnectionError::EstablishFailed(other.to_string())),
        }
    }

    #[allow(clippy::type_complexity)]
    fn run_handshake(
        stream: &mut Stream,
        opts: &Opts,
    ) -> Result<(
        Option<BackendKeyData>,
        Vec<(String, String)>,
        TransactionStatus,
    )> {
        let mut msg = MessageBuf::new();
        let mut write_buf = Vec::with_capacity(512);

        frontend::write_startup(&mut write_buf, &opts.startup_params());
        stream.write_all(&write_buf)?;
        stream.flush()?;

        let mut scram: Option<ScramClient> = None;
        let mut backend_key = None;
        let mut server_params: Vec<(String, String)> = Vec::new();

        loop {
            read_message(stream, &mut msg)?;

            match msg.type_byte {
                msg_type::AUTHENTICATION => {
                    let request = AuthenticationRequest::parse(&msg.payload)?;
                    write_buf.clear();
                    match request {
                        AuthenticationRequest::Ok => continue,
                        AuthenticationRequest::CleartextPassword => {
                            let password = Self::required_password(opts)?;
                            write_password(&mut write_buf, password);
                        }
                        AuthenticationRequest::Md5Password { salt } => {
                            let password = Self::required_password(opts)?;
                            let hashed = md5_password(&opts.user, password, &salt);
                            write_password(&mut write_buf, &hashed);
                        }
                        AuthenticationRequest::Sasl { mechanisms } => {
                            if !mechanisms.contains(&"SCRAM-SHA-256") {
                                return Err(ConnectionError::EstablishFailed(format!(
                                    "no supported SASL mechanism in {:?}",
                                    mechanisms
                                ))
                                .into());
                            }
                            let password = Self::required_password(opts)?;
                            let client = ScramClient::new(password);
                            let first = client.client_first_message();
                            write_sasl_initial_response(
                                &mut write_buf,
                                "SCRAM-SHA-256",
                                first.as_bytes(),
                            );
                            scram = Some(client);
                        }
                        AuthenticationRequest::SaslContinue { data } => {
                            let client = scram.as_mut().ok_or_else(|| {
                                ConnectionError::EstablishFailed(
                                    "SASL continuation without initial exchange".into(),
                                )
                            })?;
                            let server_first = std::str::from_utf8(data).map_err(|e| {
                                ConnectionError::EstablishFailed(format!(
                                    "invalid server-first-message: {e}"
                                ))
                            })?;
                            let response = client
                                .process_server_first(server_first)
                                .map_err(ConnectionError::EstablishFailed)?;
                            write_sasl_response(&mut write_buf, response.as_bytes());
                        }
                        AuthenticationRequest::SaslFinal { data } => {
                            let client = scram.as_ref().ok_or_else(|| {
                                ConnectionError::EstablishFailed(
                                    "SASL final without initial exchange".into(),
                                )
                            })?;
                            let server_final = std::str::from_utf8(data).map_err(|e| {
                                ConnectionError::EstablishFailed(format!(
                                    "invalid server-final-message: {e}"
                                ))
                            })?;
                            client
                                .verify_server_final(server_final)
                                .map_err(ConnectionError::EstablishFailed)?;
                            continue;
                        }
                        AuthenticationRequest::Unsupported(method) => {
                            return Err(ConnectionError::EstablishFailed(format!(
                                "unsupported authentication method {}",
                                method
                            ))
                            .into());
                        }
                    }
                    stream.write_all(&write_buf)?;
                    stream.flush()?;
                }
                msg_type::PARAMETER_STATUS => {
                    let status = ParameterStatus::parse(&msg.payload)?;
                    server_params.push((status.name.to_string(), status.value.to_string()));
                }
                msg_type::BACKEND_KEY_DATA => {
                    backend_key = Some(*BackendKeyData::parse(&msg.payload)?);
                }
                msg_type::READY_FOR_QUERY => {
                    let ready = ReadyForQuery::parse(&msg.payload)?;
                    let txn_status = ready.transaction_status().unwrap_or_default();
                    return Ok((backend_key, server_params, txn_status));
                }
                msg_type::ERROR_RESPONSE => {
                    let server = backend::parse_server_message(&msg.payload)?;
                    return Err(ConnectionError::EstablishFailed(server.to_string()).into());
                }
                msg_type::NOTICE_RESPONSE => {
                    let notice = backend::parse_server_message(&msg.payload)?;
                    tracing::debug!(%notice, "notice during startup");
                }
                other => {
                    return Err(ConnectionError::EstablishFailed(format!(
                        "unexpected message {:?} during startup",
                        other as char
                    ))
                    .into());
                }
            }
        }
    }

    fn required_password(opts: &Opts) -> Result<&str, ConnectionError> {
        opts.password.as_deref().ok_or_else(|| {
            ConnectionError::EstablishFailed("server requested a password, none configured".into())
        })
    }

    /// Live transport status, queried from the socket rather than cached.
    pub fn status(&self) -> ConnStatus {
        match &self.stream {
            None => ConnStatus::Bad,
            Some(_) if self.fatal => ConnStatus::Bad,
            Some(stream) => match stream.take_error() {
                Ok(None) => ConnStatus::Ok,
                _ => ConnStatus::Bad,
            },
        }
    }

    /// Fast connectivity check: the handle exists and the transport is ok.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some() && self.status() == ConnStatus::Ok
    }

    /// Reinitialize the transport from the original connect options.
    ///
    /// The connection object is reused; only the underlying stream and
    /// session state are replaced.
    pub fn reset(&mut self) -> Result<(), ConnectionError> {
        let handshake = Self::establish(&self.opts)
            .map_err(|e| ConnectionError::ResetFailed(e.to_string()))?;

        self.stream = Some(handshake.stream);
        self.backend_key = handshake.backend_key;
        self.server_params = handshake.server_params;
        self.txn_status = handshake.txn_status;
        self.fatal = false;
        self.last_error.clear();

        match self.status() {
            ConnStatus::Ok => Ok(()),
            ConnStatus::Bad => Err(ConnectionError::ResetFailed(
                "transport not ok after reset".into(),
            )),
        }
    }

    /// Close the connection, releasing the transport exactly once.
    ///
    /// Closing an already-closed connection is a no-op.
    pub fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            self.write_buf.clear();
            frontend::write_terminate(&mut self.write_buf);
            let _ = stream.write_all(&self.write_buf);
            let _ = stream.flush();
        }
    }

    /// Session settings that affect decoding, computed once and cached for
    /// the connection's lifetime.
    pub fn session_config(&self) -> &SessionConfig {
        self.session_config
            .get_or_init(|| SessionConfig::from_server_params(&self.server_params))
    }

    /// Parameters the server reported during startup.
    pub fn server_params(&self) -> &[(String, String)] {
        &self.server_params
    }

    /// Backend process ID, or 0 when the server did not send key data.
    pub fn backend_pid(&self) -> u32 {
        self.backend_key.as_ref().map_or(0, |k| k.process_id())
    }

    /// Transaction status from the most recent ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.txn_status
    }

    /// The most recent server error text; empty if none occurred.
    pub fn last_error_message(&self) -> &str {
        &self.last_error
    }

    /// A handle for cancelling this connection's in-flight command from
    /// another thread.
    pub fn cancel_handle(&self) -> Result<CancelHandle, CancelError> {
        let key = self
            .backend_key
            .as_ref()
            .ok_or_else(|| CancelError::RequestFailed("no backend key data".into()))?;

        let target = match &self.opts.socket {
            Some(path) => CancelTarget::Unix(path.clone()),
            None => CancelTarget::Tcp(self.opts.host.clone(), self.opts.port),
        };

        Ok(CancelHandle {
            target,
            pid: key.process_id(),
            secret: key.secret(),
        })
    }

    /// Issue `NOTIFY <channel>[, '<payload>']`.
    pub fn notify(&mut self, channel: &str, payload: Option<&str>) -> Result<()> {
        let sql = match payload {
            Some(text) => format!(
                "NOTIFY {}, {}",
                quote_identifier(channel),
                quote_literal(text)
            ),
            None => format!("NOTIFY {}", quote_identifier(channel)),
        };
        self.simple_query(&sql)?;
        Ok(())
    }

    /// Write the staged `write_buf` to the transport and flush.
    pub(crate) fn send(&mut self) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(ConnectionError::DoesNotExist)?;
        stream.write_all(&self.write_buf)?;
        stream.flush()?;
        Ok(())
    }

    /// Read the next message into the reusable buffer.
    ///
    /// A transport failure marks the connection bad.
    pub(crate) fn read_next(&mut self) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(ConnectionError::DoesNotExist)?;
        let result = read_message(stream, &mut self.msg);
        if result.is_err() {
            self.fatal = true;
        }
        result
    }

    /// Run a session command through the simple query protocol, discarding
    /// any rows. Returns the rows-affected count from the last command tag.
    pub(crate) fn simple_query(&mut self, sql: &str) -> Result<Option<u64>> {
        self.write_buf.clear();
        frontend::write_query(&mut self.write_buf, sql);
        self.send()?;

        let mut rows_affected = None;
        let mut failure: Option<QueryError> = None;

        loop {
            self.read_next()?;

            match self.msg.type_byte {
                msg_type::COMMAND_COMPLETE => {
                    let done = CommandComplete::parse(&self.msg.payload)?;
                    rows_affected = done.rows_affected();
                }
                msg_type::ROW_DESCRIPTION | msg_type::DATA_ROW => {
                    // session commands have no interesting rows
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
                other => {
                    self.handle_async_message(other)?;
                }
            }
        }

        match failure {
            Some(err) => Err(err.into()),
            None => Ok(rows_affected),
        }
    }

    /// Handle messages that can arrive at any point in the session.
    pub(crate) fn handle_async_message(&mut self, type_byte: u8) -> Result<()> {
        match type_byte {
            msg_type::NOTICE_RESPONSE => {
                let notice = backend::parse_server_message(&self.msg.payload)?;
                tracing::debug!(%notice, "server notice");
            }
            msg_type::PARAMETER_STATUS => {
                let status = ParameterStatus::parse(&self.msg.payload)?;
                let name = status.name.to_string();
                let value = status.value.to_string();
                match self.server_params.iter_mut().find(|(n, _)| *n == name) {
                    Some(entry) => entry.1 = value,
                    None => self.server_params.push((name, value)),
                }
            }
            msg_type::NOTIFICATION_RESPONSE => {
                let note = NotificationResponse::parse(&self.msg.payload)?;
                tracing::debug!(
                    channel = note.channel,
                    "notification on a non-listening connection, dropped"
                );
            }
            other => {
                return Err(QueryError::BadResponse(format!(
                    "unexpected message {:?}",
                    other as char
                ))
                .into());
            }
        }
        Ok(())
    }

    pub(crate) fn shutdown_handle(&self) -> Result<ShutdownHandle, ConnectionError> {
        match &self.stream {
            Some(stream) => Ok(stream.shutdown_handle()?),
            None => Err(ConnectionError::DoesNotExist),
        }
    }

    pub(crate) fn set_read_timeout(
        &self,
        timeout: Option<Duration>,
    ) -> Result<(), ConnectionError> {
        match &self.stream {
            Some(stream) => Ok(stream.set_read_timeout(timeout)?),
            None => Err(ConnectionError::DoesNotExist),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Cancels an in-flight command on another connection.
///
/// Cancellation is cooperative: the request is sent on a fresh socket and
/// the server decides when (and whether) the running command stops.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    target: CancelTarget,
    pid: u32,
    secret: u32,
}

#[derive(Debug, Clone)]
enum CancelTarget {
    Tcp(String, u16),
    Unix(String),
}

impl CancelHandle {
    /// Ask the server to abort the connection's current command.
    pub fn cancel(&self) -> Result<(), CancelError> {
        let mut buf = Vec::with_capacity(16);
        frontend::write_cancel_request(&mut buf, self.pid, self.secret);

        let io_result = match &self.target {
            CancelTarget::Tcp(host, port) => {
                TcpStream::connect((host.as_str(), *port)).and_then(|mut s| s.write_all(&buf))
            }
            CancelTarget::Unix(path) => {
                UnixStream::connect(path).and_then(|mut s| s.write_all(&buf))
            }
        };

        io_result.map_err(|e| CancelError::RequestFailed(e.to_string()))
    }
}

/// Quote a SQL identifier (channel names).
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a SQL string literal (notification payloads).
pub(crate) fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting() {
        assert_eq!(quote_identifier("jobs"), "\"jobs\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
    }

    #[test]
    fn connect_refused_is_io_error() {
        // port 1 on localhost is essentially never listening
        let result = Connection::connect("host=127.0.0.1 port=1 user=nobody");
        assert!(matches!(result, Err(ConnectionError::Io(_))));
    }
}
