//! Error types for dyn-postgres.

use thiserror::Error;

/// Result type for dyn-postgres operations.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// A structured error or notice reported by the server.
///
/// Field meanings follow the ErrorResponse/NoticeResponse wire format.
/// Less common fields (schema, table, source location) are dropped during
/// parsing; the ones kept are the ones surfaced to callers.
#[derive(Debug, Clone, Default)]
pub struct ServerMessage {
    /// Severity: ERROR, FATAL, PANIC, WARNING, NOTICE, DEBUG, INFO, LOG
    pub severity: Option<String>,
    /// SQLSTATE error code (5 characters)
    pub code: Option<String>,
    /// Primary human-readable message
    pub message: Option<String>,
    /// Detailed error explanation
    pub detail: Option<String>,
    /// Suggestion for fixing the error
    pub hint: Option<String>,
    /// Cursor position in the query string (1-based)
    pub position: Option<u32>,
}

impl std::fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(severity) = &self.severity {
            write!(f, "{}: ", severity)?;
        }
        if let Some(message) = &self.message {
            write!(f, "{}", message)?;
        }
        if let Some(code) = &self.code {
            write!(f, " (SQLSTATE {})", code)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL: {}", detail)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHINT: {}", hint)?;
        }
        Ok(())
    }
}

impl ServerMessage {
    /// True for FATAL/PANIC severities, after which the session is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self.severity.as_deref(), Some("FATAL") | Some("PANIC"))
    }
}

/// Failures while establishing, resetting, or using the transport.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The startup handshake did not reach the ready state.
    #[error("could not establish connection: {0}")]
    EstablishFailed(String),

    /// A reset left the connection in a non-ok state.
    #[error("connection reset failed: {0}")]
    ResetFailed(String),

    /// The connection has been closed or was never opened.
    #[error("connection does not exist")]
    DoesNotExist,

    /// Transport-level I/O failure.
    #[error("connection i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reported for a single query.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The server rejected the statement.
    #[error("invalid sql: {0}")]
    InvalidSql(ServerMessage),

    /// The statement text was empty.
    #[error("empty query")]
    EmptyQuery,

    /// The server violated protocol framing.
    #[error("bad response from server: {0}")]
    BadResponse(String),

    /// A row was required but the result contained none.
    #[error("query returned no results")]
    NoResults,

    /// The driver was asked to do something it does not support.
    #[error("invalid usage: {0}")]
    InvalidUsage(String),
}

/// Failures while asking the server to cancel an in-flight command.
#[derive(Debug, Error)]
pub enum CancelError {
    /// The cancel request could not be delivered.
    #[error("cancel request failed: {0}")]
    RequestFailed(String),
}

/// Error type for dyn-postgres.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Cancel(#[from] CancelError),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Connection(ConnectionError::Io(err))
    }
}

impl From<std::convert::Infallible> for ConnectionError {
    fn from(err: std::convert::Infallible) -> Self {
        match err {}
    }
}

impl Error {
    /// The server's own error text, if this error carries one.
    pub fn server_message(&self) -> Option<&ServerMessage> {
        match self {
            Error::Query(QueryError::InvalidSql(msg)) => Some(msg),
            _ => None,
        }
    }

    /// The SQLSTATE code, if this is a server-reported error.
    pub fn sqlstate(&self) -> Option<&str> {
        self.server_message().and_then(|m| m.code.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_message_display() {
        let msg = ServerMessage {
            severity: Some("ERROR".into()),
            code: Some("42601".into()),
            message: Some("syntax error at or near \"SELEC\"".into()),
            ..Default::default()
        };
        let text = msg.to_string();
        assert!(text.starts_with("ERROR: syntax error"));
        assert!(text.contains("SQLSTATE 42601"));
    }

    #[test]
    fn fatal_severity() {
        let mut msg = ServerMessage::default();
        assert!(!msg.is_fatal());
        msg.severity = Some("FATAL".into());
        assert!(msg.is_fatal());
    }

    #[test]
    fn sqlstate_only_for_server_errors() {
        let err = Error::Query(QueryError::InvalidSql(ServerMessage {
            code: Some("42601".into()),
            ..Default::default()
        }));
        assert_eq!(err.sqlstate(), Some("42601"));
        assert_eq!(Error::Query(QueryError::EmptyQuery).sqlstate(), None);
    }
}
