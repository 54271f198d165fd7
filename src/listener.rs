//! Asynchronous LISTEN/NOTIFY delivery.
//!
//! A listener owns a dedicated connection outright, so notification
//! draining never races an in-flight query's row consumption; callers run
//! their queries on a separate connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::connection::{Connection, ShutdownHandle, quote_identifier};
use crate::error::{ConnectionError, Error, Result};
use crate::protocol::backend::{self, NotificationResponse, msg_type};

/// One server-pushed notification event.
///
/// Ephemeral: handed to the callback and then discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Channel the notification was sent on
    pub channel: String,
    /// PID of the sending backend
    pub pid: u32,
    /// Payload text; empty when the sender gave none
    pub payload: String,
}

/// A caller-owned subscription to one notification channel.
///
/// The callback runs on the subscription's delivery thread, once per
/// notification, in arrival order. Delivery is event-driven: the thread
/// sleeps in a blocking socket read and wakes only when the server sends
/// bytes. Connection loss is delivered as one terminal `Err` callback,
/// after which no further events follow.
pub struct Listener {
    channel: String,
    closed: Arc<AtomicBool>,
    waker: Option<ShutdownHandle>,
    thread: Option<JoinHandle<()>>,
}

impl Listener {
    /// Subscribe to `channel` on the given connection.
    ///
    /// Issues `LISTEN <channel>` and moves the connection onto a dedicated
    /// delivery thread.
    pub fn spawn<F>(conn: Connection, channel: &str, callback: F) -> Result<Self>
    where
        F: FnMut(Result<Notification>) + Send + 'static,
    {
        Self::spawn_inner(conn, channel, None, callback)
    }

    /// Subscribe using the legacy polling mode.
    ///
    /// The delivery thread wakes every `interval` even when no traffic
    /// arrived, burning cycles for nothing; it also assumes notifications
    /// arrive as whole messages between wakeups.
    #[deprecated(note = "polling wastes cycles; use `spawn`, which wakes on socket readability")]
    pub fn spawn_polling<F>(
        conn: Connection,
        channel: &str,
        interval: Duration,
        callback: F,
    ) -> Result<Self>
    where
        F: FnMut(Result<Notification>) + Send + 'static,
    {
        Self::spawn_inner(conn, channel, Some(interval), callback)
    }

    fn spawn_inner<F>(
        mut conn: Connection,
        channel: &str,
        poll_interval: Option<Duration>,
        callback: F,
    ) -> Result<Self>
    where
        F: FnMut(Result<Notification>) + Send + 'static,
    {
        conn.simple_query(&format!("LISTEN {}", quote_identifier(channel)))?;
        if let Some(interval) = poll_interval {
            conn.set_read_timeout(Some(interval))?;
        }

        let waker = conn.shutdown_handle()?;
        let closed = Arc::new(AtomicBool::new(false));
        let closed_flag = Arc::clone(&closed);
        let polling = poll_interval.is_some();

        let thread = thread::Builder::new()
            .name(format!("pg-listen-{}", channel))
            .spawn(move || listen_loop(conn, &closed_flag, polling, callback))
            .map_err(ConnectionError::Io)?;

        Ok(Self {
            channel: channel.to_string(),
            closed,
            waker: Some(waker),
            thread: Some(thread),
        })
    }

    /// The subscribed channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Cancel the subscription and release its connection.
    ///
    /// Wakes the delivery thread, joins it, and closes the connection,
    /// which also drops the server-side channel registration. Calling
    /// `close` again is a no-op.
    pub fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(waker) = self.waker.take() {
            waker.shutdown();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

fn listen_loop<F>(mut conn: Connection, closed: &AtomicBool, polling: bool, mut callback: F)
where
    F: FnMut(Result<Notification>) + Send + 'static,
{
    loop {
        match conn.read_next() {
            Err(err) => {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                if polling && is_timeout(&err) {
                    continue;
                }
                // terminal: the connection is gone, no further events follow
                tracing::debug!(error = %err, "listener connection lost");
                callback(Err(ConnectionError::DoesNotExist.into()));
                break;
            }
            Ok(()) => match conn.msg.type_byte {
                msg_type::NOTIFICATION_RESPONSE => {
                    match NotificationResponse::parse(&conn.msg.payload) {
                        Ok(raw) => callback(Ok(Notification {
                            channel: raw.channel.to_string(),
                            pid: raw.pid,
                            payload: raw.payload.to_string(),
                        })),
                        Err(err) => {
                            callback(Err(err.into()));
                            break;
                        }
                    }
                }
                msg_type::ERROR_RESPONSE => {
                    if let Ok(server) = backend::parse_server_message(&conn.msg.payload) {
                        tracing::warn!(%server, "server error on listener connection");
                        if server.is_fatal() {
                            callback(Err(ConnectionError::DoesNotExist.into()));
                            break;
                        }
                    }
                }
                other => {
                    // notices and parameter changes are logged and skipped
                    if let Err(err) = conn.handle_async_message(other) {
                        tracing::debug!(error = %err, "unexpected message on listener connection");
                    }
                }
            },
        }
    }
}

fn is_timeout(err: &Error) -> bool {
    matches!(
        err,
        Error::Connection(ConnectionError::Io(io))
            if matches!(io.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_detection() {
        let timeout: Error =
            ConnectionError::Io(std::io::Error::from(std::io::ErrorKind::WouldBlock)).into();
        assert!(is_timeout(&timeout));

        let eof: Error =
            ConnectionError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)).into();
        assert!(!is_timeout(&eof));
    }
}
