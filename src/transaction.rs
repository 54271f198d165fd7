//! Transaction control: BEGIN/COMMIT/ROLLBACK around a unit of work.

use crate::connection::Connection;
use crate::error::{Error, QueryError, Result};

/// Transaction isolation level for [`Connection::run_transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Each statement sees only rows committed before it began.
    #[default]
    ReadCommitted,
    /// All statements see the snapshot taken at transaction start.
    RepeatableRead,
    /// Fully serializable execution.
    Serializable,
}

impl IsolationLevel {
    /// The SQL spelling used in the BEGIN statement.
    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl Connection {
    /// Run a unit of work inside a transaction.
    ///
    /// Issues `BEGIN TRANSACTION ISOLATION LEVEL ...`, invokes the closure,
    /// and commits on success. Any closure error triggers a ROLLBACK and is
    /// returned unchanged; a failure of the rollback itself is logged but
    /// never masks the original error.
    ///
    /// Nesting is not supported: calling this while already inside a
    /// transaction fails fast without touching the wire.
    pub fn run_transaction<F, R>(&mut self, isolation: IsolationLevel, work: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R>,
    {
        if self.transaction_status().in_transaction() {
            return Err(QueryError::InvalidUsage(
                "nested transactions are not supported".into(),
            )
            .into());
        }

        self.simple_query(&format!(
            "BEGIN TRANSACTION ISOLATION LEVEL {}",
            isolation.as_sql()
        ))?;

        match work(self) {
            Ok(value) => {
                self.simple_query("COMMIT")?;
                Ok(value)
            }
            Err(original) => {
                if let Err(rollback_err) = self.rollback_quietly() {
                    tracing::warn!(
                        error = %rollback_err,
                        "rollback after failed transaction also failed"
                    );
                }
                Err(original)
            }
        }
    }

    fn rollback_quietly(&mut self) -> Result<(), Error> {
        self.simple_query("ROLLBACK").map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolation_level_sql() {
        assert_eq!(IsolationLevel::ReadCommitted.as_sql(), "READ COMMITTED");
        assert_eq!(IsolationLevel::RepeatableRead.as_sql(), "REPEATABLE READ");
        assert_eq!(IsolationLevel::Serializable.as_sql(), "SERIALIZABLE");
        assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
    }
}
