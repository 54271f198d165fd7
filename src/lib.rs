//! A PostgreSQL client with a dynamically typed row value model.
//!
//! # Features
//!
//! - **Binary-format decoding**: results travel in the server's binary
//!   format and decode through an OID-keyed type registry into [`Value`]
//! - **Owned connections**: the transport handle is exclusively owned and
//!   released exactly once, on every exit path
//! - **Streaming rows**: pull decoded rows one at a time; abandoning the
//!   stream drains the connection so it stays usable
//! - **LISTEN/NOTIFY**: event-driven notification delivery on a dedicated
//!   listener connection
//!
//! # Example
//!
//! ```no_run
//! use dyn_postgres::{Connection, Value};
//!
//! fn main() -> dyn_postgres::Result<()> {
//!     let mut conn = Connection::connect("host=localhost user=postgres dbname=mydb")?;
//!
//!     let result = conn.execute("SELECT $1::int8 AS num", &[Value::Int(42)])?;
//!     for row in &result.rows {
//!         println!("num = {:?}", row["num"]);
//!     }
//!
//!     conn.close();
//!     Ok(())
//! }
//! ```

pub mod bind;
pub mod connection;
pub mod error;
pub mod listener;
pub mod opts;
pub mod protocol;
pub mod query;
pub mod registry;
pub mod transaction;
pub mod value;

pub use bind::Bind;
pub use connection::{CancelHandle, ConnStatus, Connection};
pub use error::{CancelError, ConnectionError, Error, QueryError, Result, ServerMessage};
pub use listener::{Listener, Notification};
pub use opts::Opts;
pub use protocol::types::{FormatCode, Oid, TransactionStatus};
pub use query::{QueryResult, ResultStatus, RowStream};
pub use registry::SessionConfig;
pub use transaction::IsolationLevel;
pub use value::{Row, Value};
