//! Postgres client with server-side cursors, blocking and async.
//!
//! Protocol sequences are written once as resumable generators
//! ([`engine`]) and driven either by blocking the thread or by suspending a
//! tokio task ([`waiting`]). A connection serializes every command behind
//! one lock shared by its blocking and async handles.
//!
//! # Examples
//!
//! Blocking:
//!
//! ```no_run
//! use porta::Connection;
//!
//! # fn app() -> porta::Result<()> {
//! let conn = Connection::connect_env()?;
//!
//! let mut cursor = conn.cursor_auto();
//! cursor.execute("SELECT generate_series(1, $1)", &[&1000])?;
//! cursor.set_itersize(250);
//!
//! let mut sum = 0i64;
//! for row in cursor.iter() {
//!     sum += row?.try_get::<_, i64>(0)?;
//! }
//! assert_eq!(sum, 500500);
//!
//! cursor.close()?;
//! conn.commit()?;
//! # Ok(())
//! # }
//! ```
//!
//! Async:
//!
//! ```no_run
//! use porta::AsyncConnection;
//!
//! # async fn app() -> porta::Result<()> {
//! let conn = AsyncConnection::connect_env().await?;
//!
//! let mut cursor = conn.cursor("numbers");
//! cursor.execute("SELECT generate_series(0, 5)", &[]).await?;
//!
//! cursor.scroll(-2, "absolute").await?;
//! let row = cursor.fetchone().await?.unwrap();
//! assert_eq!(row.try_get::<_, i32>(0)?, 5);
//!
//! cursor.close().await?;
//! conn.rollback().await?;
//! # Ok(())
//! # }
//! ```

pub mod common;
mod ext;

// Protocol
pub mod postgres;
pub mod pq;
pub mod transport;

// Encoding
pub mod encode;
pub mod row;
pub mod sql;

// Execution
pub mod engine;
pub mod waiting;

// Connection
pub mod connection;
pub mod cursor;

pub mod error;

#[cfg(test)]
mod testing;

pub use encode::Encode;
pub use row::{Row, FromRow, Decode, DecodeError};

pub use pq::{PgConn, PgResult, ExecStatus};
pub use transport::{PgTransport, TransactionStatus};
pub use connection::{Connection, Config};
pub use cursor::{NamedCursor, CursorState, ScrollMode, DeclareOptions};
pub use connection::AsyncConnection;
pub use cursor::AsyncNamedCursor;
pub use error::{Error, Result};
