//! Postgres session handle and command results.
//!
//! [`PgConn`] is a non-blocking session in the manner of libpq: commands
//! are dispatched with `send_*`, output is written with `flush`, input is
//! read with `consume_input`, and results are taken with `get_result`.
mod socket;
mod conn;
mod result;
mod startup;
mod auth;

pub use socket::Socket;
pub use conn::PgConn;
pub use result::{ExecStatus, Field, PgResult};
pub use auth::UnsupportedAuth;

#[cfg(test)]
pub(crate) use result::tuples;
