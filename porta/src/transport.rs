//! The [`PgTransport`] trait.
use std::os::fd::RawFd;

use crate::{Result, encode::Encoded, pq::PgResult};

/// Transaction state of the session, as reported by the last `ReadyForQuery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Not in a transaction block.
    Idle,
    /// A command is in progress.
    Active,
    /// Idle, in a valid transaction block.
    InTransaction,
    /// Idle, in a failed transaction block, queries are rejected until the block ends.
    InError,
    /// The connection is bad.
    Unknown,
}

impl TransactionStatus {
    pub(crate) fn from_indicator(indicator: u8) -> TransactionStatus {
        match indicator {
            b'I' => Self::Idle,
            b'T' => Self::InTransaction,
            b'E' => Self::InError,
            _ => Self::Unknown,
        }
    }
}

/// A non-blocking postgres session which can dispatch one command and
/// hand out its results.
///
/// Every primitive returns immediately. Waiting on [`socket`][1] readiness
/// is left to the caller, see [`engine`][crate::engine].
///
/// Only one command may be in flight: a send while a previous command
/// still has results pending fails with
/// [`ProtocolError::CommandInProgress`][crate::postgres::ProtocolError::CommandInProgress].
///
/// [1]: PgTransport::socket
pub trait PgTransport {
    /// Dispatch a simple query, which may contain several statements.
    fn send_query(&mut self, sql: &str) -> Result<()>;

    /// Dispatch a single statement with text format parameters.
    fn send_query_params(&mut self, sql: &str, params: &[Encoded]) -> Result<()>;

    /// Request the description of the portal `name`.
    fn send_describe_portal(&mut self, name: &str) -> Result<()>;

    /// Try to write buffered output.
    ///
    /// Returns `true` if some output is still pending.
    fn flush(&mut self) -> Result<bool>;

    /// Read whatever input is available without blocking.
    fn consume_input(&mut self) -> Result<()>;

    /// Returns `true` if [`get_result`][1] would have to wait for more input.
    ///
    /// [1]: PgTransport::get_result
    fn is_busy(&self) -> bool;

    /// Take the next complete result.
    ///
    /// Returns [`None`] once the current command has no more results.
    fn get_result(&mut self) -> Option<PgResult>;

    /// Descriptor to wait on for readiness.
    fn socket(&self) -> Result<RawFd>;

    fn transaction_status(&self) -> TransactionStatus;

    /// Value of the `client_encoding` server parameter.
    fn client_encoding(&self) -> &str;

    /// Returns `true` if the session is closed or broken.
    fn is_closed(&self) -> bool;

    /// Terminate the session and release the socket, calling it again is a no-op.
    fn finish(&mut self);
}

impl<P> PgTransport for &mut P where P: PgTransport {
    fn send_query(&mut self, sql: &str) -> Result<()> {
        P::send_query(self, sql)
    }

    fn send_query_params(&mut self, sql: &str, params: &[Encoded]) -> Result<()> {
        P::send_query_params(self, sql, params)
    }

    fn send_describe_portal(&mut self, name: &str) -> Result<()> {
        P::send_describe_portal(self, name)
    }

    fn flush(&mut self) -> Result<bool> {
        P::flush(self)
    }

    fn consume_input(&mut self) -> Result<()> {
        P::consume_input(self)
    }

    fn is_busy(&self) -> bool {
        P::is_busy(self)
    }

    fn get_result(&mut self) -> Option<PgResult> {
        P::get_result(self)
    }

    fn socket(&self) -> Result<RawFd> {
        P::socket(self)
    }

    fn transaction_status(&self) -> TransactionStatus {
        P::transaction_status(self)
    }

    fn client_encoding(&self) -> &str {
        P::client_encoding(self)
    }

    fn is_closed(&self) -> bool {
        P::is_closed(self)
    }

    fn finish(&mut self) {
        P::finish(self);
    }
}
