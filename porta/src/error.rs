//! `porta` error types.
use std::{backtrace::Backtrace, borrow::Cow, fmt, io, str::Utf8Error};

use crate::{
    common::{GeneralError, unit_error},
    connection::ParseError,
    postgres::{DbError, ErrorClass, ProtocolError},
    pq::UnsupportedAuth,
    row::DecodeError,
};

/// A specialized [`Result`] type for `porta` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from `porta` library.
pub struct Error {
    context: Cow<'static, str>,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> ErrorKind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Prefix the error message with `context`.
    pub fn context(mut self, context: impl Into<Cow<'static, str>>) -> Self {
        self.context = context.into();
        self
    }

    /// Returns `true` if the connection can no longer be used.
    ///
    /// Reconnecting is the only recovery.
    pub fn is_connection(&self) -> bool {
        matches!(self.kind, ErrorKind::Io(_) | ErrorKind::Timeout(_))
    }

    /// Returns `true` if a deadline elapsed while waiting on the socket.
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout(_))
    }

    /// Returns the server reported error, if this is a database error.
    pub fn as_db_error(&self) -> Option<&DbError> {
        match &self.kind {
            ErrorKind::Database(db) => Some(db),
            _ => None,
        }
    }

    /// Category of a database error, [`None`] for any other error.
    pub fn class(&self) -> Option<ErrorClass> {
        self.as_db_error().map(DbError::class)
    }
}

/// All possible error kind from `porta` library.
pub enum ErrorKind {
    Config(ParseError),
    /// Socket failure, unexpected disconnect or flush failure.
    Io(io::Error),
    Protocol(ProtocolError),
    /// Server returned a fatal result, the connection remains usable.
    Database(DbError),
    /// Operation invalid in the current state, detected before any io.
    State(StateError),
    InvalidArgument(GeneralError),
    Timeout(TimeoutError),
    UnsupportedAuth(UnsupportedAuth),
    /// Authentication exchange failed.
    Auth(GeneralError),
    Decode(DecodeError),
    Utf8(Utf8Error),
}

/// An operation was invoked on an object in a state that does not allow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    /// The cursor has been closed.
    CursorClosed,
    /// The cursor has not been bound to a server portal.
    CursorNotExecuted,
    /// The cursor is already bound to a server portal.
    CursorAlreadyExecuted,
    /// The connection has been closed.
    ConnectionClosed,
    /// The operation is not allowed inside a transaction block.
    TransactionOpen,
}

impl std::error::Error for StateError { }

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CursorClosed => "the cursor is closed",
            Self::CursorNotExecuted => "the cursor has not been executed",
            Self::CursorAlreadyExecuted => "the cursor has already been executed",
            Self::ConnectionClosed => "the connection is closed",
            Self::TransactionOpen => "operation not allowed inside a transaction",
        })
    }
}

unit_error! {
    /// A deadline elapsed while waiting for the socket to become ready.
    pub struct TimeoutError("timed out waiting for the server");
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: Cow::Borrowed(""), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ParseError>e => ErrorKind::Config(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<io::Error>e => ErrorKind::Io(e));
from!(<DbError>e => ErrorKind::Database(e));
from!(<StateError>e => ErrorKind::State(e));
from!(<TimeoutError>e => ErrorKind::Timeout(e));
from!(<UnsupportedAuth>e => ErrorKind::UnsupportedAuth(e));
from!(<DecodeError>e => ErrorKind::Decode(e));
from!(<Utf8Error>e => ErrorKind::Utf8(e));

impl Error {
    pub(crate) fn invalid_argument(err: GeneralError) -> Error {
        ErrorKind::InvalidArgument(err).into()
    }

    pub(crate) fn auth(err: GeneralError) -> Error {
        ErrorKind::Auth(err).into()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Io(e) => Some(e),
            ErrorKind::Database(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => fmt::Display::fmt(e, f),
            Self::Io(e) => fmt::Display::fmt(e, f),
            Self::Protocol(e) => fmt::Display::fmt(e, f),
            Self::Database(e) => fmt::Display::fmt(e, f),
            Self::State(e) => fmt::Display::fmt(e, f),
            Self::InvalidArgument(e) => fmt::Display::fmt(e, f),
            Self::Timeout(e) => fmt::Display::fmt(e, f),
            Self::UnsupportedAuth(e) => fmt::Display::fmt(e, f),
            Self::Auth(e) => write!(f, "authentication failed: {e}"),
            Self::Decode(e) => fmt::Display::fmt(e, f),
            Self::Utf8(e) => fmt::Display::fmt(e, f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
