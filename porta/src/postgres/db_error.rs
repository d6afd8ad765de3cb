//! Server reported diagnostics.
//!
//! <https://www.postgresql.org/docs/current/protocol-error-fields.html>
use bytes::{Buf, Bytes};
use std::fmt;

use super::{ErrorResponse, NoticeResponse, ProtocolError};
use crate::{common::ByteStr, ext::BytesExt};

/// Fields of an `ErrorResponse` or `NoticeResponse`, kept verbatim.
#[derive(Clone, Default)]
pub struct DbError {
    severity: ByteStr,
    severity_nonlocalized: Option<ByteStr>,
    code: ByteStr,
    message: ByteStr,
    detail: Option<ByteStr>,
    hint: Option<ByteStr>,
    position: Option<u32>,
    internal_position: Option<u32>,
    internal_query: Option<ByteStr>,
    where_: Option<ByteStr>,
    schema: Option<ByteStr>,
    table: Option<ByteStr>,
    column: Option<ByteStr>,
    datatype: Option<ByteStr>,
    constraint: Option<ByteStr>,
    file: Option<ByteStr>,
    line: Option<u32>,
    routine: Option<ByteStr>,
}

/// Broad category of a [`DbError`], derived from the SQLSTATE class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Errors related to the database operation, not necessarily under the
    /// control of the programmer, e.g. connection lost, object not in
    /// prerequisite state, serialization failure.
    Operational,
    /// Programming errors, e.g. syntax error, undefined table or cursor,
    /// duplicate cursor.
    Programming,
    /// Relational integrity violation, e.g. foreign key check failed.
    Integrity,
    /// Problems with the processed data, e.g. division by zero.
    Data,
    /// Internal database error, e.g. invalid transaction state.
    Internal,
    /// Feature not supported by the server.
    NotSupported,
    /// Any other database error.
    Database,
}

impl DbError {
    /// Parse the fields of an error or notice message body.
    pub fn parse(mut body: Bytes) -> Result<DbError, ProtocolError> {
        let mut me = DbError::default();

        while body.has_remaining() {
            let code = body.get_u8();
            if code == b'\0' {
                break;
            }
            let value = body.get_nul_bytestr()?;
            match code {
                b'S' => me.severity = value,
                b'V' => me.severity_nonlocalized = Some(value),
                b'C' => me.code = value,
                b'M' => me.message = value,
                b'D' => me.detail = Some(value),
                b'H' => me.hint = Some(value),
                b'P' => me.position = value.parse().ok(),
                b'p' => me.internal_position = value.parse().ok(),
                b'q' => me.internal_query = Some(value),
                b'W' => me.where_ = Some(value),
                b's' => me.schema = Some(value),
                b't' => me.table = Some(value),
                b'c' => me.column = Some(value),
                b'd' => me.datatype = Some(value),
                b'n' => me.constraint = Some(value),
                b'F' => me.file = Some(value),
                b'L' => me.line = value.parse().ok(),
                b'R' => me.routine = Some(value),
                // unrecognized fields are ignored
                _ => {}
            }
        }

        Ok(me)
    }

    /// Severity, possibly localized: `ERROR`, `FATAL`, `PANIC`, or a notice level.
    pub fn severity(&self) -> &str {
        &self.severity
    }

    /// Severity, never localized. Only present on servers 9.6 and later.
    pub fn severity_nonlocalized(&self) -> Option<&str> {
        self.severity_nonlocalized.as_deref()
    }

    /// The SQLSTATE code for the error.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The primary human-readable error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    /// Cursor position in the original query string, 1-based, in characters.
    pub fn position(&self) -> Option<u32> {
        self.position
    }

    pub fn internal_position(&self) -> Option<u32> {
        self.internal_position
    }

    pub fn internal_query(&self) -> Option<&str> {
        self.internal_query.as_deref()
    }

    /// Context in which the error occurred, e.g. a call stack traceback.
    pub fn where_(&self) -> Option<&str> {
        self.where_.as_deref()
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    pub fn column(&self) -> Option<&str> {
        self.column.as_deref()
    }

    pub fn datatype(&self) -> Option<&str> {
        self.datatype.as_deref()
    }

    pub fn constraint(&self) -> Option<&str> {
        self.constraint.as_deref()
    }

    /// Source file name where the error was reported.
    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }

    pub fn line(&self) -> Option<u32> {
        self.line
    }

    pub fn routine(&self) -> Option<&str> {
        self.routine.as_deref()
    }

    /// Category of this error from its SQLSTATE class.
    pub fn class(&self) -> ErrorClass {
        ErrorClass::from_sqlstate(&self.code)
    }
}

impl ErrorClass {
    /// Map a SQLSTATE code to its category, using the first two characters.
    pub fn from_sqlstate(code: &str) -> ErrorClass {
        match code.get(..2).unwrap_or_default() {
            "08" | "27" | "28" | "2F" | "38" | "39" | "3B" | "40" | "53" | "54" | "55" | "57"
            | "58" | "HV" => ErrorClass::Operational,
            "0A" => ErrorClass::NotSupported,
            "20" | "21" | "26" | "34" | "3D" | "3F" | "42" | "44" => ErrorClass::Programming,
            "22" => ErrorClass::Data,
            "23" => ErrorClass::Integrity,
            "24" | "25" | "2B" | "2D" | "F0" | "P0" | "XX" => ErrorClass::Internal,
            _ => ErrorClass::Database,
        }
    }
}

impl TryFrom<ErrorResponse> for DbError {
    type Error = ProtocolError;

    fn try_from(value: ErrorResponse) -> Result<Self, Self::Error> {
        DbError::parse(value.body)
    }
}

impl TryFrom<NoticeResponse> for DbError {
    type Error = ProtocolError;

    fn try_from(value: NoticeResponse) -> Result<Self, Self::Error> {
        DbError::parse(value.body)
    }
}

impl std::error::Error for DbError { }

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL: {detail}")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHINT: {hint}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbError")
            .field("severity", &self.severity)
            .field("code", &self.code)
            .field("message", &self.message)
            .field("detail", &self.detail)
            .field("hint", &self.hint)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}
