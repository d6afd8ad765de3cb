//! Protocol error
use std::fmt;

use super::BackendMessage;

/// An error when translating buffer from postgres, or when the
/// message flow does not follow the protocol.
pub enum ProtocolError {
    /// Received message is not the one the current phase expects.
    Unexpected {
        expect: Option<u8>,
        found: u8,
        phase: Option<&'static str>,
    },
    /// Server requested an authentication method code this library does not know.
    UnknownAuth {
        auth: u32,
    },
    /// Message body does not match its declared layout.
    Malformed {
        message: &'static str,
    },
    /// A command was dispatched while another one is still in flight.
    CommandInProgress,
    /// A round trip completed without producing any result.
    NoResult,
}

impl std::error::Error for ProtocolError { }

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ProtocolError::Unexpected { expect, found, phase } => {
                let found = BackendMessage::message_name(found);
                match expect {
                    Some(m) => {
                        write!(
                            f,
                            "Expected message `{}` found `{found}`",
                            BackendMessage::message_name(m),
                        )?
                    },
                    None => write!(f, "Unexpected message `{found}`")?,
                }
                if let Some(phase) = phase {
                    write!(f, " in `{phase}`")?
                }
                Ok(())
            },
            ProtocolError::UnknownAuth { auth } => {
                write!(f, "Unknown authentication method code `{auth}`")
            },
            ProtocolError::Malformed { message } => write!(f, "Malformed message: {message}"),
            ProtocolError::CommandInProgress => f.write_str("another command is already in progress"),
            ProtocolError::NoResult => f.write_str("the command produced no result"),
        }
    }
}

impl fmt::Debug for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl ProtocolError {
    pub(crate) fn unknown(found: u8) -> ProtocolError {
        Self::Unexpected {
            expect: None,
            found,
            phase: None,
        }
    }

    pub(crate) fn unexpected(expect: u8, found: u8) -> ProtocolError {
        Self::Unexpected {
            expect: Some(expect),
            found,
            phase: None,
        }
    }

    pub(crate) fn unexpected_phase(found: u8, phase: &'static str) -> ProtocolError {
        Self::Unexpected {
            expect: None,
            found,
            phase: Some(phase),
        }
    }

    pub(crate) fn unknown_auth(auth: u32) -> ProtocolError {
        Self::UnknownAuth { auth }
    }

    pub(crate) fn malformed(message: &'static str) -> ProtocolError {
        Self::Malformed { message }
    }
}

#[cfg(test)]
mod test {
    use super::ProtocolError;

    #[test]
    fn display() {
        assert_eq!(
            ProtocolError::unexpected(b'Z', b'D').to_string(),
            "Expected message `ReadyForQuery` found `DataRow`",
        );
        assert_eq!(
            ProtocolError::unexpected_phase(b'T', "startup").to_string(),
            "Unexpected message `RowDescription` in `startup`",
        );
        assert_eq!(
            ProtocolError::CommandInProgress.to_string(),
            "another command is already in progress",
        );
    }
}
