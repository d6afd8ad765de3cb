/// Postgres data transmission format.
///
/// Values are exchanged in [`Text`][t] format by this library, parameters and
/// result columns alike.
///
/// <https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES>
///
/// [t]: PgFormat::Text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgFormat {
    /// Text has format code zero.
    ///
    /// In the [`Text`][t] transmitted representation, there is no trailing null character.
    ///
    /// [t]: PgFormat::Text
    Text,
    /// Binary has format code one.
    Binary,
}

impl PgFormat {
    /// Return format code for current format.
    pub fn format_code(&self) -> u16 {
        match self {
            PgFormat::Text => 0,
            PgFormat::Binary => 1,
        }
    }

    /// Returns format from a format code, unknown codes are treated as binary.
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => PgFormat::Text,
            _ => PgFormat::Binary,
        }
    }
}
