//! Sql string operation.
use std::fmt;

/// An sql identifier, quoted when displayed.
///
/// Quoting keeps the exact case and allows any character, a double quote
/// inside the name is escaped by doubling it.
///
/// ```
/// use porta::sql::Ident;
///
/// assert_eq!(Ident("my cursor").to_string(), r#""my cursor""#);
/// assert_eq!(Ident(r#"a"b"#).to_string(), r#""a""b""#);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Ident<'a>(pub &'a str);

impl fmt::Display for Ident<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"")?;
        let mut parts = self.0.split('"');
        if let Some(first) = parts.next() {
            f.write_str(first)?;
        }
        for part in parts {
            f.write_str("\"\"")?;
            f.write_str(part)?;
        }
        f.write_str("\"")
    }
}

/// Type that represent sql string.
pub trait Sql {
    /// Returns sql string.
    fn sql(&self) -> &str;
}

impl Sql for str {
    fn sql(&self) -> &str {
        self
    }
}

impl Sql for String {
    fn sql(&self) -> &str {
        self
    }
}

impl<S: Sql + ?Sized> Sql for &S {
    fn sql(&self) -> &str {
        S::sql(self)
    }
}

#[cfg(test)]
mod test {
    use super::Ident;

    #[test]
    fn quote_ident() {
        assert_eq!(Ident("c").to_string(), "\"c\"");
        assert_eq!(Ident("").to_string(), "\"\"");
        assert_eq!(Ident("\"").to_string(), "\"\"\"\"");
        assert_eq!(Ident("MiXed").to_string(), "\"MiXed\"");
    }
}
