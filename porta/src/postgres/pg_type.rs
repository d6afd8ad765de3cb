/// Postgres object identifier.
///
/// The oid type is implemented as an unsigned four-byte integer.
///
/// <https://www.postgresql.org/docs/current/datatype-oid.html>
pub type Oid = u32;

/// A type that have corresponding postgres oid.
pub trait PgType {
    const OID: Oid;

    /// Returns `true` if a column of type `oid` can be decoded into this type.
    fn accepts(oid: Oid) -> bool {
        oid == Self::OID
    }
}

/// Well known type oids.
pub mod oid {
    use super::Oid;

    /// Type unspecified, server infers it from context.
    pub const UNSPECIFIED: Oid = 0;
    pub const BOOL: Oid = 16;
    pub const NAME: Oid = 19;
    pub const INT8: Oid = 20;
    pub const INT2: Oid = 21;
    pub const INT4: Oid = 23;
    pub const TEXT: Oid = 25;
    pub const OID: Oid = 26;
    pub const FLOAT4: Oid = 700;
    pub const FLOAT8: Oid = 701;
    pub const UNKNOWN: Oid = 705;
    pub const BPCHAR: Oid = 1042;
    pub const VARCHAR: Oid = 1043;
    pub const NUMERIC: Oid = 1700;
    pub const REFCURSOR: Oid = 1790;
}

macro_rules! oid {
    ($ty:ty, $oid:expr $(, [$($acc:expr),*])? $(; $doc:literal)? ) => {
        impl PgType for $ty {
            $(#[doc = $doc])?
            const OID: Oid = $oid;

            $(
            fn accepts(oid: Oid) -> bool {
                oid == Self::OID $(|| oid == $acc)*
            }
            )?
        }
    };
}

oid!(bool, oid::BOOL);
oid!(i16, oid::INT2; "`int2` -32 thousand to 32 thousand, 2-byte storage");
oid!(i32, oid::INT4, [oid::INT2]; "`int4` -2 billion to 2 billion integer, 4-byte storage");
oid!(i64, oid::INT8, [oid::INT2, oid::INT4, oid::OID]; "`int8` ~18 digit integer, 8-byte storage");
oid!(u32, oid::OID; "`oid` object identifier");
oid!(f32, oid::FLOAT4, [oid::INT2]; "`float4` single-precision floating point number, 4-byte storage");
oid!(
    f64, oid::FLOAT8,
    [oid::FLOAT4, oid::INT2, oid::INT4, oid::INT8, oid::NUMERIC];
    "`float8` double-precision floating point number, 8-byte storage"
);

impl PgType for str {
    /// `text` variable-length string, no limit specified
    const OID: Oid = oid::TEXT;

    /// Text format lets any column be read as its textual representation.
    fn accepts(_: Oid) -> bool {
        true
    }
}

impl PgType for String {
    const OID: Oid = oid::TEXT;

    fn accepts(oid: Oid) -> bool {
        str::accepts(oid)
    }
}
