//! Parameter encoding.
//!
//! Parameters are sent in text format, the server parses them with the
//! input function of the parameter type.
use bytes::Bytes;

use crate::postgres::{Oid, PgType, oid};

/// Value that can be encoded to be bound to sql parameter.
pub trait Encode {
    fn encode(&self) -> Encoded;
}

/// Postgres encoded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    value: Option<Bytes>,
    oid: Oid,
}

impl Encoded {
    pub fn new(value: impl Into<Bytes>, oid: Oid) -> Self {
        Self { value: Some(value.into()), oid }
    }

    /// NULL parameter of type `oid`.
    pub fn null(oid: Oid) -> Self {
        Self { value: None, oid }
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    /// Text representation, [`None`] for NULL.
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }
}

/// Encode a parameter list.
pub(crate) fn encode_all(params: &[&dyn Encode]) -> Vec<Encoded> {
    params.iter().map(|e| e.encode()).collect()
}

macro_rules! encode_itoa {
    ($($ty:ty),*) => {$(
        impl Encode for $ty {
            fn encode(&self) -> Encoded {
                let mut buf = itoa::Buffer::new();
                Encoded::new(Bytes::copy_from_slice(buf.format(*self).as_bytes()), <$ty>::OID)
            }
        }
    )*};
}

encode_itoa!(i16, i32, i64, u32);

macro_rules! encode_float {
    ($($ty:ty),*) => {$(
        impl Encode for $ty {
            fn encode(&self) -> Encoded {
                let text = if self.is_nan() {
                    String::from("NaN")
                } else if self.is_infinite() {
                    String::from(if self.is_sign_positive() { "Infinity" } else { "-Infinity" })
                } else {
                    self.to_string()
                };
                Encoded::new(text, <$ty>::OID)
            }
        }
    )*};
}

encode_float!(f32, f64);

impl Encode for bool {
    fn encode(&self) -> Encoded {
        Encoded::new(Bytes::from_static(if *self { b"t" } else { b"f" }), Self::OID)
    }
}

// strings are sent untyped so the server can coerce them to the
// parameter type the query expects
impl Encode for str {
    fn encode(&self) -> Encoded {
        Encoded::new(Bytes::copy_from_slice(self.as_bytes()), oid::UNSPECIFIED)
    }
}

impl Encode for String {
    fn encode(&self) -> Encoded {
        self.as_str().encode()
    }
}

impl<T: Encode + PgType> Encode for Option<T> {
    fn encode(&self) -> Encoded {
        match self {
            Some(value) => value.encode(),
            None => Encoded::null(T::OID),
        }
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self) -> Encoded {
        T::encode(self)
    }
}

impl Encode for Encoded {
    fn encode(&self) -> Encoded {
        self.clone()
    }
}
