//! Postgres row operation.
//!
//! - [`Row`]
//! - [`Column`]
//! - [`FromRow`]
//! - [`Decode`]
//!
//! - [`Index`]
//! - [`DecodeError`]
//!
//! Values are received in text format and parsed on decode.
use bytes::Bytes;
use std::{borrow::Cow, fmt, str::Utf8Error, string::FromUtf8Error, sync::Arc};

use crate::{
    common::ByteStr,
    ext::FmtExt,
    postgres::{Oid, PgType},
    pq::Field,
};

/// Postgres row.
#[derive(Clone)]
pub struct Row {
    fields: Arc<[Field]>,
    values: Vec<Option<Bytes>>,
}

impl Row {
    pub(crate) fn new(fields: Arc<[Field]>, values: Vec<Option<Bytes>>) -> Self {
        debug_assert_eq!(fields.len(), values.len(), "RowDescription len missmatch with DataRow len");
        Self { fields, values }
    }

    /// Returns `true` if row contains no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the number of fields/column.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Column descriptors shared by every row of the same result.
    pub fn fields(&self) -> &Arc<[Field]> {
        &self.fields
    }

    /// Raw text value of the `nth` column, [`None`] for NULL or out of bounds.
    pub fn get_raw(&self, nth: usize) -> Option<&[u8]> {
        self.values.get(nth)?.as_deref()
    }

    /// Try get column.
    pub fn column<I: Index>(&self, idx: I) -> Result<Column, DecodeError> {
        let nth = idx.position(&self.fields)?;
        let field = &self.fields[nth];
        Ok(Column {
            name: ByteStr::copy_from_str(field.name()),
            oid: field.type_oid(),
            value: self.values[nth].clone(),
        })
    }

    /// Try get and decode column.
    pub fn try_get<I: Index, R: Decode>(&self, idx: I) -> Result<R, DecodeError> {
        R::decode(self.column(idx)?)
    }

    /// Try decode type using [`FromRow`] implementation.
    pub fn decode<D: FromRow>(self) -> Result<D, DecodeError> {
        D::from_row(self)
    }
}

impl IntoIterator for Row {
    type Item = Column;

    type IntoIter = IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        IntoIter {
            fields: self.fields,
            values: self.values.into_iter(),
            iter_n: 0,
        }
    }
}

/// [`IntoIterator`] implementation from [`Row`].
#[derive(Debug)]
pub struct IntoIter {
    fields: Arc<[Field]>,
    values: std::vec::IntoIter<Option<Bytes>>,
    iter_n: usize,
}

impl Iterator for IntoIter {
    type Item = Column;

    fn next(&mut self) -> Option<Self::Item> {
        let value = self.values.next()?;
        let field = self.fields.get(self.iter_n)?;
        self.iter_n += 1;
        Some(Column {
            name: ByteStr::copy_from_str(field.name()),
            oid: field.type_oid(),
            value,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.values.size_hint()
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_map();
        for (field, value) in self.fields.iter().zip(&self.values) {
            dbg.key(&field.name());
            match value {
                None => dbg.value(&format_args!("NULL")),
                Some(v) => dbg.value(&v.lossy()),
            };
        }
        dbg.finish()
    }
}

/// Postgres column.
#[derive(Debug, Clone)]
pub struct Column {
    oid: Oid,
    value: Option<Bytes>,
    name: ByteStr,
}

impl Column {
    /// Returns column [`Oid`].
    pub const fn oid(&self) -> Oid {
        self.oid
    }

    /// Returns column name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return `true` if value is NULL.
    pub const fn is_null(&self) -> bool {
        self.value.is_none()
    }

    /// Extract the inner bytes as slice.
    ///
    /// Returns [`None`] if value is `NULL`.
    pub fn as_slice(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Consume self into the inner [`Bytes`].
    pub fn into_value(self) -> Option<Bytes> {
        self.value
    }

    /// Try consume self into the inner [`Bytes`].
    ///
    /// Return [`DecodeError::Null`] if value is `NULL`.
    pub fn try_into_value(self) -> Result<Bytes, DecodeError> {
        self.value.ok_or(DecodeError::Null)
    }

    /// Try decode type using [`Decode`] implementation.
    pub fn decode<D: Decode>(self) -> Result<D, DecodeError> {
        D::decode(self)
    }

    fn text<T: PgType + ?Sized>(&self) -> Result<&str, DecodeError> {
        if !T::accepts(self.oid) {
            return Err(DecodeError::OidMissmatch(self.oid));
        }
        let value = self.value.as_deref().ok_or(DecodeError::Null)?;
        Ok(std::str::from_utf8(value)?)
    }
}

// ===== Traits =====

/// Type that can be constructed from a row.
pub trait FromRow: Sized {
    /// Construct self from row.
    fn from_row(row: Row) -> Result<Self, DecodeError>;
}

impl FromRow for Row {
    fn from_row(row: Row) -> Result<Self, DecodeError> {
        Ok(row)
    }
}

impl FromRow for () {
    fn from_row(_: Row) -> Result<Self, DecodeError> {
        Ok(())
    }
}

macro_rules! from_row_tuple {
    ($($t:ident $i:literal),*) => {
        impl<$($t),*> FromRow for ($($t),*,)
        where
            $($t: Decode),*
        {
            fn from_row(row: Row) -> Result<Self, DecodeError> {
                Ok((
                    $(row.try_get($i)?),*,
                ))
            }
        }
    };
}

from_row_tuple!(T0 0);
from_row_tuple!(T0 0, T1 1);
from_row_tuple!(T0 0, T1 1, T2 2);
from_row_tuple!(T0 0, T1 1, T2 2, T3 3);

/// A type that can be constructed from [`Column`].
pub trait Decode: Sized {
    /// Try decode self from column.
    fn decode(column: Column) -> Result<Self, DecodeError>;
}

impl Decode for Column {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        Ok(column)
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(column: Column) -> Result<Self, DecodeError> {
        match column.is_null() {
            true => Ok(None),
            false => column.decode().map(Some),
        }
    }
}

macro_rules! decode_parse {
    ($($ty:ty),*) => {$(
        impl Decode for $ty {
            fn decode(col: Column) -> Result<Self, DecodeError> {
                let text = col.text::<$ty>()?;
                text.parse().map_err(|_|DecodeError::Parse {
                    value: text.to_owned(),
                    ty: stringify!($ty),
                })
            }
        }
    )*};
}

decode_parse!(i16, i32, i64, u32, f32, f64);

impl Decode for bool {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        match col.text::<bool>()? {
            "t" => Ok(true),
            "f" => Ok(false),
            text => Err(DecodeError::Parse { value: text.to_owned(), ty: "bool" }),
        }
    }
}

impl Decode for String {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        if !Self::accepts(col.oid()) {
            return Err(DecodeError::OidMissmatch(col.oid()));
        }
        Ok(String::from_utf8(col.try_into_value().map(Into::into)?)?)
    }
}

/// Type that can be used for indexing column.
pub trait Index: Sized + sealed::Sealed {
    /// Returns the position of the column.
    fn position(self, fields: &[Field]) -> Result<usize, DecodeError>;
}

impl Index for usize {
    fn position(self, fields: &[Field]) -> Result<usize, DecodeError> {
        match self < fields.len() {
            true => Ok(self),
            false => Err(DecodeError::IndexOutOfBounds(self)),
        }
    }
}

impl Index for &str {
    fn position(self, fields: &[Field]) -> Result<usize, DecodeError> {
        fields
            .iter()
            .position(|f|f.name() == self)
            .ok_or_else(||DecodeError::ColumnNotFound(String::from(self).into()))
    }
}

mod sealed {
    pub trait Sealed { }
    impl Sealed for usize { }
    impl Sealed for &str { }
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for DecodeError {
            fn from($pat: $ty) -> Self {
                $body
            }
        }
    };
}

/// An error when decoding row value.
pub enum DecodeError {
    /// Postgres return non utf8 string.
    Utf8(Utf8Error),
    /// Column requested not found.
    ColumnNotFound(Cow<'static,str>),
    /// Index requested is out of bounds.
    IndexOutOfBounds(usize),
    /// Column type cannot be decoded into the requested type.
    OidMissmatch(Oid),
    /// Text value is not a valid representation of the requested type.
    Parse {
        value: String,
        ty: &'static str,
    },
    /// Row is null.
    Null,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to decode value, ")?;
        match self {
            Self::Utf8(e) => write!(f, "{e}"),
            Self::ColumnNotFound(name) => write!(f, "column not found: {name:?}"),
            Self::IndexOutOfBounds(u) => write!(f, "index out of bounds: {u:?}"),
            Self::OidMissmatch(oid) => write!(f, "data type missmatch, found oid {oid}"),
            Self::Parse { value, ty } => write!(f, "cannot parse {value:?} as {ty}"),
            Self::Null => write!(f, "unexpected NULL value"),
        }
    }
}

from!(<Utf8Error>e => Self::Utf8(e));
from!(<FromUtf8Error>e => Self::Utf8(e.utf8_error()));

impl std::error::Error for DecodeError { }

impl fmt::Debug for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
