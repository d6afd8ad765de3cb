//! The outcome of one round trip.
use bytes::Buf;
use std::sync::Arc;

use crate::{
    Result,
    common::ByteStr,
    ext::BytesExt,
    postgres::{
        DbError, Oid, PgFormat, ProtocolError,
        backend::{DataRow, RowDescription},
    },
    row::Row,
};

/// Status of a [`PgResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// The string sent to the server was empty.
    EmptyQuery,
    /// Successful completion of a command returning no data.
    CommandOk,
    /// Successful completion of a command returning data, e.g. `SELECT` or `FETCH`.
    TuplesOk,
    /// Copy Out data transfer in progress.
    CopyOut,
    /// Copy In data transfer in progress.
    CopyIn,
    /// The server's response was not understood.
    BadResponse,
    /// A nonfatal error (a notice or warning) occurred.
    NonfatalError,
    /// A fatal error occurred.
    FatalError,
    /// Copy In/Out data transfer in progress.
    CopyBoth,
    /// A single tuple of a larger result set, in single row mode.
    SingleTuple,
}

/// Column descriptor from `RowDescription`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    name: ByteStr,
    table_oid: Oid,
    column_id: i16,
    type_oid: Oid,
    type_size: i16,
    type_modifier: i32,
    format: PgFormat,
}

impl Field {
    /// Decode every field of a `RowDescription` message.
    pub(crate) fn decode_all(desc: RowDescription) -> Result<Arc<[Field]>, ProtocolError> {
        // table_oid + column_id + type_oid + type_size + type_modifier + format
        const SUFFIX: usize = 4 + 2 + 4 + 2 + 4 + 2;

        let RowDescription { field_len, mut body } = desc;
        let mut fields = Vec::with_capacity(field_len as usize);

        for _ in 0..field_len {
            let name = body.get_nul_bytestr()?;
            if body.remaining() < SUFFIX {
                return Err(ProtocolError::malformed("row description too short"));
            }
            fields.push(Field {
                name,
                table_oid: body.get_u32(),
                column_id: body.get_i16(),
                type_oid: body.get_u32(),
                type_size: body.get_i16(),
                type_modifier: body.get_i32(),
                format: PgFormat::from_code(body.get_u16()),
            });
        }

        Ok(fields.into())
    }

    /// Build a text field, for tests and synthetic results.
    pub fn new(name: impl Into<String>, type_oid: Oid) -> Field {
        Field {
            name: name.into().into(),
            table_oid: 0,
            column_id: 0,
            type_oid,
            type_size: -1,
            type_modifier: -1,
            format: PgFormat::Text,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_oid(&self) -> Oid {
        self.type_oid
    }

    /// Data type size, negative values denote variable-width types.
    pub fn type_size(&self) -> i16 {
        self.type_size
    }

    pub fn type_modifier(&self) -> i32 {
        self.type_modifier
    }

    pub fn format(&self) -> PgFormat {
        self.format
    }

    /// Oid of the source table, zero if the column is not a table column.
    pub fn table_oid(&self) -> Oid {
        self.table_oid
    }

    /// Attribute number of the source column, zero if not a table column.
    pub fn column_id(&self) -> i16 {
        self.column_id
    }
}

/// The immutable outcome of one command.
#[derive(Debug, Clone)]
pub struct PgResult {
    status: ExecStatus,
    fields: Arc<[Field]>,
    rows: Vec<Row>,
    command_tag: Option<ByteStr>,
    error: Option<DbError>,
}

impl PgResult {
    pub(crate) fn new(status: ExecStatus) -> PgResult {
        PgResult {
            status,
            fields: Arc::new([]),
            rows: Vec::new(),
            command_tag: None,
            error: None,
        }
    }

    pub(crate) fn with_fields(mut self, fields: Arc<[Field]>) -> Self {
        self.fields = fields;
        self
    }

    pub(crate) fn with_tag(mut self, tag: ByteStr) -> Self {
        self.command_tag = Some(tag);
        self
    }

    /// Build a fatal result carrying `error`.
    pub(crate) fn fatal(error: DbError) -> PgResult {
        PgResult { error: Some(error), ..PgResult::new(ExecStatus::FatalError) }
    }

    pub fn status(&self) -> ExecStatus {
        self.status
    }

    /// Number of rows.
    pub fn ntuples(&self) -> usize {
        self.rows.len()
    }

    /// Number of columns.
    pub fn nfields(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> &Arc<[Field]> {
        &self.fields
    }

    pub fn field(&self, i: usize) -> Option<&Field> {
        self.fields.get(i)
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// The command tag, e.g. `FETCH 2`, absent for describe and error results.
    pub fn command_tag(&self) -> Option<&str> {
        self.command_tag.as_deref()
    }

    /// Number of rows affected, parsed from the command tag.
    ///
    /// For `INSERT oid rows` the last number is taken.
    pub fn rows_affected(&self) -> Option<u64> {
        self.command_tag.as_deref()?.rsplit(' ').next()?.parse().ok()
    }

    /// Server error of a fatal result.
    pub fn error(&self) -> Option<&DbError> {
        self.error.as_ref()
    }

    /// Returns `true` if the status is [`ExecStatus::FatalError`].
    pub fn is_fatal(&self) -> bool {
        self.status == ExecStatus::FatalError
    }

    /// Convert a fatal result into [`ErrorKind::Database`][crate::error::ErrorKind::Database].
    ///
    /// This is the boundary where a returned failure becomes a raised one.
    pub fn check(self) -> Result<PgResult> {
        match self.status {
            ExecStatus::FatalError => Err(self.error.unwrap_or_default().into()),
            ExecStatus::BadResponse => Err(ProtocolError::malformed("bad response from server").into()),
            _ => Ok(self),
        }
    }
}

/// Accumulates rows between `RowDescription` and `CommandComplete`.
#[derive(Debug)]
pub(crate) struct ResultBuilder {
    fields: Arc<[Field]>,
    rows: Vec<Row>,
}

impl ResultBuilder {
    pub(crate) fn new(fields: Arc<[Field]>) -> Self {
        Self { fields, rows: Vec::new() }
    }

    pub(crate) fn push(&mut self, data: DataRow) -> Result<(), ProtocolError> {
        let DataRow { column_len, mut body } = data;
        if column_len as usize != self.fields.len() {
            return Err(ProtocolError::malformed("data row length does not match row description"));
        }

        let mut values = Vec::with_capacity(column_len as usize);
        for _ in 0..column_len {
            if body.remaining() < 4 {
                return Err(ProtocolError::malformed("data row too short"));
            }
            let value = match body.get_i32() {
                -1 => None,
                len if len < 0 || len as usize > body.remaining() => {
                    return Err(ProtocolError::malformed("data row value length out of range"));
                },
                len => Some(body.split_to(len as usize)),
            };
            values.push(value);
        }

        self.rows.push(Row::new(self.fields.clone(), values));
        Ok(())
    }

    pub(crate) fn finish(self, tag: ByteStr) -> PgResult {
        PgResult {
            status: ExecStatus::TuplesOk,
            fields: self.fields,
            rows: self.rows,
            command_tag: Some(tag),
            error: None,
        }
    }
}

/// Build a tuples result directly, used by in-process transports.
#[cfg(test)]
pub(crate) fn tuples(fields: Arc<[Field]>, rows: Vec<Vec<Option<bytes::Bytes>>>, tag: &str) -> PgResult {
    let rows = rows.into_iter().map(|values| Row::new(fields.clone(), values)).collect();
    PgResult {
        status: ExecStatus::TuplesOk,
        fields,
        rows,
        command_tag: Some(ByteStr::copy_from_str(tag)),
        error: None,
    }
}
