use std::{
    pin::Pin,
    task::{Context, Poll, ready},
};

use futures_core::Stream;

use super::{CursorState, DeclareOptions, IntoScrollMode, ScrollMode, state::NamedCursorHelper};
use crate::{
    Result,
    connection::AsyncConnection,
    encode::{Encode, encode_all},
    pq::{Field, PgConn, PgResult},
    row::Row,
    transport::PgTransport,
};

/// Async server-side cursor.
///
/// The async counterpart of [`NamedCursor`][super::NamedCursor], created by
/// [`AsyncConnection::cursor`].
///
/// Dropping an open cursor only logs a warning, the portal is released when
/// the transaction ends or the connection closes.
pub struct AsyncNamedCursor<T: PgTransport = PgConn> {
    conn: AsyncConnection<T>,
    helper: NamedCursorHelper,
    pos: i64,
    itersize: usize,
    arraysize: usize,
}

impl<T: PgTransport> AsyncNamedCursor<T> {
    pub(crate) fn new(conn: AsyncConnection<T>, name: String) -> AsyncNamedCursor<T> {
        Self::with_helper(conn, NamedCursorHelper::new(name))
    }

    pub(crate) fn adopt(conn: AsyncConnection<T>, name: String) -> AsyncNamedCursor<T> {
        Self::with_helper(conn, NamedCursorHelper::adopt(name))
    }

    fn with_helper(conn: AsyncConnection<T>, helper: NamedCursorHelper) -> AsyncNamedCursor<T> {
        AsyncNamedCursor { conn, helper, pos: 0, itersize: 100, arraysize: 1 }
    }

    pub fn name(&self) -> &str {
        self.helper.name()
    }

    pub fn state(&self) -> CursorState {
        self.helper.state()
    }

    pub fn closed(&self) -> bool {
        self.helper.state() == CursorState::Closed
    }

    pub fn connection(&self) -> &AsyncConnection<T> {
        &self.conn
    }

    pub fn description(&self) -> Option<&[Field]> {
        self.helper.description()
    }

    /// Result of the last describe or fetch.
    pub fn pgresult(&self) -> Option<&PgResult> {
        self.helper.pgresult()
    }

    /// Position of the cursor as tracked locally, [`None`] until described.
    pub fn rownumber(&self) -> Option<i64> {
        self.helper.description().map(|_| self.pos)
    }

    pub fn itersize(&self) -> usize {
        self.itersize
    }

    pub fn set_itersize(&mut self, itersize: usize) {
        self.itersize = itersize.max(1);
    }

    pub fn arraysize(&self) -> usize {
        self.arraysize
    }

    pub fn set_arraysize(&mut self, arraysize: usize) {
        self.arraysize = arraysize.max(1);
    }

    /// Declare a scrollable cursor without hold for `query`, then describe it.
    pub fn execute<'a>(
        &'a mut self,
        query: &str,
        params: &[&dyn Encode],
    ) -> impl Future<Output = Result<()>> + use<'a, T> {
        self.execute_with(query, params, DeclareOptions::default())
    }

    /// Declare the cursor for `query`, then describe it.
    ///
    /// Parameters are encoded and the state is checked before the returned
    /// future is first polled.
    pub fn execute_with<'a>(
        &'a mut self,
        query: &str,
        params: &[&dyn Encode],
        options: DeclareOptions,
    ) -> impl Future<Output = Result<()>> + use<'a, T> {
        let AsyncNamedCursor { conn, helper, pos, .. } = self;
        let declare = helper.declare(query, encode_all(params), options);
        async move {
            let declare = declare?;
            let mut session = conn.shared().lock_open_async().await?;
            let pqgen = session.in_transaction(declare);
            session.run_async(pqgen).await?;
            *pos = 0;
            Ok::<_, crate::Error>(())
        }
    }

    /// Describe the portal again.
    pub async fn describe(&mut self) -> Result<()> {
        let describe = self.helper.describe()?;
        self.conn.shared().lock_open_async().await?.run_async(describe).await?;
        Ok(())
    }

    async fn fetch(&mut self, count: Option<usize>) -> Result<Vec<Row>> {
        let fetch = self.helper.fetch(count)?;
        let rows = self.conn.shared().lock_open_async().await?.run_async(fetch).await?;
        self.pos += rows.len() as i64;
        Ok(rows)
    }

    /// Fetch the next row.
    pub async fn fetchone(&mut self) -> Result<Option<Row>> {
        Ok(self.fetch(Some(1)).await?.into_iter().next())
    }

    /// Fetch the next `size` rows, `0` fetches [`arraysize`][AsyncNamedCursor::arraysize] rows.
    pub async fn fetchmany(&mut self, size: usize) -> Result<Vec<Row>> {
        let size = match size {
            0 => self.arraysize,
            size => size,
        };
        self.fetch(Some(size)).await
    }

    /// Fetch every remaining row.
    pub async fn fetchall(&mut self) -> Result<Vec<Row>> {
        self.fetch(None).await
    }

    /// Move the cursor without fetching, see [`NamedCursor::scroll`][super::NamedCursor::scroll].
    pub async fn scroll(&mut self, value: i64, mode: impl IntoScrollMode) -> Result<()> {
        let mode = mode.into_scroll_mode()?;
        let scroll = self.helper.scroll(value, mode)?;
        self.conn.shared().lock_open_async().await?.run_async(scroll).await?;
        match mode {
            ScrollMode::Relative => self.pos += value,
            ScrollMode::Absolute => self.pos = value,
        }
        Ok(())
    }

    /// Close the cursor, releasing the portal.
    ///
    /// The cursor is closed afterward even if closing the portal failed.
    /// Closing again is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if !self.helper.is_open() {
            self.helper.discard();
            return Ok(());
        }
        let mut session = self.conn.shared().lock().await;
        match self.helper.close(session.transport().transaction_status()) {
            Some(close) => session.run_async(close).await,
            None => Ok(()),
        }
    }

    /// Stream the remaining rows, fetching [`itersize`][AsyncNamedCursor::itersize]
    /// rows per round trip.
    pub fn rows(&mut self) -> RowStream<'_, T>
    where
        T: Send,
    {
        RowStream { cursor: Some(self), pending: None, batch: Vec::new().into_iter(), done: false }
    }
}

impl<T: PgTransport> Drop for AsyncNamedCursor<T> {
    fn drop(&mut self) {
        if self.helper.is_open() {
            log::warn!(
                "named cursor `{}` dropped while open, call `close().await` to release the server portal",
                self.helper.name(),
            );
        }
    }
}

impl<T: PgTransport> std::fmt::Debug for AsyncNamedCursor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncNamedCursor")
            .field("name", &self.helper.name())
            .field("state", &self.helper.state())
            .field("rownumber", &self.rownumber())
            .finish()
    }
}

type Batch<'a, T> = Pin<Box<dyn Future<Output = (&'a mut AsyncNamedCursor<T>, Result<Vec<Row>>)> + Send + 'a>>;

/// Stream returned by [`AsyncNamedCursor::rows`].
///
/// Ends after the first batch smaller than the iteration size, or after an
/// error.
pub struct RowStream<'a, T: PgTransport> {
    cursor: Option<&'a mut AsyncNamedCursor<T>>,
    pending: Option<Batch<'a, T>>,
    batch: std::vec::IntoIter<Row>,
    done: bool,
}

impl<'a, T: PgTransport + Send> Stream for RowStream<'a, T> {
    type Item = Result<Row>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let me = self.get_mut();
        loop {
            if let Some(row) = me.batch.next() {
                return Poll::Ready(Some(Ok(row)));
            }
            if me.done {
                return Poll::Ready(None);
            }

            if me.pending.is_none() {
                let Some(cursor) = me.cursor.take() else {
                    return Poll::Ready(None);
                };
                let size = cursor.itersize;
                me.pending = Some(Box::pin(async move {
                    let rows = cursor.fetchmany(size).await;
                    (cursor, rows)
                }));
            }
            let Some(pending) = me.pending.as_mut() else {
                return Poll::Ready(None);
            };

            let (cursor, rows) = ready!(pending.as_mut().poll(cx));
            me.pending = None;
            let size = cursor.itersize;
            me.cursor = Some(cursor);

            match rows {
                Ok(rows) => {
                    me.done = rows.len() < size;
                    me.batch = rows.into_iter();
                },
                Err(err) => {
                    me.done = true;
                    return Poll::Ready(Some(Err(err)));
                },
            }
        }
    }
}

impl<T: PgTransport> std::fmt::Debug for RowStream<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream").field("done", &self.done).finish_non_exhaustive()
    }
}
