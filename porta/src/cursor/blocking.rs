use std::thread;

use super::{CursorState, DeclareOptions, IntoScrollMode, ScrollMode, state::NamedCursorHelper};
use crate::{
    Result,
    connection::Connection,
    encode::{Encode, encode_all},
    pq::{Field, PgConn, PgResult},
    row::Row,
    transport::{PgTransport, TransactionStatus},
};

/// Blocking server-side cursor.
///
/// Created by [`Connection::cursor`], bound to a portal by
/// [`execute`][NamedCursor::execute]. Each call holds the connection lock
/// for at most one round trip, except the first fetch of an adopted cursor
/// which describes the portal first.
///
/// Close the cursor explicitly. Dropping an open cursor logs a warning and
/// closes the portal only if the connection is immediately available.
///
/// # Example
///
/// ```no_run
/// # fn app(conn: porta::Connection) -> porta::Result<()> {
/// let mut cursor = conn.cursor("numbers");
/// cursor.execute("select generate_series(0, 5)", &[])?;
///
/// cursor.scroll(5, "absolute")?;
/// let last = cursor.fetchone()?;
/// let rest = cursor.fetchall()?;
///
/// cursor.close()?;
/// # Ok(())
/// # }
/// ```
pub struct NamedCursor<T: PgTransport = PgConn> {
    conn: Connection<T>,
    helper: NamedCursorHelper,
    pos: i64,
    itersize: usize,
    arraysize: usize,
}

impl<T: PgTransport> NamedCursor<T> {
    pub(crate) fn new(conn: Connection<T>, name: String) -> NamedCursor<T> {
        Self::with_helper(conn, NamedCursorHelper::new(name))
    }

    pub(crate) fn adopt(conn: Connection<T>, name: String) -> NamedCursor<T> {
        Self::with_helper(conn, NamedCursorHelper::adopt(name))
    }

    fn with_helper(conn: Connection<T>, helper: NamedCursorHelper) -> NamedCursor<T> {
        NamedCursor { conn, helper, pos: 0, itersize: 100, arraysize: 1 }
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

    pub fn connection(&self) -> &Connection<T> {
        &self.conn
    }

    /// Columns of the portal, known once described.
    pub fn description(&self) -> Option<&[Field]> {
        self.helper.description()
    }

    /// Result of the last describe or fetch.
    pub fn pgresult(&self) -> Option<&PgResult> {
        self.helper.pgresult()
    }

    /// Position of the cursor as tracked locally, [`None`] until described.
    ///
    /// A scroll past either end is not reconciled with the server.
    pub fn rownumber(&self) -> Option<i64> {
        self.helper.description().map(|_| self.pos)
    }

    /// Rows fetched per round trip by [`iter`][NamedCursor::iter].
    pub fn itersize(&self) -> usize {
        self.itersize
    }

    pub fn set_itersize(&mut self, itersize: usize) {
        self.itersize = itersize.max(1);
    }

    /// Default size of [`fetchmany`][NamedCursor::fetchmany].
    pub fn arraysize(&self) -> usize {
        self.arraysize
    }

    pub fn set_arraysize(&mut self, arraysize: usize) {
        self.arraysize = arraysize.max(1);
    }

    /// Declare a scrollable cursor without hold for `query`, then describe it.
    pub fn execute(&mut self, query: &str, params: &[&dyn Encode]) -> Result<()> {
        self.execute_with(query, params, DeclareOptions::default())
    }

    /// Declare the cursor for `query`, then describe it.
    ///
    /// A transaction is started first unless in autocommit mode. A cursor
    /// without hold is only valid within a transaction.
    pub fn execute_with(&mut self, query: &str, params: &[&dyn Encode], options: DeclareOptions) -> Result<()> {
        let declare = self.helper.declare(query, encode_all(params), options)?;
        let mut session = self.conn.shared().lock_open()?;
        let pqgen = session.in_transaction(declare);
        session.run(pqgen)?;
        self.pos = 0;
        Ok(())
    }

    /// Describe the portal again.
    pub fn describe(&mut self) -> Result<()> {
        let describe = self.helper.describe()?;
        self.conn.shared().lock_open()?.run(describe)?;
        Ok(())
    }

    fn fetch(&mut self, count: Option<usize>) -> Result<Vec<Row>> {
        let fetch = self.helper.fetch(count)?;
        let rows = self.conn.shared().lock_open()?.run(fetch)?;
        self.pos += rows.len() as i64;
        Ok(rows)
    }

    /// Fetch the next row.
    pub fn fetchone(&mut self) -> Result<Option<Row>> {
        Ok(self.fetch(Some(1))?.into_iter().next())
    }

    /// Fetch the next `size` rows, `0` fetches [`arraysize`][NamedCursor::arraysize] rows.
    ///
    /// Returns less rows when the portal is exhausted, an empty batch is
    /// still a round trip.
    pub fn fetchmany(&mut self, size: usize) -> Result<Vec<Row>> {
        let size = match size {
            0 => self.arraysize,
            size => size,
        };
        self.fetch(Some(size))
    }

    /// Fetch every remaining row.
    pub fn fetchall(&mut self) -> Result<Vec<Row>> {
        self.fetch(None)
    }

    /// Move the cursor without fetching.
    ///
    /// `mode` is a [`ScrollMode`] or its name, an invalid name fails before
    /// any io. Moving backward requires a scrollable cursor, which the
    /// server enforces.
    pub fn scroll(&mut self, value: i64, mode: impl IntoScrollMode) -> Result<()> {
        let mode = mode.into_scroll_mode()?;
        let scroll = self.helper.scroll(value, mode)?;
        self.conn.shared().lock_open()?.run(scroll)?;
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
    pub fn close(&mut self) -> Result<()> {
        if !self.helper.is_open() {
            self.helper.discard();
            return Ok(());
        }
        let mut session = self.conn.shared().blocking_lock();
        match self.helper.close(session.transport().transaction_status()) {
            Some(close) => session.run(close),
            None => Ok(()),
        }
    }

    /// Iterate over the remaining rows, fetching [`itersize`][NamedCursor::itersize]
    /// rows per round trip.
    pub fn iter(&mut self) -> Iter<'_, T> {
        Iter { cursor: self, batch: Vec::new().into_iter(), done: false }
    }
}

impl<T: PgTransport> Drop for NamedCursor<T> {
    fn drop(&mut self) {
        if !self.helper.is_open() {
            return;
        }

        log::warn!(
            "named cursor `{}` dropped while open, call `close()` to release the server portal",
            self.helper.name(),
        );

        // blocking inside a runtime would panic
        if thread::panicking() || tokio::runtime::Handle::try_current().is_ok() {
            return;
        }
        let Some(mut session) = self.conn.shared().try_lock() else {
            return;
        };
        let tx_status = match self.conn.closed() {
            true => TransactionStatus::Unknown,
            false => session.transport().transaction_status(),
        };
        if let Some(close) = self.helper.close(tx_status) {
            if let Err(err) = session.run(close) {
                log::warn!("failed to close cursor `{}`: {err}", self.helper.name());
            }
        }
    }
}

impl<T: PgTransport> std::fmt::Debug for NamedCursor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedCursor")
            .field("name", &self.helper.name())
            .field("state", &self.helper.state())
            .field("rownumber", &self.rownumber())
            .finish()
    }
}

/// Iterator returned by [`NamedCursor::iter`].
///
/// Stops after the first batch smaller than the iteration size, or after
/// an error.
pub struct Iter<'a, T: PgTransport> {
    cursor: &'a mut NamedCursor<T>,
    batch: std::vec::IntoIter<Row>,
    done: bool,
}

impl<T: PgTransport> Iterator for Iter<'_, T> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(row) = self.batch.next() {
            return Some(Ok(row));
        }
        if self.done {
            return None;
        }

        let itersize = self.cursor.itersize;
        match self.cursor.fetch(Some(itersize)) {
            Ok(rows) => {
                self.done = rows.len() < itersize;
                self.batch = rows.into_iter();
                self.batch.next().map(Ok)
            },
            Err(err) => {
                self.done = true;
                Some(Err(err))
            },
        }
    }
}

impl<'a, T: PgTransport> IntoIterator for &'a mut NamedCursor<T> {
    type Item = Result<Row>;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        error::{ErrorKind, StateError},
        postgres::ErrorClass,
        testing::{FakeLog, FakeServer},
    };

    fn connect() -> (Connection<FakeServer>, FakeLog) {
        let (fake, log) = FakeServer::new();
        (Connection::from_transport(fake), log)
    }

    fn ints(rows: Vec<Row>) -> Vec<i32> {
        rows.into_iter().map(|row| row.try_get(0).unwrap()).collect()
    }

    fn int(row: Option<Row>) -> i32 {
        row.unwrap().try_get(0).unwrap()
    }

    #[test]
    fn declare_then_fetch() {
        let (conn, log) = connect();
        let mut cursor = conn.cursor("c");
        assert_eq!(cursor.state(), CursorState::Unbound);
        assert_eq!(cursor.rownumber(), None);

        cursor.execute("select generate_series(1, $1)", &[&5]).unwrap();
        assert_eq!(cursor.state(), CursorState::Described);
        assert_eq!(cursor.rownumber(), Some(0));
        assert_eq!(cursor.description().unwrap().len(), 1);
        assert_eq!(log.commands(), [
            "BEGIN",
            r#"declare "c" scroll cursor for select generate_series(1, $1)"#,
            "describe c",
        ]);

        assert_eq!(int(cursor.fetchone().unwrap()), 1);
        assert_eq!(cursor.rownumber(), Some(1));
        assert_eq!(ints(cursor.fetchall().unwrap()), [2, 3, 4, 5]);
        assert_eq!(cursor.rownumber(), Some(5));
        cursor.close().unwrap();
    }

    #[test]
    fn pgresult_of_last_fetch() {
        let (conn, _) = connect();
        let mut cursor = conn.cursor("c");
        assert!(cursor.pgresult().is_none());

        cursor.execute("select generate_series(1, 5)", &[]).unwrap();
        assert_eq!(cursor.pgresult().unwrap().ntuples(), 0);
        assert_eq!(cursor.pgresult().unwrap().fields()[0].name(), "generate_series");

        cursor.fetchmany(2).unwrap();
        let result = cursor.pgresult().unwrap();
        assert_eq!(result.command_tag(), Some("FETCH 2"));
        assert_eq!(result.rows()[1].try_get::<_, i32>(0).unwrap(), 2);
        cursor.close().unwrap();
    }

    #[test]
    fn fetchmany_makes_a_round_trip_each_call() {
        let (conn, log) = connect();
        let mut cursor = conn.cursor("c");
        cursor.execute("select generate_series(1, 5)", &[]).unwrap();
        log.clear();

        assert_eq!(ints(cursor.fetchmany(3).unwrap()), [1, 2, 3]);
        assert_eq!(ints(cursor.fetchmany(3).unwrap()), [4, 5]);
        assert!(cursor.fetchmany(3).unwrap().is_empty());
        assert_eq!(log.round_trips(), 3);

        cursor.close().unwrap();
    }

    #[test]
    fn fetchmany_zero_uses_arraysize() {
        let (conn, log) = connect();
        let mut cursor = conn.cursor("c");
        cursor.execute("select generate_series(1, 5)", &[]).unwrap();
        assert_eq!(cursor.fetchmany(0).unwrap().len(), 1);
        cursor.set_arraysize(2);
        assert_eq!(cursor.fetchmany(0).unwrap().len(), 2);
        assert!(log.commands().iter().any(|c| c == r#"fetch forward 2 from "c""#));
        cursor.close().unwrap();
    }

    #[test]
    fn scroll_backward() {
        let (conn, _) = connect();
        let mut cursor = conn.cursor("c");
        cursor.execute("select generate_series(0, 5)", &[]).unwrap();
        cursor.scroll(5, ScrollMode::Relative).unwrap();

        let mut fetched = vec![];
        for _ in 0..5 {
            cursor.scroll(-1, "relative").unwrap();
            fetched.push(int(cursor.fetchone().unwrap()));
            cursor.scroll(-1, "relative").unwrap();
        }
        assert_eq!(fetched, [4, 3, 2, 1, 0]);
        cursor.close().unwrap();
    }

    #[test]
    fn scroll_absolute_sets_rownumber() {
        let (conn, _) = connect();
        let mut cursor = conn.cursor("c");
        cursor.execute("select generate_series(0, 5)", &[]).unwrap();
        cursor.scroll(3, "absolute").unwrap();
        assert_eq!(cursor.rownumber(), Some(3));
        assert_eq!(int(cursor.fetchone().unwrap()), 3);
        cursor.scroll(0, "relative").unwrap();
        assert_eq!(cursor.rownumber(), Some(4));
        cursor.close().unwrap();
    }

    #[test]
    fn no_scroll_cursor_rejects_backward_move() {
        let (conn, _) = connect();
        let mut cursor = conn.cursor("c");
        let options = DeclareOptions::default().scrollable(false);
        cursor.execute_with("select generate_series(0, 5)", &[], options).unwrap();
        cursor.scroll(5, "relative").unwrap();

        let err = cursor.scroll(-1, "relative").unwrap_err();
        assert_eq!(err.as_db_error().unwrap().code(), "55000");
        assert_eq!(err.class(), Some(ErrorClass::Operational));
        assert_eq!(cursor.state(), CursorState::Described);

        // the failed transaction is rolled back, a cursor with hold survives that
        cursor.close().unwrap();
        conn.rollback().unwrap();
        let mut cursor = conn.cursor("h");
        let options = DeclareOptions::default().scrollable(false).hold(true);
        cursor.execute_with("select generate_series(0, 5)", &[], options).unwrap();
        conn.commit().unwrap();
        assert_eq!(int(cursor.fetchone().unwrap()), 0);
        assert_eq!(ints(cursor.fetchmany(2).unwrap()), [1, 2]);
        cursor.close().unwrap();
    }

    #[test]
    fn invalid_scroll_mode_does_no_io() {
        let (conn, log) = connect();
        let mut cursor = conn.cursor("c");
        let err = cursor.scroll(1, "wat").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidArgument(_)));

        cursor.execute("select generate_series(0, 5)", &[]).unwrap();
        log.clear();
        let err = cursor.scroll(1, "wat").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidArgument(_)));
        assert_eq!(log.round_trips(), 0);
        cursor.close().unwrap();
    }

    #[test]
    fn fetch_before_execute() {
        let (conn, log) = connect();
        let mut cursor = conn.cursor("c");
        let err = cursor.fetchone().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::State(StateError::CursorNotExecuted)));
        assert_eq!(log.round_trips(), 0);
    }

    #[test]
    fn close_twice() {
        let (conn, log) = connect();
        let mut cursor = conn.cursor("c");
        cursor.execute("select generate_series(0, 5)", &[]).unwrap();
        cursor.close().unwrap();
        cursor.close().unwrap();
        assert!(cursor.closed());
        assert_eq!(log.commands().last().unwrap(), r#"close "c""#);

        let err = cursor.fetchone().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::State(StateError::CursorClosed)));
        let err = cursor.execute("select generate_series(0, 5)", &[]).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::State(StateError::CursorClosed)));
    }

    #[test]
    fn close_unbound_does_no_io() {
        let (conn, log) = connect();
        let mut cursor = conn.cursor("c");
        cursor.close().unwrap();
        assert!(cursor.closed());
        assert_eq!(log.round_trips(), 0);
    }

    #[test]
    fn failed_close_still_closes() {
        let (conn, _) = connect();
        let mut cursor = conn.cursor("c");
        cursor.execute("select generate_series(0, 5)", &[]).unwrap();
        // the portal disappears behind the cursor's back
        conn.execute(r#"close "c""#, &[]).unwrap();

        let err = cursor.close().unwrap_err();
        assert_eq!(err.as_db_error().unwrap().code(), "34000");
        assert!(cursor.closed());
        cursor.close().unwrap();
    }

    #[test]
    fn close_in_failed_transaction_does_no_io() {
        let (conn, log) = connect();
        let mut cursor = conn.cursor("c");
        cursor.execute("select generate_series(0, 5)", &[]).unwrap();
        conn.execute("wat", &[]).unwrap_err();
        log.clear();
        cursor.close().unwrap();
        assert!(cursor.closed());
        assert_eq!(log.round_trips(), 0);
    }

    #[test]
    fn close_on_closed_connection() {
        let (conn, log) = connect();
        let mut cursor = conn.cursor("c");
        cursor.execute("select generate_series(0, 5)", &[]).unwrap();
        conn.close();
        log.clear();
        cursor.close().unwrap();
        assert!(cursor.closed());
        assert_eq!(log.round_trips(), 0);
    }

    #[test]
    fn duplicate_name() {
        let (conn, _) = connect();
        let mut a = conn.cursor("dup");
        a.execute("select generate_series(0, 5)", &[]).unwrap();
        let mut b = conn.cursor("dup");
        let err = b.execute("select generate_series(0, 5)", &[]).unwrap_err();
        assert_eq!(err.as_db_error().unwrap().code(), "42P03");
        assert_eq!(err.class(), Some(ErrorClass::Programming));
        assert_eq!(b.state(), CursorState::Unbound);
        conn.rollback().unwrap();
        a.close().unwrap();
        b.close().unwrap();
    }

    #[test]
    fn adopt_existing_portal() {
        let (fake, log) = FakeServer::new();
        let conn = Connection::from_transport(fake.with_portal("other", 1, 3));
        let mut cursor = conn.adopt_cursor("other");
        assert_eq!(cursor.state(), CursorState::Declared);
        assert_eq!(cursor.rownumber(), None);

        assert_eq!(ints(cursor.fetchall().unwrap()), [1, 2, 3]);
        assert_eq!(cursor.state(), CursorState::Described);
        assert_eq!(cursor.rownumber(), Some(3));
        cursor.close().unwrap();
        assert_eq!(log.commands().last().unwrap(), r#"close "other""#);
    }

    #[test]
    fn iteration_batches() {
        let (conn, log) = connect();
        let mut cursor = conn.cursor("c");
        cursor.execute("select generate_series(1, 3)", &[]).unwrap();
        cursor.set_itersize(2);
        log.clear();

        let rows = cursor.iter().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(ints(rows), [1, 2, 3]);
        assert_eq!(log.round_trips(), 2);
        cursor.close().unwrap();
    }

    #[test]
    fn unique_cursor_names() {
        let (conn, _) = connect();
        let a = conn.cursor_auto();
        let b = conn.cursor_auto();
        assert_ne!(a.name(), b.name());
    }

    #[test]
    fn drop_open_cursor_closes_portal() {
        let (conn, log) = connect();
        {
            let mut cursor = conn.cursor("c");
            cursor.execute("select generate_series(0, 5)", &[]).unwrap();
        }
        assert_eq!(log.commands().last().unwrap(), r#"close "c""#);
    }

    #[test]
    fn fetch_and_query_are_serialized() {
        let (conn, log) = connect();
        let mut cursor = conn.cursor("c");
        cursor.execute("select generate_series(1, 1000)", &[]).unwrap();

        let other = conn.clone();
        let queries = thread::spawn(move || {
            for _ in 0..200 {
                other.execute("select 1", &[]).unwrap();
            }
        });
        let rows = cursor.iter().collect::<Result<Vec<_>>>().unwrap();
        queries.join().unwrap();

        assert_eq!(ints(rows), (1..=1000).collect::<Vec<_>>());
        assert!(!log.overlapped());
        cursor.close().unwrap();
    }
}
