//! In-process server for unit tests.
//!
//! [`FakeServer`] implements [`PgTransport`] over a tiny command interpreter
//! that understands transaction control and portals over
//! `generate_series(a, b)`. Its descriptor is one end of a socket pair with
//! pending input, so it always polls readable and writable and the real
//! drivers run unchanged.
use std::{
    collections::{HashMap, VecDeque},
    io::{self, Write},
    os::{
        fd::{AsRawFd, RawFd},
        unix::net::UnixStream,
    },
    sync::{Arc, Mutex, MutexGuard},
};

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    Result,
    encode::Encoded,
    error::StateError,
    postgres::{DbError, ProtocolError, oid},
    pq::{ExecStatus, Field, PgResult, tuples},
    transport::{PgTransport, TransactionStatus},
};

/// What the fake server observed, shared with the test after the transport
/// moved into a connection.
#[derive(Clone, Default)]
pub(crate) struct FakeLog(Arc<Mutex<LogInner>>);

#[derive(Default)]
struct LogInner {
    commands: Vec<String>,
    consumed: usize,
    finished: bool,
    overlapped: bool,
}

impl FakeLog {
    fn inner(&self) -> MutexGuard<'_, LogInner> {
        self.0.lock().unwrap()
    }

    /// Every dispatched command, describes as `describe <name>`.
    pub(crate) fn commands(&self) -> Vec<String> {
        self.inner().commands.clone()
    }

    /// Number of dispatched commands, one per round trip.
    pub(crate) fn round_trips(&self) -> usize {
        self.inner().commands.len()
    }

    pub(crate) fn clear(&self) {
        self.inner().commands.clear();
    }

    pub(crate) fn consumed(&self) -> usize {
        self.inner().consumed
    }

    pub(crate) fn finished(&self) -> bool {
        self.inner().finished
    }

    /// Returns `true` if a command was dispatched while another was in flight.
    pub(crate) fn overlapped(&self) -> bool {
        self.inner().overlapped
    }
}

#[derive(Debug)]
struct Portal {
    rows: Vec<i64>,
    pos: usize,
    scroll: bool,
    hold: bool,
}

type Outcome = std::result::Result<PgResult, DbError>;

pub(crate) struct FakeServer {
    log: FakeLog,
    portals: HashMap<String, Portal>,
    tx: TransactionStatus,
    /// Responses written by the server, not read yet.
    wire: VecDeque<PgResult>,
    results: VecDeque<PgResult>,
    in_flight: bool,
    unflushed: bool,
    stalled: bool,
    fail_read: bool,
    closed: bool,
    socket: UnixStream,
    _peer: UnixStream,
}

impl FakeServer {
    pub(crate) fn new() -> (FakeServer, FakeLog) {
        let (socket, mut peer) = UnixStream::pair().unwrap();
        peer.write_all(b"!").unwrap();
        let log = FakeLog::default();
        let fake = FakeServer {
            log: log.clone(),
            portals: HashMap::new(),
            tx: TransactionStatus::Idle,
            wire: VecDeque::new(),
            results: VecDeque::new(),
            in_flight: false,
            unflushed: false,
            stalled: false,
            fail_read: false,
            closed: false,
            socket,
            _peer: peer,
        };
        (fake, log)
    }

    /// The server stops answering, every command waits forever.
    pub(crate) fn stall(mut self) -> FakeServer {
        self.stalled = true;
        self
    }

    /// The next read fails as if the peer reset the connection.
    pub(crate) fn fail_next_read(&mut self) {
        self.fail_read = true;
    }

    /// Dispatch a command the server answers with nothing but `ReadyForQuery`.
    pub(crate) fn dispatch_silent(&mut self) {
        self.in_flight = true;
        self.unflushed = true;
    }

    /// Create a portal outside of any transaction, like one left by another client library.
    pub(crate) fn with_portal(mut self, name: &str, from: i64, to: i64) -> FakeServer {
        let rows = (from..=to).collect();
        self.portals.insert(name.to_owned(), Portal { rows, pos: 0, scroll: true, hold: true });
        self
    }

    fn check_sendable(&mut self, command: String) -> Result<()> {
        if self.closed {
            return Err(StateError::ConnectionClosed.into());
        }
        if self.in_flight || !self.results.is_empty() || !self.wire.is_empty() {
            self.log.inner().overlapped = true;
            return Err(ProtocolError::CommandInProgress.into());
        }
        self.log.inner().commands.push(command);
        self.in_flight = true;
        self.unflushed = true;
        Ok(())
    }

    fn error_in_tx(&mut self) {
        if self.tx == TransactionStatus::InTransaction {
            self.tx = TransactionStatus::InError;
        }
    }

    fn run_simple(&mut self, sql: &str) {
        let statements: Vec<&str> = sql.split(';').map(str::trim).collect();
        if statements.iter().all(|s| s.is_empty()) {
            self.wire.push_back(PgResult::new(ExecStatus::EmptyQuery));
            return;
        }
        for statement in statements.into_iter().filter(|s| !s.is_empty()) {
            match self.statement(statement) {
                Ok(result) => self.wire.push_back(result),
                Err(err) => {
                    self.error_in_tx();
                    self.wire.push_back(PgResult::fatal(err));
                    return;
                },
            }
        }
    }

    fn statement(&mut self, sql: &str) -> Outcome {
        let lower = sql.to_ascii_lowercase();
        let words: Vec<&str> = lower.split_whitespace().collect();

        match words.as_slice() {
            ["begin"] => {
                if self.tx == TransactionStatus::Idle {
                    self.tx = TransactionStatus::InTransaction;
                }
                return Ok(tag("BEGIN"));
            },
            [end @ ("commit" | "rollback")] => {
                let tag_name = match (self.tx, *end) {
                    (TransactionStatus::InError, _) | (_, "rollback") => "ROLLBACK",
                    _ => "COMMIT",
                };
                self.portals.retain(|_, portal| portal.hold);
                self.tx = TransactionStatus::Idle;
                return Ok(tag(tag_name));
            },
            _ => {},
        }

        if self.tx == TransactionStatus::InError {
            return Err(db_error(
                "25P02",
                "current transaction is aborted, commands ignored until end of transaction block",
            ));
        }

        match words.first().copied() {
            Some("declare") => self.declare(&sql["declare".len()..]),
            Some("fetch") => self.fetch(&sql["fetch".len()..]),
            Some("move") => self.move_(&sql["move".len()..]),
            Some("close") => {
                let (name, _) = ident(&sql["close".len()..])?;
                self.portals.remove(&name).ok_or_else(|| missing(&name))?;
                Ok(tag("CLOSE CURSOR"))
            },
            _ if lower == "select 1" => Ok(tuples(
                Arc::new([Field::new("?column?", oid::INT4)]),
                vec![vec![Some(Bytes::from_static(b"1"))]],
                "SELECT 1",
            )),
            _ if lower.starts_with("select 1 from pg_catalog.pg_cursors where name = ") => {
                let name = sql["select 1 from pg_catalog.pg_cursors where name = ".len()..].trim_matches('\'');
                let rows = match self.portals.contains_key(name) {
                    true => vec![vec![Some(Bytes::from_static(b"1"))]],
                    false => vec![],
                };
                let tag = format!("SELECT {}", rows.len());
                Ok(tuples(Arc::new([Field::new("?column?", oid::INT4)]), rows, &tag))
            },
            _ => Err(db_error("42601", "syntax error")),
        }
    }

    fn declare(&mut self, rest: &str) -> Outcome {
        let (name, rest) = ident(rest)?;
        let lower = rest.to_ascii_lowercase();
        let Some(at) = lower.find(" for ") else {
            return Err(db_error("42601", "syntax error"));
        };
        let options: Vec<&str> = lower[..at].split_whitespace().collect();
        let scroll = !options.contains(&"no");
        let hold = options.contains(&"hold");

        if !hold && self.tx != TransactionStatus::InTransaction {
            return Err(db_error("25P01", "DECLARE CURSOR can only be used in transaction blocks"));
        }
        if self.portals.contains_key(&name) {
            return Err(db_error("42P03", &format!("cursor \"{name}\" already exists")));
        }

        let query = lower[at + " for ".len()..].trim();
        let args = query
            .strip_prefix("select generate_series(")
            .and_then(|args| args.strip_suffix(')'))
            .ok_or_else(|| db_error("42601", "syntax error"))?;
        let bounds: Vec<i64> = args
            .split(',')
            .map(|arg| arg.trim().parse())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| db_error("22P02", "invalid input syntax for type integer"))?;
        let [from, to] = bounds[..] else {
            return Err(db_error("42883", "function generate_series does not exist"));
        };

        let rows = (from..=to).collect();
        self.portals.insert(name, Portal { rows, pos: 0, scroll, hold });
        Ok(tag("DECLARE CURSOR"))
    }

    fn portal(&mut self, name: &str) -> std::result::Result<&mut Portal, DbError> {
        self.portals.get_mut(name).ok_or_else(|| missing(name))
    }

    fn fetch(&mut self, rest: &str) -> Outcome {
        let lower = rest.to_ascii_lowercase();
        let words: Vec<&str> = lower.split_whitespace().collect();
        let count = match words.as_slice() {
            ["forward", "all", "from", ..] => None,
            ["forward", n, "from", ..] => Some(n.parse::<usize>().map_err(|_| db_error("42601", "syntax error"))?),
            _ => return Err(db_error("42601", "syntax error")),
        };
        let at = lower.find(" from ").ok_or_else(|| db_error("42601", "syntax error"))?;
        let (name, _) = ident(&rest[at + " from ".len()..])?;

        let portal = self.portal(&name)?;
        let len = portal.rows.len();
        let start = portal.pos.min(len);
        let end = match count {
            Some(n) => (portal.pos + n).min(len),
            None => len,
        };
        let values = portal.rows[start..end]
            .iter()
            .map(|n| vec![Some(Bytes::from(n.to_string()))])
            .collect::<Vec<_>>();
        portal.pos = match count {
            Some(n) if portal.pos + n <= len => portal.pos + n,
            _ => len + 1,
        };

        let tag = format!("FETCH {}", values.len());
        Ok(tuples(series_fields(), values, &tag))
    }

    fn move_(&mut self, rest: &str) -> Outcome {
        let lower = rest.to_ascii_lowercase();
        let words: Vec<&str> = lower.split_whitespace().collect();
        let (absolute, count) = match words.as_slice() {
            ["absolute", n, "from", ..] => (true, *n),
            [n, "from", ..] => (false, *n),
            _ => return Err(db_error("42601", "syntax error")),
        };
        let count: i64 = count.parse().map_err(|_| db_error("42601", "syntax error"))?;
        let at = lower.find(" from ").ok_or_else(|| db_error("42601", "syntax error"))?;
        let (name, _) = ident(&rest[at + " from ".len()..])?;

        let portal = self.portal(&name)?;
        let last = portal.rows.len() as i64 + 1;
        let pos = portal.pos as i64;
        let target = match (absolute, count) {
            (true, n) if n >= 0 => n.min(last),
            (true, n) => (last + n).max(0),
            (false, n) => (pos + n).clamp(0, last),
        };
        if target < pos && !portal.scroll {
            return Err(db_error("55000", "cursor can only scan forward"));
        }

        let on_row = |p: i64| (1..last).contains(&p) as i64;
        let moved = match (absolute, count) {
            (true, _) | (false, 0) => on_row(target),
            (false, 1..) => target.min(last - 1) - pos,
            (false, _) => (pos - 1).min(last - 1) - target.max(1) + 1,
        };
        portal.pos = target as usize;
        Ok(tag(&format!("MOVE {}", moved.max(0))))
    }
}

fn tag(tag: &str) -> PgResult {
    PgResult::new(ExecStatus::CommandOk).with_tag(tag.to_owned().into())
}

fn series_fields() -> Arc<[Field]> {
    Arc::new([Field::new("generate_series", oid::INT4)])
}

fn db_error(code: &str, message: &str) -> DbError {
    let mut body = BytesMut::new();
    for (field, value) in [(b'S', "ERROR"), (b'C', code), (b'M', message)] {
        body.put_u8(field);
        body.put_slice(value.as_bytes());
        body.put_u8(0);
    }
    body.put_u8(0);
    DbError::parse(body.freeze()).unwrap()
}

fn missing(name: &str) -> DbError {
    db_error("34000", &format!("cursor \"{name}\" does not exist"))
}

/// Parse a leading quoted identifier, returning it and the remaining text.
fn ident(sql: &str) -> std::result::Result<(String, &str), DbError> {
    let sql = sql.trim_start();
    let Some(body) = sql.strip_prefix('"') else {
        return Err(db_error("42601", "syntax error, expected quoted identifier"));
    };
    let mut name = String::new();
    let mut chars = body.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c != '"' {
            name.push(c);
            continue;
        }
        if let Some((_, '"')) = chars.peek() {
            chars.next();
            name.push('"');
            continue;
        }
        return Ok((name, &body[i + 1..]));
    }
    Err(db_error("42601", "unterminated quoted identifier"))
}

/// Substitute `$n` placeholders with the text value of the parameter.
fn bind(sql: &str, params: &[Encoded]) -> String {
    let mut sql = sql.to_owned();
    // highest first so `$1` does not match inside `$10`
    for (i, param) in params.iter().enumerate().rev() {
        let value = match param.value() {
            Some(value) => String::from_utf8_lossy(value).into_owned(),
            None => "null".to_owned(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

impl PgTransport for FakeServer {
    fn send_query(&mut self, sql: &str) -> Result<()> {
        self.check_sendable(sql.to_owned())?;
        self.run_simple(sql);
        Ok(())
    }

    fn send_query_params(&mut self, sql: &str, params: &[Encoded]) -> Result<()> {
        self.check_sendable(sql.to_owned())?;
        let sql = bind(sql, params);
        match self.statement(sql.trim()) {
            Ok(result) => self.wire.push_back(result),
            Err(err) => {
                self.error_in_tx();
                self.wire.push_back(PgResult::fatal(err));
            },
        }
        Ok(())
    }

    fn send_describe_portal(&mut self, name: &str) -> Result<()> {
        self.check_sendable(format!("describe {name}"))?;
        let result = match (self.tx, self.portals.contains_key(name)) {
            (TransactionStatus::InError, _) => {
                PgResult::fatal(db_error("25P02", "current transaction is aborted"))
            },
            (_, true) => PgResult::new(ExecStatus::CommandOk).with_fields(series_fields()),
            (_, false) => {
                self.error_in_tx();
                PgResult::fatal(missing(name))
            },
        };
        self.wire.push_back(result);
        Ok(())
    }

    fn flush(&mut self) -> Result<bool> {
        if self.closed {
            return Err(StateError::ConnectionClosed.into());
        }
        Ok(std::mem::take(&mut self.unflushed))
    }

    fn consume_input(&mut self) -> Result<()> {
        if self.closed {
            return Err(StateError::ConnectionClosed.into());
        }
        if std::mem::take(&mut self.fail_read) {
            self.closed = true;
            self.in_flight = false;
            return Err(io::Error::from(io::ErrorKind::ConnectionReset).into());
        }
        self.log.inner().consumed += 1;
        if self.stalled {
            return Ok(());
        }
        self.results.extend(self.wire.drain(..));
        self.in_flight = false;
        Ok(())
    }

    fn is_busy(&self) -> bool {
        self.in_flight && self.results.is_empty() && !self.closed
    }

    fn get_result(&mut self) -> Option<PgResult> {
        self.results.pop_front()
    }

    fn socket(&self) -> Result<RawFd> {
        match self.closed {
            true => Err(StateError::ConnectionClosed.into()),
            false => Ok(self.socket.as_raw_fd()),
        }
    }

    fn transaction_status(&self) -> TransactionStatus {
        match (self.closed, self.in_flight) {
            (true, _) => TransactionStatus::Unknown,
            (false, true) => TransactionStatus::Active,
            (false, false) => self.tx,
        }
    }

    fn client_encoding(&self) -> &str {
        "UTF8"
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn finish(&mut self) {
        self.closed = true;
        self.in_flight = false;
        self.log.inner().finished = true;
    }
}
