//! Non-blocking postgres session.
use bytes::{Buf, BytesMut};
use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    os::fd::{AsRawFd, RawFd},
};

use super::{
    PgResult, Socket,
    result::{ExecStatus, Field, ResultBuilder},
};
use crate::{
    Result,
    common::{ByteStr, span, verbose},
    connection::Config,
    encode::Encoded,
    error::StateError,
    postgres::{
        BackendMessage, BackendProtocol, DbError, FrontendProtocol, ProtocolError,
        backend::BackendKeyData,
        frontend,
    },
    transport::{PgTransport, TransactionStatus},
};

const DEFAULT_BUF_CAPACITY: usize = 8 * 1024;

/// A live postgres session.
///
/// Commands are dispatched without blocking and their results collected
/// as input arrives, see [`PgTransport`].
#[derive(Debug)]
pub struct PgConn {
    socket: Option<Socket>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    bad: bool,

    in_flight: bool,
    describing: bool,
    extended: bool,
    builder: Option<ResultBuilder>,
    results: VecDeque<PgResult>,

    tx_status: TransactionStatus,
    params: Vec<(ByteStr, ByteStr)>,
    key_data: Option<BackendKeyData>,
}

impl PgConn {
    /// Connect and authenticate, blocking the current thread.
    ///
    /// The returned session is switched to non-blocking mode.
    pub fn connect(config: &Config) -> Result<PgConn> {
        span!("connect");
        let socket = match &config.socket {
            Some(dir) => Socket::connect_unix(dir, config.port)?,
            None => Socket::connect_tcp(&config.host, config.port, config.connect_timeout)?,
        };
        socket.set_timeout(config.connect_timeout)?;

        let mut me = PgConn::new(socket);
        me.startup(config)?;

        if let Some(socket) = &me.socket {
            socket.set_timeout(None)?;
            socket.set_nonblocking(true)?;
        }

        verbose!(pid = me.backend_pid(), "connected");
        Ok(me)
    }

    pub(crate) fn new(socket: Socket) -> PgConn {
        PgConn {
            socket: Some(socket),
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            bad: false,
            in_flight: false,
            describing: false,
            extended: false,
            builder: None,
            results: VecDeque::new(),
            tx_status: TransactionStatus::Idle,
            params: Vec::new(),
            key_data: None,
        }
    }

    /// Value of a server parameter reported by `ParameterStatus`.
    pub fn parameter_status(&self, name: &str) -> Option<&str> {
        self.params.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// Process id of the backend serving this session.
    pub fn backend_pid(&self) -> Option<u32> {
        self.key_data.as_ref().map(|e| e.process_id)
    }

    pub(crate) fn set_key_data(&mut self, key_data: BackendKeyData) {
        self.key_data = Some(key_data);
    }

    pub(crate) fn set_parameter(&mut self, name: ByteStr, value: ByteStr) {
        match self.params.iter_mut().find(|(k, _)| *k == name) {
            Some((_, v)) => *v = value,
            None => self.params.push((name, value)),
        }
    }

    pub(crate) fn set_tx_status(&mut self, indicator: u8) {
        self.tx_status = TransactionStatus::from_indicator(indicator);
    }

    /// Buffer a frontend message.
    pub(crate) fn send<F: FrontendProtocol>(&mut self, message: F) {
        frontend::write(message, &mut self.write_buf);
    }

    pub(crate) fn send_startup(&mut self, startup: frontend::Startup) {
        startup.write(&mut self.write_buf);
    }

    /// Write all buffered output, blocking.
    pub(crate) fn flush_blocking(&mut self) -> Result<()> {
        let res = match (&mut self.socket, self.bad) {
            (Some(socket), false) => socket.write_all(&self.write_buf),
            _ => return Err(closed()),
        };
        self.write_buf.clear();
        res.map_err(|err| self.broken(err))
    }

    /// Receive one message, blocking.
    pub(crate) fn recv_blocking<B: BackendProtocol>(&mut self) -> Result<B> {
        loop {
            if let Some((msgtype, body)) = self.split_message()? {
                return Ok(B::decode(msgtype, body)?);
            }
            self.read_some()?;
        }
    }

    fn check_sendable(&mut self) -> Result<()> {
        if self.bad || self.socket.is_none() {
            return Err(closed());
        }
        if self.in_flight || !self.results.is_empty() {
            return Err(ProtocolError::CommandInProgress.into());
        }
        Ok(())
    }

    fn dispatched(&mut self, describing: bool, extended: bool) {
        self.in_flight = true;
        self.describing = describing;
        self.extended = extended;
        self.tx_status = TransactionStatus::Active;
    }

    /// Mark the session unusable, returning `err` as a connection error.
    fn broken(&mut self, err: io::Error) -> crate::Error {
        log::warn!("connection broken: {err}");
        self.bad = true;
        self.in_flight = false;
        self.tx_status = TransactionStatus::Unknown;
        err.into()
    }

    /// Read once into the read buffer.
    ///
    /// Returns `false` if the read would block.
    fn read_some(&mut self) -> Result<bool> {
        let mut chunk = [0u8; DEFAULT_BUF_CAPACITY];
        let res = match (&mut self.socket, self.bad) {
            (Some(socket), false) => socket.read(&mut chunk),
            _ => return Err(closed()),
        };
        match res {
            Ok(0) => Err(self.broken(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the connection unexpectedly",
            ))),
            Ok(n) => {
                self.read_buf.extend_from_slice(&chunk[..n]);
                Ok(true)
            },
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(true),
            Err(err) => Err(self.broken(err)),
        }
    }

    /// Split one complete message off the read buffer.
    fn split_message(&mut self) -> Result<Option<(u8, bytes::Bytes)>> {
        // msgtype + length
        const PREFIX: usize = 1 + 4;

        let Some(mut header) = self.read_buf.get(..PREFIX) else {
            return Ok(None);
        };
        let msgtype = header.get_u8();
        let len = header.get_u32() as usize;

        if len < 4 {
            self.bad = true;
            return Err(ProtocolError::malformed("message length too small").into());
        }

        if self.read_buf.len() < 1 + len {
            self.read_buf.reserve(1 + len - self.read_buf.len());
            return Ok(None);
        }

        let mut message = self.read_buf.split_to(1 + len);
        message.advance(PREFIX);
        Ok(Some((msgtype, message.freeze())))
    }

    /// Handle every complete message in the read buffer.
    fn parse_input(&mut self) -> Result<()> {
        while let Some((msgtype, body)) = self.split_message()? {
            let message = match BackendMessage::decode(msgtype, body) {
                Ok(ok) => ok,
                Err(err) => {
                    self.bad = true;
                    return Err(err.into());
                },
            };
            if let Err(err) = self.handle(message) {
                self.bad = true;
                return Err(err);
            }
        }
        Ok(())
    }

    fn handle(&mut self, message: BackendMessage) -> Result<()> {
        use BackendMessage::*;

        verbose!("(B) {}", BackendMessage::message_name(message.msgtype()));

        match message {
            RowDescription(desc) => {
                let fields = Field::decode_all(desc)?;
                match self.describing {
                    true => self.results.push_back(PgResult::new(ExecStatus::CommandOk).with_fields(fields)),
                    false => self.builder = Some(ResultBuilder::new(fields)),
                }
            },
            NoData(_) => {
                if self.describing {
                    self.results.push_back(PgResult::new(ExecStatus::CommandOk));
                }
            },
            DataRow(row) => match &mut self.builder {
                Some(builder) => builder.push(row)?,
                None => Err(ProtocolError::unexpected_phase(
                    crate::postgres::backend::DataRow::MSGTYPE,
                    "result without description",
                ))?,
            },
            CommandComplete(cmd) => {
                let result = match self.builder.take() {
                    Some(builder) => builder.finish(cmd.tag),
                    None => PgResult::new(ExecStatus::CommandOk).with_tag(cmd.tag),
                };
                self.results.push_back(result);
            },
            EmptyQueryResponse(_) => self.results.push_back(PgResult::new(ExecStatus::EmptyQuery)),
            ErrorResponse(err) => {
                self.builder = None;
                self.results.push_back(PgResult::fatal(DbError::try_from(err)?));
            },
            ReadyForQuery(ready) => {
                self.set_tx_status(ready.tx_status);
                self.in_flight = false;
                self.describing = false;
                self.builder = None;
            },
            NoticeResponse(notice) => notice_received(notice)?,
            NotificationResponse(notify) => {
                log::debug!(
                    "notification from pid {} on `{}`: {}",
                    notify.process_id, notify.channel, notify.payload
                );
            },
            ParameterStatus(param) => self.set_parameter(param.name, param.value),
            BackendKeyData(key) => self.set_key_data(key),
            CopyInResponse(_) | CopyBothResponse(_) => {
                log::debug!("copy from stdin is not supported, aborting");
                self.send(frontend::CopyFail { message: "COPY is not supported by this client" });
                // Sync sent with the command is ignored while in copy mode
                if self.extended {
                    self.send(frontend::Sync);
                }
            },
            // copy out data is discarded, CommandComplete follows
            CopyOutResponse(_) | CopyData(_) | CopyDone(_) => {},
            ParseComplete(_) | BindComplete(_) | CloseComplete(_)
            | ParameterDescription(_) | PortalSuspended(_) => {},
            f @ (Authentication(_) | NegotiateProtocolVersion(_)) => {
                Err(ProtocolError::unexpected_phase(f.msgtype(), "query"))?
            },
        }

        Ok(())
    }
}

/// Server notices are logged, never returned.
pub(crate) fn notice_received(notice: crate::postgres::NoticeResponse) -> Result<()> {
    let notice = DbError::try_from(notice)?;
    log::info!(target: "porta::notice", "{notice}");
    Ok(())
}

fn closed() -> crate::Error {
    crate::Error::from(StateError::ConnectionClosed)
}

impl PgTransport for PgConn {
    fn send_query(&mut self, sql: &str) -> Result<()> {
        self.check_sendable()?;
        log::debug!("query: {sql}");
        self.send(frontend::Query { sql });
        self.dispatched(false, false);
        Ok(())
    }

    fn send_query_params(&mut self, sql: &str, params: &[Encoded]) -> Result<()> {
        self.check_sendable()?;
        log::debug!("query: {sql}, {} parameter(s)", params.len());
        self.send(frontend::Parse { prepare_name: "", sql, params });
        self.send(frontend::Bind { portal_name: "", stmt_name: "", params });
        self.send(frontend::Describe { kind: b'P', name: "" });
        self.send(frontend::Execute { portal_name: "", max_row: 0 });
        self.send(frontend::Sync);
        self.dispatched(false, true);
        Ok(())
    }

    fn send_describe_portal(&mut self, name: &str) -> Result<()> {
        self.check_sendable()?;
        log::debug!("describe portal: {name}");
        self.send(frontend::Describe { kind: b'P', name });
        self.send(frontend::Sync);
        self.dispatched(true, true);
        Ok(())
    }

    fn flush(&mut self) -> Result<bool> {
        while !self.write_buf.is_empty() {
            let res = match (&mut self.socket, self.bad) {
                (Some(socket), false) => socket.write(&self.write_buf),
                _ => return Err(closed()),
            };
            match res {
                Ok(0) => {
                    return Err(self.broken(io::Error::from(io::ErrorKind::WriteZero)));
                },
                Ok(n) => self.write_buf.advance(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {},
                Err(err) => return Err(self.broken(err)),
            }
        }
        Ok(false)
    }

    fn consume_input(&mut self) -> Result<()> {
        while self.read_some()? { }
        self.parse_input()?;
        // answer to copy requests is written as soon as possible
        if !self.write_buf.is_empty() {
            self.flush()?;
        }
        Ok(())
    }

    fn is_busy(&self) -> bool {
        self.in_flight && self.results.is_empty() && !self.bad
    }

    fn get_result(&mut self) -> Option<PgResult> {
        self.results.pop_front()
    }

    fn socket(&self) -> Result<RawFd> {
        match (&self.socket, self.bad) {
            (Some(socket), false) => Ok(socket.as_raw_fd()),
            _ => Err(closed()),
        }
    }

    fn transaction_status(&self) -> TransactionStatus {
        match self.bad || self.socket.is_none() {
            true => TransactionStatus::Unknown,
            false => self.tx_status,
        }
    }

    fn client_encoding(&self) -> &str {
        self.parameter_status("client_encoding").unwrap_or("SQL_ASCII")
    }

    fn is_closed(&self) -> bool {
        self.bad || self.socket.is_none()
    }

    fn finish(&mut self) {
        let Some(mut socket) = self.socket.take() else {
            return;
        };
        // a pending partial message would swallow Terminate
        if !self.bad && self.write_buf.is_empty() {
            frontend::write(frontend::Terminate, &mut self.write_buf);
            // single non-blocking attempt, a peer that stopped reading must
            // not stall the caller
            let _ = socket.set_nonblocking(true);
            let _ = socket.write(&self.write_buf);
        }
        self.write_buf.clear();
        self.read_buf.clear();
        self.results.clear();
        self.in_flight = false;
        self.tx_status = TransactionStatus::Unknown;
        verbose!("connection finished");
    }
}

impl Drop for PgConn {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod test {
    use bytes::BufMut;
    use std::{
        os::unix::net::UnixStream,
        sync::mpsc,
        thread,
        time::Duration,
    };

    use super::*;
    use crate::{Connection, error::ErrorKind};

    const INT4: u32 = 23;

    /// A session whose server end is driven by the test.
    fn pair() -> (PgConn, UnixStream) {
        let (client, server) = UnixStream::pair().unwrap();
        client.set_nonblocking(true).unwrap();
        (PgConn::new(Socket::from_unix(client)), server)
    }

    fn message(msgtype: u8, body: &[u8]) -> Vec<u8> {
        let mut buf = vec![msgtype];
        buf.put_u32(4 + body.len() as u32);
        buf.put_slice(body);
        buf
    }

    fn row_description(names: &[&str]) -> Vec<u8> {
        let mut body = vec![];
        body.put_u16(names.len() as u16);
        for name in names {
            body.put_slice(name.as_bytes());
            body.put_u8(0);
            body.put_u32(0);
            body.put_i16(0);
            body.put_u32(INT4);
            body.put_i16(4);
            body.put_i32(-1);
            body.put_u16(0);
        }
        message(b'T', &body)
    }

    fn data_row(values: &[&str]) -> Vec<u8> {
        let mut body = vec![];
        body.put_u16(values.len() as u16);
        for value in values {
            body.put_i32(value.len() as i32);
            body.put_slice(value.as_bytes());
        }
        message(b'D', &body)
    }

    fn command_complete(tag: &str) -> Vec<u8> {
        message(b'C', format!("{tag}\0").as_bytes())
    }

    fn ready(status: u8) -> Vec<u8> {
        message(b'Z', &[status])
    }

    fn error_response(code: &str, text: &str) -> Vec<u8> {
        message(b'E', format!("SERROR\0C{code}\0M{text}\0\0").as_bytes())
    }

    /// Dispatch `sql` and return what reached the server.
    fn query(conn: &mut PgConn, server: &mut UnixStream, sql: &str) -> Vec<u8> {
        conn.send_query(sql).unwrap();
        assert!(!conn.flush().unwrap());
        let mut received = vec![0; 1 + 4 + sql.len() + 1];
        server.read_exact(&mut received).unwrap();
        received
    }

    fn respond(conn: &mut PgConn, server: &mut UnixStream, messages: &[Vec<u8>]) -> Vec<PgResult> {
        server.write_all(&messages.concat()).unwrap();
        conn.consume_input().unwrap();
        std::iter::from_fn(|| conn.get_result()).collect()
    }

    #[test]
    fn simple_query_collects_rows() {
        let (mut conn, mut server) = pair();
        let received = query(&mut conn, &mut server, "select n");
        assert_eq!(received, message(b'Q', b"select n\0"));
        assert!(conn.is_busy());
        assert_eq!(conn.transaction_status(), TransactionStatus::Active);

        let results = respond(&mut conn, &mut server, &[
            row_description(&["n"]),
            data_row(&["1"]),
            data_row(&["2"]),
            command_complete("SELECT 2"),
            ready(b'T'),
        ]);

        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.status(), ExecStatus::TuplesOk);
        assert_eq!(result.ntuples(), 2);
        assert_eq!(result.fields()[0].name(), "n");
        assert_eq!(result.rows()[1].try_get::<_, i32>(0).unwrap(), 2);
        assert_eq!(result.command_tag(), Some("SELECT 2"));
        assert!(!conn.is_busy());
        assert_eq!(conn.transaction_status(), TransactionStatus::InTransaction);
    }

    #[test]
    fn partial_message_keeps_the_session_busy() {
        let (mut conn, mut server) = pair();
        query(&mut conn, &mut server, "begin");

        let complete = command_complete("BEGIN");
        server.write_all(&complete[..3]).unwrap();
        conn.consume_input().unwrap();
        assert!(conn.is_busy());
        assert!(conn.get_result().is_none());

        let results = respond(&mut conn, &mut server, &[complete[3..].to_vec(), ready(b'T')]);
        assert_eq!(results[0].status(), ExecStatus::CommandOk);
        assert_eq!(results[0].command_tag(), Some("BEGIN"));
        assert!(!conn.is_busy());
    }

    #[test]
    fn describe_portal_reports_fields() {
        let (mut conn, mut server) = pair();
        conn.send_describe_portal("c").unwrap();
        assert!(!conn.flush().unwrap());

        let results = respond(&mut conn, &mut server, &[row_description(&["a", "b"]), ready(b'T')]);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status(), ExecStatus::CommandOk);
        assert_eq!(results[0].nfields(), 2);
        assert_eq!(results[0].fields()[1].name(), "b");
        assert_eq!(results[0].ntuples(), 0);
    }

    #[test]
    fn describe_portal_without_rows() {
        let (mut conn, mut server) = pair();
        conn.send_describe_portal("c").unwrap();
        assert!(!conn.flush().unwrap());

        let results = respond(&mut conn, &mut server, &[message(b'n', b""), ready(b'I')]);
        assert_eq!(results[0].status(), ExecStatus::CommandOk);
        assert_eq!(results[0].nfields(), 0);
    }

    #[test]
    fn error_response_is_a_fatal_result() {
        let (mut conn, mut server) = pair();
        query(&mut conn, &mut server, "wat");

        let results = respond(&mut conn, &mut server, &[error_response("42601", "syntax error"), ready(b'E')]);
        assert_eq!(results[0].status(), ExecStatus::FatalError);
        assert_eq!(results[0].error().unwrap().code(), "42601");
        assert_eq!(results[0].error().unwrap().message(), "syntax error");
        assert_eq!(conn.transaction_status(), TransactionStatus::InError);
        assert!(!conn.is_closed());

        conn.send_query("rollback").unwrap();
    }

    #[test]
    fn command_in_progress() {
        let (mut conn, _server) = pair();
        conn.send_query("select 1").unwrap();
        let err = conn.send_query("select 2").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Protocol(ProtocolError::CommandInProgress)));
    }

    #[test]
    fn row_without_description_breaks_the_session() {
        let (mut conn, mut server) = pair();
        query(&mut conn, &mut server, "select 1");

        server.write_all(&data_row(&["1"])).unwrap();
        let err = conn.consume_input().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Protocol(_)));
        assert!(conn.is_closed());
        assert!(!conn.is_busy());
    }

    #[test]
    fn server_hangup() {
        let (mut conn, mut server) = pair();
        query(&mut conn, &mut server, "select 1");
        drop(server);

        let err = conn.consume_input().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Io(_)));
        assert!(conn.is_closed());
        assert_eq!(conn.transaction_status(), TransactionStatus::Unknown);
        assert!(conn.socket().is_err());
    }

    #[test]
    fn finish_sends_terminate() {
        let (mut conn, mut server) = pair();
        conn.finish();
        conn.finish();

        let mut terminate = [0; 5];
        server.read_exact(&mut terminate).unwrap();
        assert_eq!(terminate, [b'X', 0, 0, 0, 4]);
        assert!(conn.is_closed());

        let err = conn.send_query("select 1").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::State(StateError::ConnectionClosed)));
    }

    #[test]
    fn timeout_against_a_server_that_stopped_reading() {
        let (conn, server) = pair();
        let conn = Connection::from_transport(conn);
        conn.set_autocommit(true).unwrap();
        conn.set_timeout(Some(Duration::from_millis(50)));

        // far larger than the socket buffer, the server never reads any of it
        let sql = format!("select '{}'", "x".repeat(16 * 1024 * 1024));
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let timed_out = conn.execute(&sql, &[]).err().map(|err| err.is_timeout());
            tx.send((timed_out, conn.closed())).unwrap();
        });

        let (timed_out, closed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(timed_out, Some(true));
        assert!(closed);
        drop(server);
    }
}
