//! Protocol execution engine.
//!
//! A round trip is written once as a generator: [`PqGen::resume`] advances
//! it as far as possible without blocking, then either completes or reports
//! which socket readiness it waits for. Drivers in [`waiting`][crate::waiting]
//! satisfy the wait, by blocking the thread or by suspending a task, and
//! resume the same generator.
//!
//! Generators never touch threads, runtimes or timers.
use crate::{
    Result,
    common::verbose,
    encode::Encoded,
    postgres::ProtocolError,
    pq::{ExecStatus, PgResult},
    transport::PgTransport,
};

/// Socket readiness a generator waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Wait until readable.
    R,
    /// Wait until writable.
    W,
    /// Wait until readable or writable.
    RW,
}

/// Socket readiness reported by a driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ready {
    read: bool,
    write: bool,
}

impl Ready {
    /// No readiness, passed on the first resume.
    pub const NONE: Ready = Ready { read: false, write: false };
    pub const R: Ready = Ready { read: true, write: false };
    pub const W: Ready = Ready { read: false, write: true };
    pub const RW: Ready = Ready { read: true, write: true };

    pub fn is_readable(&self) -> bool {
        self.read
    }

    pub fn is_writable(&self) -> bool {
        self.write
    }
}

/// Outcome of one [`PqGen::resume`].
#[derive(Debug)]
pub enum Step<T> {
    /// Resume again once the socket is ready.
    Wait(Wait),
    /// The generator completed.
    Done(T),
}

/// Resumable protocol sequence.
pub trait PqGen {
    type Output;

    /// Advance the sequence.
    ///
    /// `ready` is the readiness that satisfied the previously returned
    /// [`Wait`], or [`Ready::NONE`] on the first call.
    ///
    /// # Panics
    ///
    /// Calling `resume` after [`Step::Done`] was returned panics.
    fn resume<T: PgTransport>(&mut self, conn: &mut T, ready: Ready) -> Result<Step<Self::Output>>;
}

/// Unwrap [`Step::Done`] or return the wait to the caller.
macro_rules! step {
    ($e:expr) => {
        match $e {
            $crate::engine::Step::Done(value) => value,
            $crate::engine::Step::Wait(wait) => return Ok($crate::engine::Step::Wait(wait)),
        }
    };
}

pub(crate) use step;

fn completed() -> ! {
    panic!("generator resumed after completion")
}

/// A command to dispatch.
#[derive(Debug, Clone)]
pub enum Command {
    /// Simple query protocol, may contain several statements.
    Query(String),
    /// Extended query protocol with text parameters.
    QueryParams(String, Vec<Encoded>),
    /// Describe a named portal.
    DescribePortal(String),
}

impl Command {
    /// Plain query, using the extended protocol only when there are parameters.
    pub fn query(sql: impl Into<String>, params: Vec<Encoded>) -> Command {
        match params.is_empty() {
            true => Command::Query(sql.into()),
            false => Command::QueryParams(sql.into(), params),
        }
    }

    pub fn dispatch<T: PgTransport>(&self, conn: &mut T) -> Result<()> {
        match self {
            Command::Query(sql) => conn.send_query(sql),
            Command::QueryParams(sql, params) => conn.send_query_params(sql, params),
            Command::DescribePortal(name) => conn.send_describe_portal(name),
        }
    }
}

/// Flush buffered output.
///
/// Input is consumed whenever the socket turns readable meanwhile, a server
/// sending a large response while our output is still pending would
/// otherwise deadlock both ends.
#[derive(Debug, Default)]
pub struct Send {
    started: bool,
    done: bool,
}

impl Send {
    pub fn new() -> Send {
        Send::default()
    }
}

impl PqGen for Send {
    type Output = ();

    fn resume<T: PgTransport>(&mut self, conn: &mut T, ready: Ready) -> Result<Step<()>> {
        if self.done {
            completed()
        }

        if self.started && ready.is_readable() {
            conn.consume_input()?;
        }
        self.started = true;

        if conn.flush()? {
            verbose!("output pending");
            return Ok(Step::Wait(Wait::RW));
        }

        self.done = true;
        Ok(Step::Done(()))
    }
}

/// Take the next result of the command in flight.
///
/// Completes with [`None`] once the command has no more results.
#[derive(Debug, Default)]
pub struct Fetch {
    phase: FetchPhase,
}

#[derive(Debug, Default)]
enum FetchPhase {
    #[default]
    Start,
    Reading,
    Done,
}

impl Fetch {
    pub fn new() -> Fetch {
        Fetch::default()
    }
}

impl PqGen for Fetch {
    type Output = Option<PgResult>;

    fn resume<T: PgTransport>(&mut self, conn: &mut T, _: Ready) -> Result<Step<Self::Output>> {
        match self.phase {
            FetchPhase::Start => {
                if conn.is_busy() {
                    self.phase = FetchPhase::Reading;
                    return Ok(Step::Wait(Wait::R));
                }
            },
            FetchPhase::Reading => {
                conn.consume_input()?;
                if conn.is_busy() {
                    return Ok(Step::Wait(Wait::R));
                }
            },
            FetchPhase::Done => completed(),
        }

        self.phase = FetchPhase::Done;
        Ok(Step::Done(conn.get_result()))
    }
}

/// One complete round trip: dispatch, send, then drain every result.
///
/// Completes with the first [`FatalError`][ExecStatus::FatalError] result if
/// any, otherwise the last result that is not a
/// [`SingleTuple`][ExecStatus::SingleTuple]. A fatal result is returned, not
/// raised. A round trip without any result is a protocol error.
#[derive(Debug)]
pub struct Execute {
    phase: ExecutePhase,
    fatal: Option<PgResult>,
    last: Option<PgResult>,
}

#[derive(Debug)]
enum ExecutePhase {
    Dispatch(Command),
    Send(Send),
    Fetch(Fetch),
    Done,
}

impl Execute {
    /// Round trip which dispatches `command` on the first resume.
    pub fn new(command: Command) -> Execute {
        Execute { phase: ExecutePhase::Dispatch(command), fatal: None, last: None }
    }

    /// Round trip for a command which has already been dispatched.
    pub fn dispatched() -> Execute {
        Execute { phase: ExecutePhase::Send(Send::new()), fatal: None, last: None }
    }
}

impl PqGen for Execute {
    type Output = PgResult;

    fn resume<T: PgTransport>(&mut self, conn: &mut T, mut ready: Ready) -> Result<Step<PgResult>> {
        loop {
            match &mut self.phase {
                ExecutePhase::Dispatch(command) => {
                    command.dispatch(conn)?;
                    self.phase = ExecutePhase::Send(Send::new());
                    ready = Ready::NONE;
                },
                ExecutePhase::Send(send) => {
                    step!(send.resume(conn, ready)?);
                    self.phase = ExecutePhase::Fetch(Fetch::new());
                    ready = Ready::NONE;
                },
                ExecutePhase::Fetch(fetch) => {
                    match step!(fetch.resume(conn, ready)?) {
                        Some(result) => {
                            verbose!(status = ?result.status(), "result");
                            match result.status() {
                                ExecStatus::FatalError if self.fatal.is_none() => self.fatal = Some(result),
                                ExecStatus::FatalError | ExecStatus::SingleTuple => {},
                                _ => self.last = Some(result),
                            }
                            self.phase = ExecutePhase::Fetch(Fetch::new());
                            ready = Ready::NONE;
                        },
                        None => {
                            self.phase = ExecutePhase::Done;
                            let result = self.fatal.take().or_else(|| self.last.take());
                            return match result {
                                Some(result) => Ok(Step::Done(result)),
                                None => Err(ProtocolError::NoResult.into()),
                            };
                        },
                    }
                },
                ExecutePhase::Done => completed(),
            }
        }
    }
}
