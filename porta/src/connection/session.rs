use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tokio::sync::{Mutex, MutexGuard};

use crate::{
    Result,
    engine::{Command, Execute, PqGen, Ready, Step, step},
    error::StateError,
    transport::{PgTransport, TransactionStatus},
    waiting,
};

/// State shared by every handle of one connection.
pub(crate) struct Shared<T> {
    /// The serialization lock, held for one logical command.
    session: Mutex<Session<T>>,
    closed: AtomicBool,
    autocommit: AtomicBool,
}

pub(crate) struct Session<T> {
    transport: T,
    timeout: Option<Duration>,
}

impl<T: PgTransport> Shared<T> {
    pub(crate) fn new(transport: T, timeout: Option<Duration>) -> Shared<T> {
        Shared {
            closed: AtomicBool::new(transport.is_closed()),
            session: Mutex::new(Session { transport, timeout }),
            autocommit: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn autocommit(&self) -> bool {
        self.autocommit.load(Ordering::Acquire)
    }

    fn guard<'a>(&'a self, session: MutexGuard<'a, Session<T>>) -> SessionGuard<'a, T> {
        SessionGuard { session, shared: self, armed: false }
    }

    fn check_open(&self) -> Result<()> {
        match self.is_closed() {
            true => Err(StateError::ConnectionClosed.into()),
            false => Ok(()),
        }
    }

    /// Block the thread until the session is available.
    ///
    /// # Panics
    ///
    /// Panics when called within an asynchronous execution context.
    pub(crate) fn blocking_lock(&self) -> SessionGuard<'_, T> {
        self.guard(self.session.blocking_lock())
    }

    /// Like [`blocking_lock`][Self::blocking_lock], failing if the session is closed.
    pub(crate) fn lock_open(&self) -> Result<SessionGuard<'_, T>> {
        self.check_open()?;
        let guard = self.blocking_lock();
        self.check_open()?;
        Ok(guard)
    }

    pub(crate) async fn lock(&self) -> SessionGuard<'_, T> {
        self.guard(self.session.lock().await)
    }

    pub(crate) async fn lock_open_async(&self) -> Result<SessionGuard<'_, T>> {
        self.check_open()?;
        let guard = self.lock().await;
        self.check_open()?;
        Ok(guard)
    }

    /// Acquire the session only if nobody holds it.
    pub(crate) fn try_lock(&self) -> Option<SessionGuard<'_, T>> {
        self.session.try_lock().ok().map(|session| self.guard(session))
    }
}

/// Exclusive access to the session.
///
/// Dropping the guard releases the lock on every exit path. Dropped while a
/// command is still being driven, it also terminates the session: the
/// remaining response would be read as the answer to the next command.
pub(crate) struct SessionGuard<'a, T: PgTransport> {
    session: MutexGuard<'a, Session<T>>,
    shared: &'a Shared<T>,
    /// A command is dispatched and its response not fully read.
    armed: bool,
}

impl<T: PgTransport> SessionGuard<'_, T> {
    pub(crate) fn transport(&self) -> &T {
        &self.session.transport
    }

    pub(crate) fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.session.timeout = timeout;
    }

    pub(crate) fn set_autocommit(&mut self, autocommit: bool) -> Result<()> {
        if self.transport().transaction_status() != TransactionStatus::Idle {
            return Err(StateError::TransactionOpen.into());
        }
        self.shared.autocommit.store(autocommit, Ordering::Release);
        Ok(())
    }

    /// Wrap `pqgen` so that a transaction is started first, unless in autocommit
    /// mode or a transaction is already open.
    pub(crate) fn in_transaction<G: PqGen>(&self, pqgen: G) -> Transactional<G> {
        let begin = match (self.shared.autocommit(), self.transport().transaction_status()) {
            (false, TransactionStatus::Idle) => Some(Execute::new(Command::Query("BEGIN".into()))),
            _ => None,
        };
        Transactional { begin, inner: pqgen }
    }

    /// Drive `pqgen` to completion, blocking the thread.
    pub(crate) fn run<G: PqGen>(&mut self, pqgen: G) -> Result<G::Output> {
        self.armed = true;
        let Session { transport, timeout } = &mut *self.session;
        let result = waiting::wait(pqgen, transport, *timeout);
        self.armed = false;
        self.settle(result)
    }

    /// Drive `pqgen` to completion, suspending the task.
    pub(crate) async fn run_async<G: PqGen>(&mut self, pqgen: G) -> Result<G::Output> {
        self.armed = true;
        let Session { transport, timeout } = &mut *self.session;
        let result = waiting::wait_async(pqgen, transport, *timeout).await;
        self.armed = false;
        self.settle(result)
    }

    fn settle<O>(&mut self, result: Result<O>) -> Result<O> {
        if let Err(err) = &result {
            if err.is_timeout() {
                // unread input may still be on the wire, the session cannot be reused
                log::warn!("{err}, closing the connection");
                self.session.transport.finish();
            }
        }
        if self.session.transport.is_closed() {
            self.shared.closed.store(true, Ordering::Release);
        }
        result
    }

    /// Terminate the session, calling it again is a no-op.
    pub(crate) fn finish(&mut self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            log::debug!("closing connection");
        }
        self.session.transport.finish();
    }
}

impl<T: PgTransport> Drop for SessionGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            log::warn!("command abandoned before completion, closing the connection");
            self.session.transport.finish();
            self.shared.closed.store(true, Ordering::Release);
        }
    }
}

/// Runs the inner generator after an optional `BEGIN`.
#[derive(Debug)]
pub(crate) struct Transactional<G> {
    begin: Option<Execute>,
    inner: G,
}

impl<G: PqGen> PqGen for Transactional<G> {
    type Output = G::Output;

    fn resume<T: PgTransport>(&mut self, conn: &mut T, mut ready: Ready) -> Result<Step<G::Output>> {
        if let Some(begin) = &mut self.begin {
            let result = step!(begin.resume(conn, ready)?);
            self.begin = None;
            result.check()?;
            ready = Ready::NONE;
        }
        self.inner.resume(conn, ready)
    }
}
