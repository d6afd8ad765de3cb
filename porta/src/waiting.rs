//! Drivers for [`PqGen`].
//!
//! [`wait`] blocks the calling thread in `poll(2)`, [`wait_async`] suspends
//! the task on the tokio reactor. Both resume the same generator with the
//! readiness they observed.
use std::{
    io,
    os::fd::RawFd,
    time::{Duration, Instant},
};

use crate::{
    Result,
    common::verbose,
    engine::{PqGen, Ready, Step, Wait},
    error::TimeoutError,
    transport::PgTransport,
};

/// Run `pqgen` to completion, blocking the thread at each wait.
///
/// `timeout` bounds the whole run, its expiry is reported as
/// [`ErrorKind::Timeout`][crate::error::ErrorKind::Timeout] and leaves the
/// session in an unknown state.
pub fn wait<G: PqGen, T: PgTransport>(mut pqgen: G, conn: &mut T, timeout: Option<Duration>) -> Result<G::Output> {
    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    let mut ready = Ready::NONE;
    loop {
        match pqgen.resume(conn, ready)? {
            Step::Done(output) => return Ok(output),
            Step::Wait(wait) => {
                verbose!(?wait, "poll");
                ready = poll(conn.socket()?, wait, deadline)?;
            },
        }
    }
}

fn poll(fd: RawFd, wait: Wait, deadline: Option<Instant>) -> Result<Ready> {
    let events = match wait {
        Wait::R => libc::POLLIN,
        Wait::W => libc::POLLOUT,
        Wait::RW => libc::POLLIN | libc::POLLOUT,
    };

    loop {
        let timeout_ms = match deadline {
            None => -1,
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(TimeoutError.into());
                }
                // round up, a zero timeout before the deadline would spin
                let ms = (deadline - now).as_micros().div_ceil(1000);
                ms.min(libc::c_int::MAX as u128) as libc::c_int
            },
        };

        let mut pollfd = libc::pollfd { fd, events, revents: 0 };
        // SAFETY: `pollfd` is a valid, exclusively borrowed array of length 1
        let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };

        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }
        if rc == 0 {
            continue;
        }

        let revents = pollfd.revents;
        if revents & libc::POLLNVAL != 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid socket descriptor").into());
        }

        // errors and hangups surface on the next read
        let read = revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0;
        let write = revents & libc::POLLOUT != 0;
        return Ok(match (read, write) {
            (true, true) => Ready::RW,
            (true, false) => Ready::R,
            (false, true) => Ready::W,
            (false, false) => Ready::NONE,
        });
    }
}

pub use nonblocking::wait_async;

mod nonblocking {
    use std::{
        io,
        os::fd::{AsRawFd, RawFd},
        time::Duration,
    };
    use tokio::{
        io::{Interest, unix::AsyncFd},
        time::Instant,
    };

    use crate::{
        Result,
        common::verbose,
        engine::{PqGen, Ready, Step, Wait},
        error::TimeoutError,
        transport::PgTransport,
    };

    /// Borrowed descriptor, registration never closes it.
    struct Fd(RawFd);

    impl AsRawFd for Fd {
        fn as_raw_fd(&self) -> RawFd {
            self.0
        }
    }

    /// Run `pqgen` to completion, suspending the task at each wait.
    ///
    /// Must be called within a tokio runtime with io and time enabled.
    /// `timeout` behaves as in [`wait`][super::wait].
    pub async fn wait_async<G: PqGen, T: PgTransport>(
        mut pqgen: G,
        conn: &mut T,
        timeout: Option<Duration>,
    ) -> Result<G::Output> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut ready = Ready::NONE;
        loop {
            match pqgen.resume(conn, ready)? {
                Step::Done(output) => return Ok(output),
                Step::Wait(wait) => {
                    verbose!(?wait, "suspend");
                    let fd = conn.socket()?;
                    ready = match deadline {
                        None => readiness(fd, wait).await?,
                        Some(deadline) => {
                            // an always ready socket would never let the timer fire
                            if Instant::now() >= deadline {
                                return Err(TimeoutError.into());
                            }
                            match tokio::time::timeout_at(deadline, readiness(fd, wait)).await {
                                Ok(ready) => ready?,
                                Err(_) => return Err(TimeoutError.into()),
                            }
                        },
                    };
                },
            }
        }
    }

    async fn readiness(fd: RawFd, wait: Wait) -> io::Result<Ready> {
        let interest = match wait {
            Wait::R => Interest::READABLE,
            Wait::W => Interest::WRITABLE,
            Wait::RW => Interest::READABLE | Interest::WRITABLE,
        };

        let fd = AsyncFd::try_with_interest(Fd(fd), interest).map_err(|err| err.into_parts().1)?;
        let guard = fd.ready(interest).await?;
        let ready = guard.ready();

        let read = ready.is_readable() || ready.is_read_closed() || ready.is_error();
        let write = ready.is_writable() || ready.is_write_closed();
        Ok(match (read, write) {
            (true, true) => Ready::RW,
            (true, false) => Ready::R,
            (false, true) => Ready::W,
            (false, false) => Ready::NONE,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        engine::{Command, Execute},
        pq::ExecStatus,
        testing::FakeServer,
    };

    fn select() -> Execute {
        Execute::new(Command::Query("select 1".into()))
    }

    #[test]
    fn blocking_driver() {
        let (mut fake, log) = FakeServer::new();
        let result = wait(select(), &mut fake, None).unwrap();
        assert_eq!(result.status(), ExecStatus::TuplesOk);
        assert_eq!(log.round_trips(), 1);
    }

    #[test]
    fn blocking_driver_times_out() {
        let (fake, _) = FakeServer::new();
        let mut fake = fake.stall();
        let err = wait(select(), &mut fake, Some(Duration::from_millis(20))).unwrap_err();
        assert!(err.is_timeout());
        assert!(err.is_connection());
    }

    #[test]
    fn blocking_driver_io_error() {
        let (mut fake, _) = FakeServer::new();
        fake.fail_next_read();
        let err = wait(select(), &mut fake, None).unwrap_err();
        assert!(matches!(err.kind(), crate::error::ErrorKind::Io(_)));
        assert!(fake.is_closed());
    }

    #[tokio::test]
    async fn async_driver() {
        let (mut fake, _) = FakeServer::new();
        let result = wait_async(select(), &mut fake, None).await.unwrap();
        assert_eq!(result.rows().len(), 1);
    }

    #[tokio::test]
    async fn async_driver_times_out() {
        let (fake, _) = FakeServer::new();
        let mut fake = fake.stall();
        let err = wait_async(select(), &mut fake, Some(Duration::from_millis(20))).await.unwrap_err();
        assert!(err.is_timeout());
    }
}
