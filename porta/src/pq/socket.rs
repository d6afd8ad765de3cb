//! Either a tcp or a unix socket.
use std::{
    io::{self, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    os::{fd::{AsRawFd, RawFd}, unix::net::UnixStream},
    time::Duration,
};

/// An either [`TcpStream`] or [`UnixStream`], which implement
/// [`Read`] and [`Write`] transparently.
pub struct Socket {
    kind: Kind,
}

enum Kind {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Socket {
    pub fn connect_tcp(host: &str, port: u16, timeout: Option<Duration>) -> io::Result<Socket> {
        let socket = match timeout {
            None => TcpStream::connect((host, port))?,
            Some(timeout) => {
                let mut last = None;
                let mut found = None;
                for addr in (host, port).to_socket_addrs()? {
                    match TcpStream::connect_timeout(&addr, timeout) {
                        Ok(ok) => {
                            found = Some(ok);
                            break;
                        },
                        Err(err) => last = Some(err),
                    }
                }
                match (found, last) {
                    (Some(ok), _) => ok,
                    (None, Some(err)) => return Err(err),
                    (None, None) => return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "host resolved to no address",
                    )),
                }
            },
        };
        socket.set_nodelay(true)?;
        Ok(Socket { kind: Kind::Tcp(socket) })
    }

    /// Connect to the postgres socket file `.s.PGSQL.{port}` inside `dir`.
    pub fn connect_unix(dir: &str, port: u16) -> io::Result<Socket> {
        let path = format!("{}/.s.PGSQL.{port}", dir.trim_end_matches('/'));
        let socket = UnixStream::connect(path)?;
        Ok(Socket { kind: Kind::Unix(socket) })
    }

    #[cfg(test)]
    pub(crate) fn from_unix(socket: UnixStream) -> Socket {
        Socket { kind: Kind::Unix(socket) }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match &self.kind {
            Kind::Tcp(t) => t.set_nonblocking(nonblocking),
            Kind::Unix(u) => u.set_nonblocking(nonblocking),
        }
    }

    /// Timeout for blocking reads and writes, used while starting up.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match &self.kind {
            Kind::Tcp(t) => {
                t.set_read_timeout(timeout)?;
                t.set_write_timeout(timeout)
            },
            Kind::Unix(u) => {
                u.set_read_timeout(timeout)?;
                u.set_write_timeout(timeout)
            },
        }
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.kind {
            Kind::Tcp(t) => t.read(buf),
            Kind::Unix(u) => u.read(buf),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.kind {
            Kind::Tcp(t) => t.write(buf),
            Kind::Unix(u) => u.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.kind {
            Kind::Tcp(t) => t.flush(),
            Kind::Unix(u) => u.flush(),
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        match &self.kind {
            Kind::Tcp(t) => t.as_raw_fd(),
            Kind::Unix(u) => u.as_raw_fd(),
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            Kind::Tcp(tcp) => std::fmt::Debug::fmt(tcp, f),
            Kind::Unix(unix) => std::fmt::Debug::fmt(unix, f),
        }
    }
}
