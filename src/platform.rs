//! Platform glue: TCP listen/accept, non-blocking connect, device open,
//! readiness multiplexing, monotonic time.
//!
//! Each function is a thin wrapper with no policy of its own, named here
//! so the tunnel and bridge can depend on a trait rather than directly on
//! `std::net`/`libc` — the seam that lets tests substitute an in-memory
//! listener instead of a real socket.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

/// Anything that can be read from, written to, and polled: a real socket
/// or device fd, or a fake used in tests.
pub trait Transport: Read + Write + AsRawFd {}
impl<T: Read + Write + AsRawFd> Transport for T {}

/// A listening endpoint capable of producing new connections on demand.
/// The tunnel's handshake and window-turnover re-accepts go through this
/// trait rather than `TcpListener` directly.
pub trait Acceptor {
    type Conn: Transport;

    fn accept(&self) -> io::Result<Self::Conn>;
    fn as_raw_fd(&self) -> RawFd;
}

impl Acceptor for TcpListener {
    type Conn = TcpStream;

    fn accept(&self) -> io::Result<TcpStream> {
        let (stream, _addr) = TcpListener::accept(self)?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn as_raw_fd(&self) -> RawFd {
        AsRawFd::as_raw_fd(self)
    }
}

/// Binds a TCP listener on every interface at `port`.
///
/// Sets `SO_REUSEADDR` through `socket2` so a restarted server doesn't
/// have to wait out `TIME_WAIT` on the previous listener — a peer
/// reconnect loop otherwise trips this often enough during development
/// to be worth the extra syscall.
pub fn listen_tcp(port: u16) -> io::Result<TcpListener> {
    use socket2::{Domain, Socket, Type};
    use std::net::SocketAddr;

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    Ok(socket.into())
}

/// Connects to `host:port`, used for `--forward-port` destinations.
pub fn connect_tcp(host: &str, port: u16) -> io::Result<TcpStream> {
    TcpStream::connect((host, port))
}

/// Opens a character device (serial line, pty) for bidirectional use.
pub fn open_device(path: &str) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

/// The single monotonic clock consulted by keep-alive and
/// `max_connection_age` bookkeeping.
pub fn now_monotonic() -> Instant {
    Instant::now()
}

/// Either a character device or a forwarded TCP connection: the downstream
/// side of the bridge loop, picked once at startup per `--device`/
/// `--forward-port`.
pub enum Downstream {
    Device(File),
    Forward(TcpStream),
}

impl Read for Downstream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Device(f) => f.read(buf),
            Self::Forward(s) => s.read(buf),
        }
    }
}

impl Write for Downstream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Device(f) => f.write(buf),
            Self::Forward(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Device(f) => f.flush(),
            Self::Forward(s) => s.flush(),
        }
    }
}

impl AsRawFd for Downstream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Device(f) => f.as_raw_fd(),
            Self::Forward(s) => s.as_raw_fd(),
        }
    }
}

/// Waits for readability on any of `fds`, for at most `timeout`. Returns a
/// same-length vector of booleans in fd order. The single
/// readiness-multiplexing syscall the concurrency model allows per
/// iteration.
pub fn poll_readable(fds: &[RawFd], timeout: Duration) -> io::Result<Vec<bool>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();

    let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    let n = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(pollfds.iter().map(|p| p.revents & libc::POLLIN != 0).collect())
}
