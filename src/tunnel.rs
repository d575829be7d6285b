//! The tunnel endpoint: the server-side state machine that pairs an
//! inbound `POST` (client→server bytes) with a long-running `GET`
//! response (server→client bytes), reopening each side independently as
//! its `Content-Length` window is exhausted.

use crate::errors::{ProtocolError, TunnelError};
use crate::http::framer::{encode_response_headers, try_parse_request, ParsedRequest};
use crate::http::types::Method;
use crate::platform::Acceptor;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use crate::buffer::RingBuffer;

/// Padding octet emitted on the server→client direction: ASCII `'F'`.
pub const PADDING_BYTE: u8 = b'F';

/// How many bytes of header we're willing to scan before giving up on a
/// peer that never sends `CRLF CRLF`.
const HEADER_SCAN_LIMIT: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Listening,
    Handshaking,
    Open,
    HalfClosed,
    Closed,
}

/// Immutable-at-construction knobs, mutable only through [`SetOpt`].
#[derive(Debug, Clone)]
pub struct Options {
    pub content_length: usize,
    pub strict_content_length: bool,
    pub keep_alive: Duration,
    pub max_connection_age: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            content_length: 64 * 1024,
            strict_content_length: false,
            keep_alive: Duration::from_secs(5),
            max_connection_age: Duration::from_secs(3600),
        }
    }
}

/// A single whitelisted runtime option, replacing the original's
/// string-keyed `setopt(name, void*)` with a closed set the compiler can
/// check — an unknown option name is simply not representable.
#[derive(Debug, Clone, Copy)]
pub enum SetOpt {
    StrictContentLength(bool),
    KeepAlive(Duration),
    MaxConnectionAge(Duration),
}

/// The server-side tunnel state machine (`LISTENING` → `HANDSHAKING` →
/// `OPEN` → `HALF_CLOSED` → `CLOSED`). Generic over [`Acceptor`] so tests
/// can hand it an in-memory listener instead of a real `TcpListener`.
pub struct TunnelEndpoint<A: Acceptor> {
    listener: A,
    in_conn: Option<A::Conn>,
    out_conn: Option<A::Conn>,
    in_remaining: usize,
    out_remaining: usize,
    in_buf: RingBuffer,
    last_write_time: Instant,
    opened_at: Instant,
    phase: Phase,
    options: Options,
}

impl<A: Acceptor> TunnelEndpoint<A> {
    pub fn new(listener: A, options: Options) -> Self {
        let now = Instant::now();
        Self {
            listener,
            in_conn: None,
            out_conn: None,
            in_remaining: 0,
            out_remaining: 0,
            in_buf: RingBuffer::new(options.content_length.max(4096)),
            last_write_time: now,
            opened_at: now,
            phase: Phase::Listening,
            options,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn keep_alive(&self) -> Duration {
        self.options.keep_alive
    }

    pub fn last_write_time(&self) -> Instant {
        self.last_write_time
    }

    /// Mutates a whitelisted runtime option. There is no error path: every
    /// [`SetOpt`] variant is valid by construction.
    pub fn setopt(&mut self, opt: SetOpt) {
        match opt {
            SetOpt::StrictContentLength(v) => self.options.strict_content_length = v,
            SetOpt::KeepAlive(d) => self.options.keep_alive = d,
            SetOpt::MaxConnectionAge(d) => self.options.max_connection_age = d,
        }
    }

    /// Returns the fd the bridge loop should poll for inbound readiness:
    /// `in_conn` once open, or the listener itself while handshaking or
    /// between peers.
    pub fn pollin_fd(&self) -> RawFd {
        match &self.in_conn {
            Some(conn) => conn.as_raw_fd(),
            None => self.listener.as_raw_fd(),
        }
    }

    /// Blocks on the listener, completes the `POST`/`GET` handshake (in
    /// either accept order), and transitions `LISTENING` → `HANDSHAKING`
    /// → `OPEN`.
    pub fn accept(&mut self) -> Result<(), TunnelError> {
        self.phase = Phase::Handshaking;

        let mut first_conn = self.listener.accept()?;
        let (first_req, first_leftover) = Self::read_request(&mut first_conn)?;
        let mut second_conn = self.listener.accept()?;
        let (second_req, second_leftover) = Self::read_request(&mut second_conn)?;

        let in_is_first = match (first_req.method, second_req.method) {
            (Method::Post, _) => true,
            (Method::Get, Method::Post) => false,
            (Method::Get, Method::Get) => {
                return Err(ProtocolError::UnexpectedMethodPairing.into())
            }
        };

        let (in_conn, in_req, in_leftover, out_conn) = if in_is_first {
            (first_conn, first_req, first_leftover, second_conn)
        } else {
            (second_conn, second_req, second_leftover, first_conn)
        };

        let content_length = in_req
            .content_length
            .ok_or(ProtocolError::MissingContentLength)?;

        self.in_buf.reset();
        self.in_remaining = content_length;
        self.buffer_leftover(&in_leftover);
        self.in_conn = Some(in_conn);

        self.out_conn = Some(out_conn);
        self.send_response_headers()?;
        self.out_remaining = self.options.content_length;

        let now = Instant::now();
        self.opened_at = now;
        self.last_write_time = now;
        self.phase = Phase::Open;
        Ok(())
    }

    /// Drains up to `dst.len()` bytes of client→server payload. Returns
    /// `Ok(0)` both on a momentary nothing-to-deliver and on a
    /// window-turnover re-handshake; the bridge loop treats either as
    /// transient, never as EOF.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize, TunnelError> {
        if !self.in_buf.is_empty() {
            return Ok(self.in_buf.consume(dst));
        }
        if self.in_remaining == 0 {
            self.reopen_inbound()?;
            return Ok(0);
        }

        let want = dst.len().min(self.in_remaining);
        let conn = self.in_conn.as_mut().expect("OPEN implies in_conn");
        let n = conn.read(&mut dst[..want])?;
        if n == 0 {
            return Err(TunnelError::PeerClosed);
        }
        self.in_remaining -= n;
        Ok(n)
    }

    /// Writes up to `min(src.len(), out_remaining)` bytes of
    /// server→client payload, transparently padding, closing, and
    /// reopening the outbound window as needed.
    pub fn write(&mut self, src: &[u8]) -> Result<usize, TunnelError> {
        if self.opened_at.elapsed() >= self.options.max_connection_age {
            self.close_and_reopen_outbound(true)?;
        }

        let n = src.len().min(self.out_remaining);
        if n > 0 {
            let conn = self.out_conn.as_mut().expect("OPEN implies out_conn");
            conn.write_all(&src[..n])?;
            self.out_remaining -= n;
            self.last_write_time = Instant::now();
        }
        if self.out_remaining == 0 {
            self.close_and_reopen_outbound(false)?;
        }
        Ok(n)
    }

    /// Writes `n` padding octets without consuming user payload, crossing
    /// a window boundary (close + reopen) if the current window doesn't
    /// have room for all of it. Also rolls the window on its own if
    /// `max_connection_age` has elapsed, since an idle session (padding
    /// only, no `write()` calls) would otherwise never observe it.
    pub fn padding(&mut self, mut n: usize) -> Result<(), TunnelError> {
        if self.opened_at.elapsed() >= self.options.max_connection_age {
            self.close_and_reopen_outbound(true)?;
        }
        while n > 0 {
            if self.out_remaining == 0 {
                self.close_and_reopen_outbound(false)?;
            }
            let take = n.min(self.out_remaining);
            self.write_padding_raw(take)?;
            self.out_remaining -= take;
            self.last_write_time = Instant::now();
            n -= take;
        }
        Ok(())
    }

    /// Time remaining before `max_connection_age` forces the current
    /// outbound window to close and reopen. Used by the bridge loop to
    /// cap its poll timeout so an idle session still observes the age
    /// limit instead of waiting out a full `keep_alive` interval first.
    pub fn max_age_remaining(&self) -> Duration {
        self.options
            .max_connection_age
            .saturating_sub(self.opened_at.elapsed())
    }

    /// Closes both sockets (padding the outbound side first if strict),
    /// returns to `LISTENING`.
    pub fn close(&mut self) -> Result<(), TunnelError> {
        if self.out_conn.is_some() && self.options.strict_content_length && self.out_remaining > 0
        {
            let amt = self.out_remaining;
            self.write_padding_raw(amt)?;
            self.out_remaining = 0;
        }
        self.out_conn = None;
        self.in_conn = None;
        self.in_buf.reset();
        self.phase = Phase::Listening;
        Ok(())
    }

    /// Consumes the endpoint, closing the listener and any open sockets.
    pub fn destroy(mut self) -> Result<(), TunnelError> {
        self.close()
    }

    fn send_response_headers(&mut self) -> Result<(), TunnelError> {
        let headers = encode_response_headers(self.options.content_length, true);
        self.out_conn
            .as_mut()
            .expect("out_conn just accepted")
            .write_all(&headers)?;
        Ok(())
    }

    fn buffer_leftover(&mut self, leftover: &[u8]) {
        let take = leftover.len().min(self.in_remaining);
        self.in_buf.append(&leftover[..take]);
        self.in_remaining -= take;
    }

    fn write_padding_raw(&mut self, n: usize) -> Result<(), TunnelError> {
        if n == 0 {
            return Ok(());
        }
        let conn = self.out_conn.as_mut().expect("padding implies out_conn");
        let filler = [PADDING_BYTE; 256];
        let mut left = n;
        while left > 0 {
            let chunk = left.min(filler.len());
            conn.write_all(&filler[..chunk])?;
            left -= chunk;
        }
        Ok(())
    }

    fn close_and_reopen_outbound(&mut self, pad_first: bool) -> Result<(), TunnelError> {
        if pad_first && self.options.strict_content_length && self.out_remaining > 0 {
            let amt = self.out_remaining;
            self.write_padding_raw(amt)?;
            self.out_remaining = 0;
        }
        self.out_conn = None;

        let mut conn = self.listener.accept()?;
        let (_req, _leftover) = Self::read_request(&mut conn)?;
        self.out_conn = Some(conn);
        self.send_response_headers()?;
        self.out_remaining = self.options.content_length;
        self.opened_at = Instant::now();
        self.last_write_time = Instant::now();
        Ok(())
    }

    fn reopen_inbound(&mut self) -> Result<(), TunnelError> {
        self.in_conn = None;
        let mut conn = self.listener.accept()?;
        let (req, leftover) = Self::read_request(&mut conn)?;
        if req.method != Method::Post {
            return Err(ProtocolError::UnexpectedMethodPairing.into());
        }
        let content_length = req
            .content_length
            .ok_or(ProtocolError::MissingContentLength)?;

        self.in_remaining = content_length;
        self.buffer_leftover(&leftover);
        self.in_conn = Some(conn);
        Ok(())
    }

    fn read_request(conn: &mut A::Conn) -> Result<(ParsedRequest, Vec<u8>), TunnelError> {
        let mut scratch = Vec::with_capacity(512);
        let mut tmp = [0u8; 512];
        loop {
            if let Some(parsed) = try_parse_request(&scratch)? {
                let leftover = scratch[parsed.header_end..].to_vec();
                return Ok((parsed, leftover));
            }
            if scratch.len() >= HEADER_SCAN_LIMIT {
                return Err(ProtocolError::InvalidHeader.into());
            }
            let n = conn.read(&mut tmp)?;
            if n == 0 {
                return Err(TunnelError::PeerClosed);
            }
            scratch.extend_from_slice(&tmp[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use std::os::unix::io::RawFd;
    use std::sync::{Arc, Mutex};

    /// A duplex in-memory pipe used in place of a socket: writes to one
    /// end land in a queue the other end's reads drain.
    #[derive(Clone)]
    struct MemConn {
        inbound: Arc<Mutex<VecDeque<u8>>>,
        outbound: Arc<Mutex<VecDeque<u8>>>,
        fd: RawFd,
    }

    impl Read for MemConn {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut q = self.inbound.lock().unwrap();
            let n = buf.len().min(q.len());
            for slot in buf.iter_mut().take(n) {
                *slot = q.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for MemConn {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outbound.lock().unwrap().extend(buf.iter().copied());
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl AsRawFd for MemConn {
        fn as_raw_fd(&self) -> RawFd {
            self.fd
        }
    }

    /// Fake listener: yields pre-scripted `MemConn`s in order, one per
    /// `accept()` call, as both the handshake and the spec require
    /// accept-order pairing rather than any form of correlation.
    struct FakeListener {
        queue: Mutex<VecDeque<MemConn>>,
    }

    impl Acceptor for FakeListener {
        type Conn = MemConn;

        fn accept(&self) -> io::Result<MemConn> {
            self.queue
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| io::Error::new(io::ErrorKind::WouldBlock, "no queued connection"))
        }

        fn as_raw_fd(&self) -> RawFd {
            -1
        }
    }

    fn mem_conn(request: &[u8], fd: RawFd) -> (MemConn, Arc<Mutex<VecDeque<u8>>>) {
        let inbound = Arc::new(Mutex::new(request.iter().copied().collect()));
        let outbound = Arc::new(Mutex::new(VecDeque::new()));
        (
            MemConn {
                inbound,
                outbound: outbound.clone(),
                fd,
            },
            outbound,
        )
    }

    fn drain(q: &Arc<Mutex<VecDeque<u8>>>) -> Vec<u8> {
        q.lock().unwrap().iter().copied().collect()
    }

    #[test]
    fn handshake_pairs_post_then_get() {
        let (post, _) = mem_conn(b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello", 3);
        let (get, get_out) = mem_conn(b"GET /x HTTP/1.1\r\n\r\n", 4);
        let listener = FakeListener {
            queue: Mutex::new(VecDeque::from([post, get])),
        };
        let mut tunnel = TunnelEndpoint::new(
            listener,
            Options {
                content_length: 16,
                ..Options::default()
            },
        );

        tunnel.accept().unwrap();
        assert_eq!(tunnel.phase(), Phase::Open);

        let mut buf = [0u8; 5];
        assert_eq!(tunnel.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");

        let written = drain(&get_out);
        assert!(written.starts_with(b"HTTP/1.1 200 OK\r\n"));
    }

    #[test]
    fn handshake_pairs_get_then_post() {
        let (get, _get_out) = mem_conn(b"GET /x HTTP/1.1\r\n\r\n", 4);
        let (post, _) = mem_conn(b"POST /x HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc", 3);
        let listener = FakeListener {
            queue: Mutex::new(VecDeque::from([get, post])),
        };
        let mut tunnel = TunnelEndpoint::new(listener, Options::default());
        tunnel.accept().unwrap();
        assert_eq!(tunnel.phase(), Phase::Open);
    }

    #[test]
    fn strict_mode_pads_to_exactly_content_length() {
        let (post, _) = mem_conn(b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello", 3);
        let (get, get_out) = mem_conn(b"GET /x HTTP/1.1\r\n\r\n", 4);
        let listener = FakeListener {
            queue: Mutex::new(VecDeque::from([post, get])),
        };
        let mut tunnel = TunnelEndpoint::new(
            listener,
            Options {
                content_length: 16,
                strict_content_length: true,
                ..Options::default()
            },
        );
        tunnel.accept().unwrap();

        let mut dst = [0u8; 5];
        tunnel.read(&mut dst).unwrap();
        tunnel.write(&dst).unwrap();
        tunnel.close().unwrap();

        let body = body_of(&drain(&get_out));
        assert_eq!(body.len(), 16);
        assert_eq!(&body[..5], b"hello");
        assert!(body[5..].iter().all(|&b| b == PADDING_BYTE));
    }

    #[test]
    fn window_turnover_mid_write_splits_across_two_windows() {
        let (post, _) = mem_conn(
            b"POST /x HTTP/1.1\r\nContent-Length: 8\r\n\r\nabcdefgh",
            3,
        );
        let (get1, get1_out) = mem_conn(b"GET /x HTTP/1.1\r\n\r\n", 4);
        let (get2, get2_out) = mem_conn(b"GET /x HTTP/1.1\r\n\r\n", 5);
        // A write that lands exactly on the window edge reopens immediately
        // (per write()'s own spec), so a third GET must be queued too.
        let (get3, _get3_out) = mem_conn(b"GET /x HTTP/1.1\r\n\r\n", 6);
        let listener = FakeListener {
            queue: Mutex::new(VecDeque::from([post, get1, get2, get3])),
        };
        let mut tunnel = TunnelEndpoint::new(
            listener,
            Options {
                content_length: 4,
                ..Options::default()
            },
        );
        tunnel.accept().unwrap();

        let mut dst = [0u8; 8];
        let n = tunnel.read(&mut dst).unwrap();
        assert_eq!(n, 8);

        let written = tunnel.write(&dst).unwrap();
        assert_eq!(written, 4, "write() must stop exactly at the window edge");
        let remainder = tunnel.write(&dst[written..]).unwrap();
        assert_eq!(remainder, 4);

        assert_eq!(body_of(&drain(&get1_out)), b"abcd");
        assert_eq!(body_of(&drain(&get2_out)), b"efgh");
    }

    #[test]
    fn zero_byte_session_closes_cleanly() {
        let (post, _) = mem_conn(b"POST /x HTTP/1.1\r\nContent-Length: 0\r\n\r\n", 3);
        let (get, get_out) = mem_conn(b"GET /x HTTP/1.1\r\n\r\n", 4);
        let listener = FakeListener {
            queue: Mutex::new(VecDeque::from([post, get])),
        };
        let mut tunnel = TunnelEndpoint::new(
            listener,
            Options {
                content_length: 16,
                strict_content_length: true,
                ..Options::default()
            },
        );
        tunnel.accept().unwrap();
        tunnel.close().unwrap();

        let body = body_of(&drain(&get_out));
        assert_eq!(body.len(), 16);
        assert!(body.iter().all(|&b| b == PADDING_BYTE));
    }

    #[test]
    fn get_and_get_handshake_is_a_protocol_error() {
        let (get1, _) = mem_conn(b"GET /x HTTP/1.1\r\n\r\n", 3);
        let (get2, _) = mem_conn(b"GET /y HTTP/1.1\r\n\r\n", 4);
        let listener = FakeListener {
            queue: Mutex::new(VecDeque::from([get1, get2])),
        };
        let mut tunnel = TunnelEndpoint::new(listener, Options::default());
        assert_eq!(
            tunnel.accept(),
            Err(ProtocolError::UnexpectedMethodPairing.into())
        );
    }

    #[test]
    fn chunked_transfer_encoding_is_rejected() {
        let (post, _) = mem_conn(
            b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
            3,
        );
        let (get, _) = mem_conn(b"GET /x HTTP/1.1\r\n\r\n", 4);
        let listener = FakeListener {
            queue: Mutex::new(VecDeque::from([post, get])),
        };
        let mut tunnel = TunnelEndpoint::new(listener, Options::default());
        assert_eq!(
            tunnel.accept(),
            Err(ProtocolError::ChunkedTransferEncoding.into())
        );
    }

    #[test]
    fn padding_crosses_a_window_boundary() {
        let (post, _) = mem_conn(b"POST /x HTTP/1.1\r\nContent-Length: 0\r\n\r\n", 3);
        let (get1, get1_out) = mem_conn(b"GET /x HTTP/1.1\r\n\r\n", 4);
        let (get2, get2_out) = mem_conn(b"GET /x HTTP/1.1\r\n\r\n", 5);
        let listener = FakeListener {
            queue: Mutex::new(VecDeque::from([post, get1, get2])),
        };
        let mut tunnel = TunnelEndpoint::new(
            listener,
            Options {
                content_length: 2,
                ..Options::default()
            },
        );
        tunnel.accept().unwrap();
        tunnel.padding(3).unwrap();

        assert_eq!(body_of(&drain(&get1_out)), b"FF");
        assert_eq!(body_of(&drain(&get2_out)), b"F");
    }

    #[test]
    fn padding_rolls_the_window_once_max_age_elapses_even_with_room_left() {
        let (post, _) = mem_conn(b"POST /x HTTP/1.1\r\nContent-Length: 0\r\n\r\n", 3);
        let (get1, get1_out) = mem_conn(b"GET /x HTTP/1.1\r\n\r\n", 4);
        let (get2, get2_out) = mem_conn(b"GET /x HTTP/1.1\r\n\r\n", 5);
        let listener = FakeListener {
            queue: Mutex::new(VecDeque::from([post, get1, get2])),
        };
        let mut tunnel = TunnelEndpoint::new(
            listener,
            Options {
                content_length: 100,
                strict_content_length: true,
                max_connection_age: Duration::from_millis(1),
                ..Options::default()
            },
        );
        tunnel.accept().unwrap();
        // out_remaining is still untouched (100) here; without an age
        // check inside padding() itself, an idle session that only ever
        // pads would never roll this window.
        std::thread::sleep(Duration::from_millis(5));

        tunnel.padding(1).unwrap();

        let first_body = body_of(&drain(&get1_out));
        assert_eq!(first_body.len(), 100, "first window closed out at full length, padded");
        assert!(first_body.iter().all(|&b| b == PADDING_BYTE));

        let second_body = body_of(&drain(&get2_out));
        assert_eq!(&second_body[..1], &[PADDING_BYTE][..]);
    }

    fn body_of(response: &[u8]) -> Vec<u8> {
        let pos = response
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("response must have a header terminator");
        response[pos + 4..].to_vec()
    }
}
