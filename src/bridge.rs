//! The bridge loop: the top-level event loop that owns one tunnel
//! endpoint and one downstream file descriptor, multiplexes readability
//! on both with a keep-alive timeout, and copies bytes in each direction
//! until either side closes.
//!
//! The bridge is ignorant of framing windows — it sees a byte stream. It
//! also polls the self-pipe fd for pending signals on every iteration so
//! shutdown is cooperative rather than asynchronous (§5, §9).

use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;

use crate::errors::TunnelError;
use crate::logging::Logger;
use crate::platform::{poll_readable, Acceptor};
use crate::signals::SelfPipe;
use crate::tunnel::TunnelEndpoint;

/// Largest chunk copied in either direction per readiness event. Matches
/// the tunnel's ring buffer sizing: large enough to drain a socket read
/// in one syscall, small enough to keep per-iteration latency bounded.
const COPY_CHUNK: usize = 16 * 1024;

/// Why the bridge stopped servicing the current peer.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// Downstream EOF or unrecoverable error: session over, the outer
    /// loop should accept the next peer.
    DownstreamClosed,
    /// A signal requested process shutdown.
    ShutdownRequested,
}

/// Runs one accepted session to completion: copies bytes between
/// `tunnel` and `downstream` until the downstream side closes or a
/// shutdown signal arrives. Returns without error on either clean ending;
/// propagates only errors the caller should treat as fatal to the
/// process (i.e. `downstream` itself failing unrecoverably is reported to
/// the caller as `Err`, per §7's "fatal on the downstream device").
pub fn run_session<A, D>(
    tunnel: &mut TunnelEndpoint<A>,
    downstream: &mut D,
    shutdown: &SelfPipe,
    logger: &dyn Logger,
) -> Result<SessionEnd, TunnelError>
where
    A: Acceptor,
    D: Read + Write + AsRawFd,
{
    let mut buf = [0u8; COPY_CHUNK];

    loop {
        if shutdown.shutdown_requested() {
            return Ok(SessionEnd::ShutdownRequested);
        }

        let elapsed = tunnel.last_write_time().elapsed();
        let keep_alive_left = tunnel.keep_alive().saturating_sub(elapsed);
        // Cap at the remaining window age too, so an idle session (no
        // downstream traffic, nothing but keep-alive padding) still wakes
        // up in time to roll the outbound window once max_connection_age
        // elapses, rather than waiting out a full keep_alive interval.
        let timeout = keep_alive_left.min(tunnel.max_age_remaining());

        let fds = [
            downstream.as_raw_fd(),
            tunnel.pollin_fd(),
            shutdown.read_fd(),
        ];
        let ready = poll_readable(&fds, timeout)?;

        if !ready.iter().any(|&r| r) {
            crate::log_debug!(logger, "keep-alive timeout, sending padding");
            tunnel.padding(1)?;
            continue;
        }

        if ready[2] {
            logger.debug(format_args!("shutdown signal observed in bridge loop"));
            return Ok(SessionEnd::ShutdownRequested);
        }

        if ready[0] {
            match downstream.read(&mut buf) {
                Ok(0) => return Ok(SessionEnd::DownstreamClosed),
                Ok(n) => {
                    write_all_to_tunnel(tunnel, &buf[..n])?;
                }
                Err(e) if is_recoverable(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if ready[1] {
            match tunnel.read(&mut buf) {
                Ok(0) => {
                    // Transient: either nothing to deliver yet or a
                    // window-turnover re-handshake just happened.
                }
                Ok(n) => {
                    downstream.write_all(&buf[..n])?;
                }
                Err(TunnelError::PeerClosed) => return Ok(SessionEnd::DownstreamClosed),
                Err(e) => return Err(e),
            }
        }
    }
}

/// `tunnel.write` only ever writes up to the current window's remaining
/// capacity; loop until every byte the downstream side produced has been
/// accepted, since a single read from `downstream` may straddle a window
/// boundary.
fn write_all_to_tunnel<A: Acceptor>(
    tunnel: &mut TunnelEndpoint<A>,
    mut src: &[u8],
) -> Result<(), TunnelError> {
    while !src.is_empty() {
        let n = tunnel.write(src)?;
        src = &src[n..];
    }
    Ok(())
}

fn is_recoverable(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}
