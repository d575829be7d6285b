//! Self-pipe signal plumbing.
//!
//! `SIGPIPE` is ignored outright: a write to a peer that has vanished
//! should surface as an `EPIPE` `io::Error`, not tear down the process.
//! `SIGTERM`/`SIGINT` are expected to request an orderly shutdown at the
//! next loop iteration rather than mutate state from signal context, so
//! the handler below does the one thing that's safe there — write a
//! single byte to a pipe — and the bridge loop polls the read end
//! alongside its other two fds.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

static SHUTDOWN_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn request_shutdown(_signum: libc::c_int) {
    let fd = SHUTDOWN_WRITE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = [1u8];
        unsafe {
            libc::write(fd, byte.as_ptr().cast(), 1);
        }
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Owns the self-pipe's read end and installs the process-wide signal
/// handlers. Only one instance should exist per process.
pub struct SelfPipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl SelfPipe {
    /// Ignores `SIGPIPE`, installs `SIGTERM`/`SIGINT` handlers that write
    /// to a fresh non-blocking pipe, and returns the owner of that pipe.
    pub fn install() -> io::Result<Self> {
        let mut fds = [0i32; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);
        set_nonblocking(read_fd)?;
        set_nonblocking(write_fd)?;

        SHUTDOWN_WRITE_FD.store(write_fd, Ordering::SeqCst);

        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
            libc::signal(libc::SIGTERM, request_shutdown as usize);
            libc::signal(libc::SIGINT, request_shutdown as usize);
        }

        Ok(Self { read_fd, write_fd })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Drains the pipe and reports whether a shutdown signal arrived
    /// since the last call.
    pub fn shutdown_requested(&self) -> bool {
        let mut buf = [0u8; 64];
        let mut seen = false;
        loop {
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n > 0 {
                seen = true;
                continue;
            }
            break;
        }
        seen
    }
}

impl Drop for SelfPipe {
    fn drop(&mut self) {
        SHUTDOWN_WRITE_FD.store(-1, Ordering::SeqCst);
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_requested_is_false_until_a_byte_arrives() {
        let pipe = SelfPipe::install().unwrap();
        assert!(!pipe.shutdown_requested());

        unsafe {
            libc::write(pipe.write_fd, b"x".as_ptr().cast(), 1);
        }
        assert!(pipe.shutdown_requested());
        assert!(!pipe.shutdown_requested());
    }
}
