//! httunnel's server (`hts`) — the server half of an HTTP tunnel.
//!
//! httptunnel creates a virtual, bidirectional byte stream embedded
//! inside ordinary HTTP `POST`/`GET` request/response traffic, so that
//! traffic resembling plain HTTP can cross middleboxes that otherwise
//! only forward HTTP. This crate is the server side of that tunnel: it
//! accepts the peer's HTTP connections, reassembles the byte stream, and
//! bridges it to a local character device or a forwarded TCP port.
//!
//! # Layout
//!
//! - [`buffer`] — the fixed-capacity ring buffer used for payload staging
//!   and header parsing.
//! - [`http`] — the minimal HTTP vocabulary and framer needed to pair a
//!   `POST`/`GET` handshake and track body length.
//! - [`tunnel`] — [`tunnel::TunnelEndpoint`], the server-side state
//!   machine that is the heart of this crate.
//! - [`bridge`] — the event loop that copies bytes between a tunnel
//!   endpoint and a downstream file descriptor.
//! - [`platform`] — thin OS-facing glue (listen/accept/connect/poll),
//!   named as a seam so the rest of the crate can be tested against fakes.
//! - [`cli`] — argument parsing into an immutable [`cli::Config`].
//! - [`logging`] — a small `Logger` trait threaded explicitly through
//!   construction, replacing the original's global debug state.
//! - [`signals`] — `SIGPIPE` suppression and a self-pipe for cooperative
//!   `SIGTERM`/`SIGINT` shutdown.
//! - [`errors`] — the closed [`errors::TunnelError`] enum shared across
//!   the crate.
//!
//! Everything here is single-threaded and synchronous by design (§5 of
//! the design document this crate follows): one peer at a time, no
//! background threads, no async runtime. That matches the protocol it
//! speaks — a single client pairing one `POST` and one `GET` HTTP
//! connection — and avoids shared-state hazards entirely.

pub mod buffer;
pub mod cli;
pub mod errors;
pub mod http {
    pub mod framer;
    pub mod types;
}
pub mod bridge;
pub mod logging;
pub mod platform;
pub mod signals;
pub mod tunnel;
