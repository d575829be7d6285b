//! Minimal HTTP request parser and response header encoder.
//!
//! The framer recognizes only the subset of HTTP needed to pair a
//! `POST`/`GET` handshake and track body length: request-line, and the
//! `Content-Length`, `Connection`, and `Transfer-Encoding` headers. Every
//! other header is skipped but counted, so a flood of junk headers still
//! trips [`ProtocolError::TooManyHeaders`].
//!
//! Parsing proceeds through the states named in the design: `METHOD`,
//! `URI`, `VERSION`, then a `HEADER_NAME`/`HEADER_VALUE` loop per line,
//! terminated by a blank line (`DONE`). Because headers arrive a socket
//! read at a time, [`try_parse_request`] is called repeatedly on a
//! growing buffer and returns `Ok(None)` until `CRLF CRLF` shows up.

use crate::errors::ProtocolError;
use crate::http::types::{eq_ignore_case, slice_to_usize, Method, Version};

const MAX_HEADERS: usize = 32;
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// A fully parsed request line plus the headers this protocol cares
/// about. `header_end` is the offset into the scanned buffer where the
/// body begins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: Method,
    pub uri: Vec<u8>,
    pub version: Version,
    pub content_length: Option<usize>,
    pub connection_close: bool,
    pub header_end: usize,
}

/// Scans `buf` for a complete header block and parses it.
///
/// Returns `Ok(None)` when `CRLF CRLF` hasn't arrived yet (caller should
/// read more and retry), `Ok(Some(_))` once parsed, or `Err` for any
/// malformed input — including `Transfer-Encoding: chunked`, which this
/// protocol never supports since it relies entirely on length framing.
pub fn try_parse_request(buf: &[u8]) -> Result<Option<ParsedRequest>, ProtocolError> {
    let Some(term_pos) = memchr::memmem::find(buf, HEADER_TERMINATOR) else {
        return Ok(None);
    };
    let header_end = term_pos + HEADER_TERMINATOR.len();
    let head = &buf[..term_pos];

    let mut lines = head.split(|&b| b == b'\n').map(strip_trailing_cr);
    let request_line = lines.next().ok_or(ProtocolError::InvalidHeader)?;

    let (method, consumed) = Method::from_bytes(request_line)?;
    let after_method = &request_line[consumed..];

    let uri_end = memchr::memchr(b' ', after_method).ok_or(ProtocolError::InvalidUri)?;
    let uri = &after_method[..uri_end];
    if uri.is_empty() {
        return Err(ProtocolError::InvalidUri);
    }
    let version_bytes = &after_method[uri_end + 1..];
    let version = Version::from_bytes(version_bytes)?;

    let mut content_length = None;
    let mut connection_close = false;
    let mut chunked = false;
    let mut header_count = 0usize;

    for line in lines {
        if line.is_empty() {
            continue;
        }
        header_count += 1;
        if header_count > MAX_HEADERS {
            return Err(ProtocolError::TooManyHeaders);
        }

        let colon = memchr::memchr(b':', line).ok_or(ProtocolError::InvalidHeader)?;
        let name = &line[..colon];
        let value = trim(&line[colon + 1..]);

        if eq_ignore_case(name, b"content-length") {
            content_length = Some(slice_to_usize(value).ok_or(ProtocolError::InvalidContentLength)?);
        } else if eq_ignore_case(name, b"connection") {
            connection_close = eq_ignore_case(value, b"close");
        } else if eq_ignore_case(name, b"transfer-encoding") {
            chunked |= eq_ignore_case(value, b"chunked");
        }
    }

    if chunked {
        return Err(ProtocolError::ChunkedTransferEncoding);
    }
    if method == Method::Post && content_length.is_none() {
        return Err(ProtocolError::MissingContentLength);
    }

    Ok(Some(ParsedRequest {
        method,
        uri: uri.to_vec(),
        version,
        content_length,
        connection_close,
        header_end,
    }))
}

fn strip_trailing_cr(line: &[u8]) -> &[u8] {
    match line.split_last() {
        Some((b'\r', rest)) => rest,
        _ => line,
    }
}

fn trim(value: &[u8]) -> &[u8] {
    let start = value.iter().position(|b| *b != b' ' && *b != b'\t').unwrap_or(value.len());
    let end = value.iter().rposition(|b| *b != b' ' && *b != b'\t').map_or(start, |i| i + 1);
    &value[start..end]
}

/// Encodes the tunnel's fixed-shape outbound response header block:
/// `200 OK`, the configured `Content-Length`, an opaque content type,
/// and `Connection: close` when the window is about to be torn down.
pub fn encode_response_headers(content_length: usize, connection_close: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(96);
    out.extend_from_slice(b"HTTP/1.1 200 OK\r\n");
    out.extend_from_slice(b"Content-Length: ");
    let mut digits = [0u8; 20];
    out.extend_from_slice(usize_to_bytes(content_length, &mut digits));
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(b"Content-Type: application/octet-stream\r\n");
    if connection_close {
        out.extend_from_slice(b"Connection: close\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Zero-allocation integer-to-ASCII, writing into a caller-owned stack
/// buffer and returning the populated suffix.
pub(crate) fn usize_to_bytes(mut n: usize, buf: &mut [u8; 20]) -> &[u8] {
    if n == 0 {
        buf[19] = b'0';
        return &buf[19..];
    }
    let mut i = buf.len();
    while n > 0 {
        i -= 1;
        buf[i] = b'0' + (n % 10) as u8;
        n /= 10;
    }
    &buf[i..]
}
