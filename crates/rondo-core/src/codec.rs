//! HTTP/1.x wire codec.
//!
//! [`RequestDecoder`] turns buffered socket bytes into a [`Request`] head and a
//! [`BodyFraming`]; [`BodyDecoder`] then yields the body incrementally, which
//! is what lets streaming upload handlers see chunks as they arrive.
//! [`ResponseEncoder`] serializes a [`Response`] for a single-shot connection.

use bytes::{Bytes, BytesMut};
use memchr::memmem;
use thiserror::Error;
use tracing::warn;

use crate::http::{Method, Request, Response};

/// Longest chunk-size or trailer line accepted inside a chunked body.
const MAX_CHUNK_LINE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed request")]
    InvalidFormat,
    #[error("request head exceeds the configured limit")]
    HeadTooLarge,
    #[error("too many request headers")]
    TooManyHeaders,
    #[error("unsupported HTTP version")]
    UnsupportedVersion,
    #[error("invalid or conflicting body framing")]
    InvalidFraming,
    #[error("request body exceeds the configured limit")]
    BodyTooLarge,
}

impl ParseError {
    /// Status code sent back to the client for this error.
    pub fn status(&self) -> u16 {
        match self {
            ParseError::InvalidFormat | ParseError::InvalidFraming => 400,
            ParseError::HeadTooLarge | ParseError::TooManyHeaders => 431,
            ParseError::UnsupportedVersion => 505,
            ParseError::BodyTooLarge => 413,
        }
    }
}

/// Per-request size limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_head_bytes: usize,
    pub max_headers: usize,
    /// Applies to buffered bodies only; streaming uploads are unbounded.
    pub max_body_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_head_bytes: 64 * 1024,
            max_headers: 100,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

/// How the request body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
}

#[derive(Debug, Clone)]
pub struct RequestDecoder {
    limits: Limits,
}

impl RequestDecoder {
    pub fn new(limits: Limits) -> Self {
        Self { limits }
    }

    /// Parses a request head out of `buf`, consuming it.
    ///
    /// Returns `Ok(None)` while the head is incomplete. Body bytes that
    /// arrived with the head stay in `buf`.
    pub fn decode_head(
        &self,
        buf: &mut BytesMut,
    ) -> Result<Option<(Request, BodyFraming)>, ParseError> {
        // Tolerate empty lines before the request line.
        while buf.starts_with(b"\r\n") {
            let _ = buf.split_to(2);
        }

        let Some(end) = memmem::find(&buf[..], b"\r\n\r\n") else {
            if buf.len() > self.limits.max_head_bytes {
                return Err(ParseError::HeadTooLarge);
            }
            return Ok(None);
        };
        if end + 4 > self.limits.max_head_bytes {
            return Err(ParseError::HeadTooLarge);
        }

        let head = buf.split_to(end + 4);
        let mut lines = head[..end].split(|&b| b == b'\n').map(trim_cr);

        let request_line = lines.next().ok_or(ParseError::InvalidFormat)?;
        let mut request = parse_request_line(request_line)?;

        let mut count = 0;
        for line in lines {
            count += 1;
            if count > self.limits.max_headers {
                return Err(ParseError::TooManyHeaders);
            }
            let (name, value) = parse_header_line(line)?;
            request.headers_mut().append(name, value);
        }

        let framing = body_framing(&request)?;
        Ok(Some((request, framing)))
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn is_token(bytes: &[u8]) -> bool {
    !bytes.is_empty()
        && bytes.iter().all(|&b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}

fn parse_request_line(line: &[u8]) -> Result<Request, ParseError> {
    let mut parts = line.split(|&b| b == b' ');
    let (Some(method), Some(uri), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::InvalidFormat);
    };

    if !is_token(method) || uri.is_empty() {
        return Err(ParseError::InvalidFormat);
    }
    let uri = std::str::from_utf8(uri).map_err(|_| ParseError::InvalidFormat)?;
    if uri.bytes().any(|b| b.is_ascii_control()) {
        return Err(ParseError::InvalidFormat);
    }

    let minor = match version {
        b"HTTP/1.1" => 1,
        b"HTTP/1.0" => 0,
        v if v.starts_with(b"HTTP/") => return Err(ParseError::UnsupportedVersion),
        _ => return Err(ParseError::InvalidFormat),
    };

    let mut request = Request::new(Method::from_bytes(method), uri);
    request.set_minor_version(minor);
    Ok(request)
}

fn parse_header_line(line: &[u8]) -> Result<(String, String), ParseError> {
    let colon = memchr::memchr(b':', line).ok_or(ParseError::InvalidFormat)?;
    let name = &line[..colon];
    if !is_token(name) {
        return Err(ParseError::InvalidFormat);
    }
    let value = line[colon + 1..].trim_ascii();
    let name = std::str::from_utf8(name).map_err(|_| ParseError::InvalidFormat)?;
    let value = std::str::from_utf8(value).map_err(|_| ParseError::InvalidFormat)?;
    Ok((name.to_string(), value.to_string()))
}

/// Transfer-Encoding overrides Content-Length, but a request carrying both
/// is rejected rather than guessed at.
fn body_framing(request: &Request) -> Result<BodyFraming, ParseError> {
    let headers = request.headers();

    let mut chunked = false;
    let mut has_encoding = false;
    for value in headers.get_all("transfer-encoding") {
        has_encoding = true;
        let last = value.split(',').map(str::trim).next_back().unwrap_or("");
        chunked = last.eq_ignore_ascii_case("chunked");
    }

    let mut length: Option<u64> = None;
    for value in headers.get_all("content-length") {
        let parsed = value
            .trim()
            .parse::<u64>()
            .map_err(|_| ParseError::InvalidFraming)?;
        match length {
            Some(existing) if existing != parsed => return Err(ParseError::InvalidFraming),
            _ => length = Some(parsed),
        }
    }

    match (has_encoding, chunked, length) {
        (true, true, None) => Ok(BodyFraming::Chunked),
        (true, _, _) => Err(ParseError::InvalidFraming),
        (false, _, Some(0)) | (false, _, None) => Ok(BodyFraming::Empty),
        (false, _, Some(n)) => Ok(BodyFraming::Length(n)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyEvent {
    Data(Bytes),
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    Length(u64),
    Chunked(ChunkState),
    Done,
}

/// Incremental body decoder for one request.
#[derive(Debug, Clone)]
pub struct BodyDecoder {
    state: BodyState,
}

impl BodyDecoder {
    pub fn new(framing: BodyFraming) -> Self {
        let state = match framing {
            BodyFraming::Empty => BodyState::Done,
            BodyFraming::Length(n) => BodyState::Length(n),
            BodyFraming::Chunked => BodyState::Chunked(ChunkState::Size),
        };
        Self { state }
    }

    pub fn is_done(&self) -> bool {
        self.state == BodyState::Done
    }

    /// Pulls the next body event out of `buf`. `Ok(None)` means more bytes
    /// are needed from the socket.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<BodyEvent>, ParseError> {
        loop {
            match self.state {
                BodyState::Done => return Ok(Some(BodyEvent::End)),
                BodyState::Length(0) => self.state = BodyState::Done,
                BodyState::Length(remaining) => {
                    let Some(data) = take_up_to(buf, remaining) else {
                        return Ok(None);
                    };
                    self.state = BodyState::Length(remaining - data.len() as u64);
                    return Ok(Some(BodyEvent::Data(data)));
                }
                BodyState::Chunked(ChunkState::Size) => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(None);
                    };
                    let size = line[..].split(|&b| b == b';').next().unwrap_or_default();
                    let size = std::str::from_utf8(size)
                        .ok()
                        .and_then(|s| u64::from_str_radix(s.trim(), 16).ok())
                        .ok_or(ParseError::InvalidFraming)?;
                    self.state = if size == 0 {
                        BodyState::Chunked(ChunkState::Trailers)
                    } else {
                        BodyState::Chunked(ChunkState::Data(size))
                    };
                }
                BodyState::Chunked(ChunkState::Data(remaining)) => {
                    let Some(data) = take_up_to(buf, remaining) else {
                        return Ok(None);
                    };
                    let left = remaining - data.len() as u64;
                    self.state = if left == 0 {
                        BodyState::Chunked(ChunkState::DataEnd)
                    } else {
                        BodyState::Chunked(ChunkState::Data(left))
                    };
                    return Ok(Some(BodyEvent::Data(data)));
                }
                BodyState::Chunked(ChunkState::DataEnd) => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(ParseError::InvalidFraming);
                    }
                    let _ = buf.split_to(2);
                    self.state = BodyState::Chunked(ChunkState::Size);
                }
                BodyState::Chunked(ChunkState::Trailers) => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(None);
                    };
                    // trailer fields are discarded
                    if line.is_empty() {
                        self.state = BodyState::Done;
                    }
                }
            }
        }
    }
}

fn take_up_to(buf: &mut BytesMut, limit: u64) -> Option<Bytes> {
    if buf.is_empty() {
        return None;
    }
    let n = usize::try_from(limit).unwrap_or(usize::MAX).min(buf.len());
    Some(buf.split_to(n).freeze())
}

/// Splits off one CRLF-terminated line, without its terminator.
fn take_line(buf: &mut BytesMut) -> Result<Option<BytesMut>, ParseError> {
    match memmem::find(&buf[..], b"\r\n") {
        Some(pos) if pos > MAX_CHUNK_LINE => Err(ParseError::InvalidFraming),
        Some(pos) => {
            let mut line = buf.split_to(pos + 2);
            line.truncate(pos);
            Ok(Some(line))
        }
        None if buf.len() > MAX_CHUNK_LINE => Err(ParseError::InvalidFraming),
        None => Ok(None),
    }
}

pub struct ResponseEncoder;

impl ResponseEncoder {
    /// Serializes `response` for a connection that closes after writing it.
    ///
    /// `head_only` suppresses the body (answers to HEAD) while keeping the
    /// Content-Length the body would have had.
    pub fn encode(response: &Response, head_only: bool, dst: &mut BytesMut) {
        let status = response.status();
        let mut itoa_buf = itoa::Buffer::new();

        dst.extend_from_slice(b"HTTP/1.1 ");
        dst.extend_from_slice(itoa_buf.format(status).as_bytes());
        dst.extend_from_slice(b" ");
        dst.extend_from_slice(response.reason().as_bytes());
        dst.extend_from_slice(b"\r\n");

        for (name, value) in response.headers().iter() {
            if name.eq_ignore_ascii_case("connection") {
                continue;
            }
            if !is_valid_header(name, value) {
                warn!(header = ?name, "dropping response header with forbidden characters");
                continue;
            }
            put_header(dst, name, value);
        }

        let bodiless = (100..200).contains(&status) || status == 204 || status == 304;
        if !bodiless && !response.headers().contains("content-length") {
            put_header(
                dst,
                "Content-Length",
                itoa_buf.format(response.body().len()),
            );
        }
        if !response.headers().contains("date") {
            put_header(dst, "Date", &httpdate::fmt_http_date(std::time::SystemTime::now()));
        }
        put_header(dst, "Connection", "close");
        dst.extend_from_slice(b"\r\n");

        if !head_only && !bodiless {
            dst.extend_from_slice(response.body());
        }
    }
}

/// Names are tokens; values may not break the line.
fn is_valid_header(name: &str, value: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_graphic() && b != b':')
        && !value.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0)
}

fn put_header(dst: &mut BytesMut, name: &str, value: &str) {
    dst.extend_from_slice(name.as_bytes());
    dst.extend_from_slice(b": ");
    dst.extend_from_slice(value.as_bytes());
    dst.extend_from_slice(b"\r\n");
}
