//! Incremental parsing of request and response heads from a byte stream.
//!
//! Every reader is bounded: lines by [`MAX_LINE_BYTES`], header blocks by
//! a caller-supplied line count, bodies by a caller-supplied byte limit.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};

use super::{Headers, RequestLine, Status, CONTENT_LENGTH};

/// Longest accepted request, status, or header line.
pub const MAX_LINE_BYTES: usize = 8 * 1024;

/// Errors that can occur while reading a message off a connection.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("connection closed before a request was sent")]
    Closed,

    #[error("empty request line")]
    EmptyRequestLine,

    #[error("malformed request line: {line:?}")]
    MalformedRequestLine { line: String },

    #[error("malformed status line: {line:?}")]
    MalformedStatusLine { line: String },

    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    #[error("line is not valid UTF-8")]
    InvalidUtf8,

    #[error("more than {limit} header lines")]
    TooManyHeaders { limit: usize },

    #[error("connection closed inside the header block")]
    UnexpectedEof,

    #[error("missing Content-Length header")]
    LengthRequired,

    #[error("invalid Content-Length: {raw:?}")]
    InvalidContentLength { raw: String },

    #[error("empty body")]
    EmptyBody,

    #[error("body of {len} bytes exceeds limit of {limit}")]
    BodyTooLarge { len: usize, limit: usize },

    #[error("body shorter than the declared {expected} bytes")]
    ShortBody { expected: usize },

    #[error("timed out reading {phase}")]
    Timeout { phase: &'static str },

    #[error("reading from connection: {0}")]
    Io(#[from] io::Error),
}

impl ParseError {
    /// Status to answer with, or `None` when the peer is gone and the
    /// connection should just be dropped.
    pub fn status(&self) -> Option<Status> {
        match self {
            Self::Closed | Self::Io(_) => None,
            Self::LengthRequired | Self::InvalidContentLength { .. } => {
                Some(Status::LengthRequired)
            }
            _ => Some(Status::BadRequest),
        }
    }
}

/// Read one LF- or CRLF-terminated line, without its terminator.
///
/// Returns `Ok(None)` on a clean EOF before any byte was read. A final
/// line without a terminator is returned as-is.
pub async fn read_line<R>(reader: &mut R) -> Result<Option<String>, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = MAX_LINE_BYTES as u64 + 2;
    let n = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;

    if n == 0 {
        return Ok(None);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if n as u64 == limit {
        return Err(ParseError::LineTooLong {
            limit: MAX_LINE_BYTES,
        });
    }

    if buf.len() > MAX_LINE_BYTES {
        return Err(ParseError::LineTooLong {
            limit: MAX_LINE_BYTES,
        });
    }

    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| ParseError::InvalidUtf8)
}

/// Parse `METHOD PATH VERSION`.
pub fn parse_request_line(line: &str) -> Result<RequestLine, ParseError> {
    if line.trim().is_empty() {
        return Err(ParseError::EmptyRequestLine);
    }

    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(path), Some(version), None) if version.starts_with("HTTP/") => {
            Ok(RequestLine {
                method: method.to_string(),
                path: path.to_string(),
                version: version.to_string(),
            })
        }
        _ => Err(ParseError::MalformedRequestLine {
            line: line.to_string(),
        }),
    }
}

/// Parse `HTTP/1.1 CODE REASON` and return the code.
pub fn parse_status_line(line: &str) -> Result<u16, ParseError> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => {
            code.parse().map_err(|_| ParseError::MalformedStatusLine {
                line: line.to_string(),
            })
        }
        _ => Err(ParseError::MalformedStatusLine {
            line: line.to_string(),
        }),
    }
}

/// Read `Key: value` lines up to and including the blank separator line.
///
/// Lines without a colon are ignored.
pub async fn read_headers<R>(reader: &mut R, max_lines: usize) -> Result<Headers, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let mut headers = Headers::new();
    let mut count = 0usize;

    loop {
        let line = read_line(reader).await?.ok_or(ParseError::UnexpectedEof)?;
        if line.is_empty() {
            return Ok(headers);
        }

        count += 1;
        if count > max_lines {
            return Err(ParseError::TooManyHeaders { limit: max_lines });
        }

        match line.split_once(':') {
            Some((key, value)) => {
                headers.insert(key.trim().to_string(), value.trim().to_string());
            }
            None => tracing::debug!(line = %line, "ignoring header line without a colon"),
        }
    }
}

/// Declared body length of a request that must carry one.
pub fn content_length(headers: &Headers) -> Result<usize, ParseError> {
    let raw = headers
        .get(CONTENT_LENGTH)
        .ok_or(ParseError::LengthRequired)?;

    raw.parse()
        .map_err(|_| ParseError::InvalidContentLength { raw: raw.clone() })
}

/// Read exactly `len` body bytes. `len` must be positive and within `limit`.
pub async fn read_body<R>(reader: &mut R, len: usize, limit: usize) -> Result<Vec<u8>, ParseError>
where
    R: AsyncRead + Unpin,
{
    if len == 0 {
        return Err(ParseError::EmptyBody);
    }
    if len > limit {
        return Err(ParseError::BodyTooLarge { len, limit });
    }

    let mut body = vec![0u8; len];
    match reader.read_exact(&mut body).await {
        Ok(_) => Ok(body),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(ParseError::ShortBody { expected: len })
        }
        Err(e) => Err(ParseError::Io(e)),
    }
}
