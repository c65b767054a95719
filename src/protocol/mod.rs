//! Text request/response framing shared by the server and the clients.
//!
//! The format borrows HTTP/1.1's request and status lines but is not
//! general HTTP: one request per connection, no chunking, no keep-alive.

pub mod parse;

use std::collections::HashMap;
use std::fmt;

use crate::clock::CLOCK_HEADER;

/// The only resource the aggregator serves.
pub const WEATHER_PATH: &str = "/weather.json";

pub const CONTENT_LENGTH: &str = "Content-Length";
pub const CONTENT_TYPE: &str = "Content-Type";
pub const USER_AGENT: &str = "User-Agent";

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Header map. Keys are case-sensitive.
pub type Headers = HashMap<String, String>;

/// Request methods the aggregator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
}

impl Method {
    /// Parse a method token, ignoring ASCII case.
    pub fn from_token(token: &str) -> Option<Self> {
        if token.eq_ignore_ascii_case("GET") {
            Some(Self::Get)
        } else if token.eq_ignore_ascii_case("PUT") {
            Some(Self::Put)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed `METHOD PATH VERSION` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub path: String,
    pub version: String,
}

/// What a request resolves to once its line is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Read,
    Write,
    Reject,
}

impl RequestLine {
    /// Dispatch decision for this request.
    pub fn route(&self) -> Route {
        if self.path != WEATHER_PATH {
            return Route::Reject;
        }

        match Method::from_token(&self.method) {
            Some(Method::Get) => Route::Read,
            Some(Method::Put) => Route::Write,
            None => Route::Reject,
        }
    }
}

/// Response status codes used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Created,
    BadRequest,
    LengthRequired,
    InternalServerError,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::Created => 201,
            Self::BadRequest => 400,
            Self::LengthRequired => 411,
            Self::InternalServerError => 500,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Created => "Created",
            Self::BadRequest => "Bad Request",
            Self::LengthRequired => "Length Required",
            Self::InternalServerError => "Internal Server Error",
        }
    }

    pub fn as_label(self) -> &'static str {
        match self {
            Self::Ok => "200",
            Self::Created => "201",
            Self::BadRequest => "400",
            Self::LengthRequired => "411",
            Self::InternalServerError => "500",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// Aggregator response, stamped with the server's clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub clock: u64,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: Status, clock: u64) -> Self {
        Self {
            status,
            clock,
            body: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Serialize status line, headers, and body.
    pub fn encode(&self) -> Vec<u8> {
        let mut head = format!(
            "HTTP/1.1 {}\r\n{CLOCK_HEADER}: {}\r\n{CONTENT_LENGTH}: {}\r\n",
            self.status,
            self.clock,
            self.body.len(),
        );
        if !self.body.is_empty() {
            head.push_str(&format!("{CONTENT_TYPE}: {JSON_CONTENT_TYPE}\r\n"));
        }
        head.push_str("\r\n");

        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

/// Serialize a request. Used by the producer and reader clients.
pub fn encode_request(method: Method, user_agent: &str, clock: u64, body: Option<&[u8]>) -> Vec<u8> {
    let mut head = format!(
        "{method} {WEATHER_PATH} HTTP/1.1\r\n{USER_AGENT}: {user_agent}\r\n{CLOCK_HEADER}: {clock}\r\n"
    );
    if let Some(body) = body {
        head.push_str(&format!(
            "{CONTENT_TYPE}: {JSON_CONTENT_TYPE}\r\n{CONTENT_LENGTH}: {}\r\n",
            body.len()
        ));
    }
    head.push_str("\r\n");

    let mut out = head.into_bytes();
    if let Some(body) = body {
        out.extend_from_slice(body);
    }
    out
}
