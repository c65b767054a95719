pub mod station;

use std::fmt::Write as _;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::clock::{LamportClock, CLOCK_HEADER};
use crate::protocol::parse;
use crate::protocol::{encode_request, Method, CONTENT_LENGTH};
use crate::store::{Payload, Snapshot, ID_FIELD};

/// Port the aggregator listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 4567;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RESPONSE_HEADERS: usize = 64;
const MAX_RESPONSE_BODY: usize = 64 * 1024 * 1024;

/// Normalize a `[http://]host[:port][/...]` argument into `host:port`.
pub fn parse_server(arg: &str) -> Result<String> {
    let rest = arg.strip_prefix("http://").unwrap_or(arg);
    let authority = rest.split('/').next().unwrap_or_default();

    if authority.is_empty() {
        bail!("server address {arg:?} has no host");
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                bail!("server address {arg:?} has no host");
            }
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid port in server address {arg:?}"))?;
            Ok(format!("{host}:{port}"))
        }
        None => Ok(format!("{authority}:{DEFAULT_PORT}")),
    }
}

/// Decoded aggregator response.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub clock: u64,
    pub body: Vec<u8>,
}

/// One-request-per-connection client for the aggregator.
///
/// Keeps its own Lamport clock across requests: ticked before each send,
/// advanced past the server's stamp on every reply.
pub struct Client {
    addr: String,
    user_agent: String,
    timeout: Duration,
    clock: LamportClock,
}

impl Client {
    /// Create a client for `addr` (`host:port`).
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            user_agent: format!("weatherhub/{}", env!("CARGO_PKG_VERSION")),
            timeout: DEFAULT_TIMEOUT,
            clock: LamportClock::new(),
        }
    }

    /// Bound a full request/response exchange.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn clock(&self) -> &LamportClock {
        &self.clock
    }

    /// Submit a producer payload. Returns the success status (200 or 201).
    pub async fn put(&self, payload: &Payload) -> Result<u16> {
        let body = serde_json::to_vec(payload).context("encoding payload")?;
        let reply = self.exchange(Method::Put, Some(body.as_slice())).await?;

        match reply.status {
            200 | 201 => Ok(reply.status),
            status => bail!("aggregator rejected update with status {status}"),
        }
    }

    /// Fetch the aggregator's current view of all live producers.
    pub async fn get(&self) -> Result<Snapshot> {
        let reply = self.exchange(Method::Get, None).await?;
        if reply.status != 200 {
            bail!("unexpected status {} from aggregator", reply.status);
        }

        serde_json::from_slice(&reply.body).context("decoding snapshot")
    }

    /// Send one request and read the full reply.
    pub async fn exchange(&self, method: Method, body: Option<&[u8]>) -> Result<Reply> {
        let stamp = self.clock.tick();
        let request = encode_request(method, &self.user_agent, stamp, body);

        let reply = tokio::time::timeout(self.timeout, self.roundtrip(&request))
            .await
            .with_context(|| format!("timed out talking to {}", self.addr))??;

        debug!(
            %method,
            status = reply.status,
            sent = stamp,
            clock = reply.clock,
            "aggregator replied",
        );

        Ok(reply)
    }

    async fn roundtrip(&self, request: &[u8]) -> Result<Reply> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("connecting to {}", self.addr))?;
        let (read_half, mut write_half) = stream.into_split();

        write_half
            .write_all(request)
            .await
            .context("sending request")?;

        let mut reader = BufReader::new(read_half);
        let line = parse::read_line(&mut reader)
            .await?
            .context("aggregator closed the connection without replying")?;
        let status = parse::parse_status_line(&line)?;
        let headers = parse::read_headers(&mut reader, MAX_RESPONSE_HEADERS).await?;

        let clock = self
            .clock
            .observe_header(headers.get(CLOCK_HEADER).map(String::as_str));

        let body = match headers.get(CONTENT_LENGTH) {
            Some(_) => match parse::content_length(&headers)? {
                0 => Vec::new(),
                len => parse::read_body(&mut reader, len, MAX_RESPONSE_BODY).await?,
            },
            None => Vec::new(),
        };

        Ok(Reply {
            status,
            clock,
            body,
        })
    }
}

/// Render a snapshot as `key: value` blocks, one per station.
///
/// With `station` set, only that station is shown.
pub fn render(snapshot: &Snapshot, station: Option<&str>) -> String {
    let mut out = String::new();

    match station {
        Some(id) => match snapshot.get(id) {
            Some(payload) => render_station(&mut out, id, payload),
            None => out.push_str("Station ID not found.\n"),
        },
        None if snapshot.is_empty() => out.push_str("No data received.\n"),
        None => {
            for (i, (id, payload)) in snapshot.iter().enumerate() {
                if i > 0 {
                    out.push('\n');
                }
                render_station(&mut out, id, payload);
            }
        }
    }

    out
}

fn render_station(out: &mut String, id: &str, payload: &Payload) {
    let _ = writeln!(out, "Station ID: {id}");
    for (key, value) in payload {
        if key == ID_FIELD {
            continue;
        }
        match value {
            Value::String(s) => {
                let _ = writeln!(out, "{key}: {s}");
            }
            other => {
                let _ = writeln!(out, "{key}: {other}");
            }
        }
    }
}
