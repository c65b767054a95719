//! Per-connection request handling.
//!
//! One request per connection:
//! request line -> headers -> dispatch (read | write | reject) -> response -> close.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use super::Shared;
use crate::clock::CLOCK_HEADER;
use crate::protocol::parse::{self, ParseError};
use crate::protocol::{Response, Route, Status};
use crate::store::{PayloadError, Record};

/// Why a request did not succeed.
#[derive(Error, Debug)]
enum RequestError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("rejecting payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("unsupported request: {method} {path}")]
    Unsupported { method: String, path: String },

    #[error("encoding snapshot: {0}")]
    Encode(#[source] serde_json::Error),
}

impl RequestError {
    fn status(&self) -> Option<Status> {
        match self {
            Self::Parse(e) => e.status(),
            Self::Payload(_) | Self::Unsupported { .. } => Some(Status::BadRequest),
            Self::Encode(_) => Some(Status::InternalServerError),
        }
    }
}

/// Serve one accepted connection to completion.
pub async fn handle_connection(stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) {
    shared.clock.tick();
    shared.health.connections_active.inc();

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    if let Some(response) = handle_request(&mut reader, &shared).await {
        let result = async {
            write_half.write_all(&response.encode()).await?;
            write_half.shutdown().await
        }
        .await;

        if let Err(e) = result {
            warn!(%peer, error = %e, "writing response failed");
        }
    }

    let clock = shared.clock.tick();
    shared.health.lamport_clock.set(clock as f64);
    shared.health.connections_active.dec();
}

/// Read one request from `reader` and produce the response to send, if any.
///
/// `None` means the peer went away (or never spoke) and nothing should be
/// written back.
pub async fn handle_request<R>(reader: &mut R, shared: &Shared) -> Option<Response>
where
    R: AsyncBufRead + Unpin,
{
    let mut method = "invalid";
    let result = dispatch(reader, shared, &mut method).await;

    let (status, body) = match result {
        Ok(reply) => reply,
        Err(e) => match e.status() {
            Some(Status::InternalServerError) => {
                error!(error = %e, "request failed on the server side");
                (Status::InternalServerError, Vec::new())
            }
            Some(status) => {
                warn!(error = %e, status = status.code(), "rejecting request");
                (status, Vec::new())
            }
            None => {
                debug!(error = %e, "connection abandoned");
                return None;
            }
        },
    };

    // Stamp the response with a clock value that covers all work done.
    let clock = shared.clock.tick();
    shared
        .health
        .requests_total
        .with_label_values(&[method, status.as_label()])
        .inc();
    debug!(method, status = status.code(), clock, "request handled");

    Some(Response::new(status, clock).with_body(body))
}

async fn dispatch<R>(
    reader: &mut R,
    shared: &Shared,
    method: &mut &'static str,
) -> Result<(Status, Vec<u8>), RequestError>
where
    R: AsyncBufRead + Unpin,
{
    let limits = &shared.limits;

    let line = timed("request line", limits.read_timeout, parse::read_line(reader))
        .await?
        .ok_or(ParseError::Closed)?;
    let request_line = parse::parse_request_line(&line)?;

    let headers = timed(
        "headers",
        limits.read_timeout,
        parse::read_headers(reader, limits.max_header_lines),
    )
    .await?;

    shared
        .clock
        .observe_header(headers.get(CLOCK_HEADER).map(String::as_str));

    match request_line.route() {
        Route::Read => {
            *method = "GET";
            let snapshot = shared.store.snapshot_all();
            let body = serde_json::to_vec(&snapshot).map_err(RequestError::Encode)?;
            Ok((Status::Ok, body))
        }
        Route::Write => {
            *method = "PUT";
            let len = parse::content_length(&headers)?;
            let body = timed(
                "body",
                limits.read_timeout,
                parse::read_body(reader, len, limits.max_body_bytes),
            )
            .await?;

            let record = Record::from_json(&body)?;
            let id = record.id().to_owned();
            let outcome = shared.store.upsert(record);
            shared.health.live_records.set(shared.store.len() as f64);

            // The write is accepted either way; a failed flush only costs
            // durability until the next successful one.
            match shared.durability.flush_store_blocking(&shared.store).await {
                Ok(_) => shared.health.record_flush("write", true),
                Err(e) => {
                    shared.health.record_flush("write", false);
                    error!(id = %id, error = %e, "flush after write failed");
                }
            }

            debug!(id = %id, created = outcome.is_new(), "record stored");
            let status = if outcome.is_new() {
                Status::Created
            } else {
                Status::Ok
            };
            Ok((status, Vec::new()))
        }
        Route::Reject => {
            *method = "other";
            Err(RequestError::Unsupported {
                method: request_line.method,
                path: request_line.path,
            })
        }
    }
}

async fn timed<T, F>(phase: &'static str, limit: Duration, fut: F) -> Result<T, ParseError>
where
    F: Future<Output = Result<T, ParseError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| ParseError::Timeout { phase })?
}
