//! Minimal HTTP session driver.
//!
//! A connection classified as HTTP gets a one-shot plain-text status
//! response and is closed. The request line arrives pre-read from the
//! demultiplexer; only the remaining headers are drained here.

use crate::network::BoxedStream;
use crate::state::Bouncer;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

const HEADER_TIMEOUT: Duration = Duration::from_secs(30);
const HEADER_LIMIT: usize = 16 * 1024;

/// One-shot HTTP responder for classified connections.
pub struct HttpSession;

impl HttpSession {
    /// Answer a classified HTTP request and close. `first_line` is the
    /// request line; `residual` holds header bytes read during
    /// classification.
    #[tracing::instrument(skip_all, fields(%peer))]
    pub async fn run(
        bouncer: Arc<Bouncer>,
        mut stream: BoxedStream,
        peer: SocketAddr,
        first_line: String,
        residual: BytesMut,
    ) -> std::io::Result<()> {
        debug!(%peer, request = %first_line, "http request");
        if !drain_headers(&mut stream, residual).await? {
            return Ok(());
        }

        let mut parts = first_line.split(' ');
        let method = parts.next().unwrap_or("");
        let path = parts.next().unwrap_or("/");
        let body = format!(
            "{} IRC bouncer\n{method} {path}\n",
            bouncer.server_name()
        );
        let response = format!(
            "HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

/// Read until the blank line ending the header block. Returns false if
/// the peer vanished or the headers were oversized or too slow.
async fn drain_headers(stream: &mut BoxedStream, residual: BytesMut) -> std::io::Result<bool> {
    let mut buf = residual;
    loop {
        if buf.windows(2).any(|w| w == b"\n\n")
            || buf.windows(4).any(|w| w == b"\r\n\r\n")
            // request line already consumed; a leading blank line
            // means there were no headers at all
            || buf.starts_with(b"\r\n")
            || buf.starts_with(b"\n")
        {
            return Ok(true);
        }
        if buf.len() >= HEADER_LIMIT {
            debug!("oversized http header block");
            return Ok(false);
        }
        let read = match timeout(HEADER_TIMEOUT, stream.read_buf(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => {
                debug!("http header read timed out");
                return Ok(false);
            }
        };
        if read == 0 {
            return Ok(false);
        }
    }
}
