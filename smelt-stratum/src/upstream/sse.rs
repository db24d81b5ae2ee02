//! Server-Sent Events client for coinserver template streams.
//!
//! Minimal line-level SSE: the stream yields one [`SseEvent`] per `event:` or
//! `data:` line rather than coalescing a full event block, and the watcher
//! tracks the pending event label itself. Coinservers emit exactly one data
//! line per template, so nothing more is needed.

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::Client;

use super::UpstreamError;

/// One field line from the event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Set for an `event:` line.
    pub event: Option<String>,
    /// Set for a `data:` line.
    pub data: Option<String>,
}

/// An open SSE subscription.
pub struct SseStream {
    chunks: BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    buf: Vec<u8>,
}

impl SseStream {
    /// Subscribe to an event-stream URL.
    pub async fn connect(client: &Client, url: &str) -> Result<Self, UpstreamError> {
        let response = client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?
            .error_for_status()?;
        Ok(Self {
            chunks: response.bytes_stream().boxed(),
            buf: Vec::with_capacity(4096),
        })
    }

    /// Next field line, or `None` when the server closed the stream.
    pub async fn next_event(&mut self) -> Result<Option<SseEvent>, UpstreamError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                if let Some(event) = parse_line(line.trim_end_matches(['\r', '\n'])) {
                    return Ok(Some(event));
                }
                continue;
            }
            match self.chunks.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(None),
            }
        }
    }
}

/// Parse one SSE line. Blank separators and comment/unknown fields yield
/// nothing.
fn parse_line(line: &str) -> Option<SseEvent> {
    if let Some(rest) = line.strip_prefix("event:") {
        return Some(SseEvent {
            event: Some(rest.trim().to_string()),
            data: None,
        });
    }
    if let Some(rest) = line.strip_prefix("data:") {
        return Some(SseEvent {
            event: None,
            data: Some(rest.trim().to_string()),
        });
    }
    None
}
