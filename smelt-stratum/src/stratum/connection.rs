//! Line-delimited JSON transport for miner connections.
//!
//! Stratum v1 frames exactly one JSON-RPC message per newline-terminated
//! line. The [`Transport`] trait is the seam between a session and its wire:
//! a framed TCP socket in production, an in-memory channel pair in tests.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::trace;

use super::error::{StratumError, StratumResult};
use super::messages::JsonRpcMessage;

/// Message-level I/O for a Stratum session.
#[async_trait]
pub trait Transport: Send {
    /// Next message from the peer; `None` once the peer hung up.
    async fn read_message(&mut self) -> StratumResult<Option<JsonRpcMessage>>;

    /// Ship one message to the peer.
    async fn write_message(&mut self, msg: &JsonRpcMessage) -> StratumResult<()>;
}

/// An accepted miner socket, framed into messages.
///
/// The read half is consumed through a buffered line iterator, the write
/// half batches each serialized message with its terminator into a single
/// flush.
pub struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: BufWriter<OwnedWriteHalf>,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            lines: BufReader::new(read_half).lines(),
            writer: BufWriter::new(write_half),
        }
    }
}

#[async_trait]
impl Transport for Connection {
    async fn read_message(&mut self) -> StratumResult<Option<JsonRpcMessage>> {
        // Some miner firmware sends bare newlines as keep-alives; they are
        // not frames.
        loop {
            let line = match self.lines.next_line().await? {
                Some(line) => line,
                None => return Ok(None),
            };
            let frame = line.trim();
            if frame.is_empty() {
                continue;
            }
            trace!(rx = %frame, "inbound frame");
            return serde_json::from_str(frame).map(Some).map_err(|e| {
                StratumError::InvalidMessage(format!("undecodable frame ({e}): {frame}"))
            });
        }
    }

    async fn write_message(&mut self, msg: &JsonRpcMessage) -> StratumResult<()> {
        let mut frame = serde_json::to_vec(msg)?;
        trace!(tx = %String::from_utf8_lossy(&frame), "outbound frame");
        frame.push(b'\n');
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Build a scripted in-memory wire: the session end implements [`Transport`],
/// the [`TestMiner`] end plays the miner. No sockets, so session tests stay
/// deterministic.
#[cfg(test)]
pub(crate) fn script_transport() -> (ChannelTransport, TestMiner) {
    let (miner_out, session_in) = tokio::sync::mpsc::unbounded_channel();
    let (session_out, miner_in) = tokio::sync::mpsc::unbounded_channel();
    (
        ChannelTransport {
            inbound: session_in,
            outbound: session_out,
        },
        TestMiner {
            line_out: miner_out,
            line_in: miner_in,
        },
    )
}

/// The session side of a scripted wire.
#[cfg(test)]
pub(crate) struct ChannelTransport {
    inbound: tokio::sync::mpsc::UnboundedReceiver<JsonRpcMessage>,
    outbound: tokio::sync::mpsc::UnboundedSender<JsonRpcMessage>,
}

#[cfg(test)]
#[async_trait]
impl Transport for ChannelTransport {
    async fn read_message(&mut self) -> StratumResult<Option<JsonRpcMessage>> {
        Ok(self.inbound.recv().await)
    }

    async fn write_message(&mut self, msg: &JsonRpcMessage) -> StratumResult<()> {
        self.outbound
            .send(msg.clone())
            .map_err(|_| StratumError::Disconnected)
    }
}

/// The miner side of a scripted wire.
#[cfg(test)]
pub(crate) struct TestMiner {
    line_out: tokio::sync::mpsc::UnboundedSender<JsonRpcMessage>,
    line_in: tokio::sync::mpsc::UnboundedReceiver<JsonRpcMessage>,
}

#[cfg(test)]
impl TestMiner {
    /// Script one inbound message for the session.
    pub fn feed(&self, msg: JsonRpcMessage) {
        self.line_out.send(msg).expect("session side gone");
    }

    /// Wait for the session's next outbound message.
    pub async fn take(&mut self) -> JsonRpcMessage {
        self.line_in.recv().await.expect("session side gone")
    }
}
