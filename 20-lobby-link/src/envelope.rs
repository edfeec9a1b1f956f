use std::{io, time::Duration};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::{
    io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, Lines},
    select,
};

use crate::error::{ProtocolError, Result};

/// Key of the handshake request and of the server's reply to it.
pub const REGISTRATION: &str = "registration";
/// Event broadcast after every registry mutation.
pub const CLIENTS_LIST_CHANGED: &str = "clients_list_changed";
/// Event broadcast once right before the server stops listening.
pub const SERVER_SHUTDOWN: &str = "server_shutdown";
/// Built-in request answered with the current registry snapshot.
pub const GET_CLIENTS_LIST: &str = "get_clients_list";
/// Client-local pseudo key invoked when the receive task tears down.
pub const CONNECTION_CLOSED: &str = "connection_closed";

/// Body of the registration reply sent while registration is closed.
pub const REGISTRATION_CLOSED: &str = "registration closed";

/// One line on the wire: `{"key": ..., "body": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope<B> {
    pub key: String,
    #[serde(default)]
    pub body: B,
}

/// Client to server. The body is always a string; structured payloads are
/// serialized by the application before sending.
pub type Request = Envelope<String>;

/// Server to client (responses, events, registration replies). The body is
/// any JSON value.
pub type Push = Envelope<Value>;

impl<B> Envelope<B> {
    pub fn new(key: impl Into<String>, body: B) -> Self {
        Self {
            key: key.into(),
            body,
        }
    }
}

impl<B: Serialize> Envelope<B> {
    /// Encodes the envelope as a single line without the trailing newline.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

impl<B: DeserializeOwned + Default> Envelope<B> {
    pub fn decode(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(ProtocolError::MalformedMessage)
    }
}

/// Reads the next envelope, skipping blank lines. `Ok(None)` means the peer
/// closed the stream.
///
/// Cancel safe: `Lines::next_line` keeps partial input buffered, so this can
/// sit in a `select!` arm next to a shutdown signal.
pub async fn read_envelope<R, B>(lines: &mut Lines<R>) -> Result<Option<Envelope<B>>>
where
    R: AsyncBufRead + Unpin,
    B: DeserializeOwned + Default,
{
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return Ok(None),
            Err(err) => return Err(ProtocolError::ConnectionLost(err)),
        };

        let trimmed = line.trim_end_matches('\r');
        if trimmed.trim().is_empty() {
            continue;
        }

        return Envelope::decode(trimmed).map(Some);
    }
}

/// Writes an already encoded line, appends the delimiter and flushes.
pub async fn write_line<W>(writer: &mut W, line: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer
        .write_all(&encoded)
        .await
        .map_err(ProtocolError::ConnectionLost)?;
    writer.flush().await.map_err(ProtocolError::ConnectionLost)
}

/// Writes `line` while watching `stop`. Returns `Ok(true)` when `stop` fired
/// before the write completed.
///
/// A line already partly on the wire when `stop` fires gets `grace` to finish,
/// so the stream stays framed. A peer that has stopped reading cannot hold the
/// caller longer than that.
pub async fn write_line_until<W, S>(
    writer: &mut W,
    line: &str,
    stop: S,
    grace: Duration,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
    S: Future<Output = ()>,
{
    let write = write_line(writer, line);
    tokio::pin!(write);
    select! {
        written = &mut write => return written.map(|()| false),
        () = stop => {}
    }

    match tokio::time::timeout(grace, write).await {
        Ok(written) => written.map(|()| true),
        Err(_) => Err(ProtocolError::ConnectionLost(io::Error::new(
            io::ErrorKind::TimedOut,
            "peer stopped reading",
        ))),
    }
}

pub async fn write_envelope<W, B>(writer: &mut W, envelope: &Envelope<B>) -> Result<()>
where
    W: AsyncWrite + Unpin,
    B: Serialize,
{
    let line = envelope.encode()?;
    write_line(writer, &line).await
}
