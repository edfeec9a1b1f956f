//! Peer side of the lobby protocol.
//!
//! A [`Client`] owns one connection and one background task. The task reads
//! pushes from the server and dispatches them to the handler registered for
//! their key; it also drains the outbox that [`Client::send_request`] fills,
//! so requests can be issued from inside handlers without awaiting.
//!
//! Handlers run on the receive task. Callers that need another execution
//! context (a UI thread, a channel) forward from the handler themselves. A
//! handler that panics closes the connection like a read error would.

use std::{
    net::SocketAddr,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::{mpsc, watch},
    time::timeout,
};
use tracing::{debug, info, trace, warn};

use crate::{
    envelope::{
        CONNECTION_CLOSED, Push, REGISTRATION, Request, read_envelope, write_line,
        write_line_until,
    },
    error::{ProtocolError, Result},
    handlers::MessageHandlerTable,
    registry::ConnectionId,
};

/// How long closing may spend on requests that are still queued.
pub const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Outcome of the registration handshake as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Pending,
    Accepted(ConnectionId),
    Rejected,
}

#[derive(Clone)]
pub struct Client {
    shared: Arc<ClientState>,
}

struct ClientState {
    server: SocketAddr,
    handlers: MessageHandlerTable,
    outbox: mpsc::UnboundedSender<String>,
    nickname: Mutex<Option<String>>,
    handshake_sent: AtomicBool,
    connected: AtomicBool,
    registration: watch::Sender<Registration>,
    close: watch::Sender<bool>,
    closed: watch::Sender<bool>,
}

impl Client {
    /// Opens the connection and starts the receive task. Call
    /// [`Client::register`] before anything else.
    pub async fn connect(server: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(server)
            .await
            .map_err(|source| ProtocolError::Connect {
                addr: server.to_string(),
                source,
            })?;
        info!(%server, "connected");

        let (reader, writer) = stream.into_split();
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (registration, _) = watch::channel(Registration::Pending);
        let (close, close_rx) = watch::channel(false);
        let (closed, _) = watch::channel(false);

        let shared = Arc::new_cyclic(|weak: &Weak<ClientState>| {
            let handlers = MessageHandlerTable::new();
            handlers.insert(REGISTRATION, Arc::new(registration_handler(weak.clone())));
            ClientState {
                server,
                handlers,
                outbox,
                nickname: Mutex::new(None),
                handshake_sent: AtomicBool::new(false),
                connected: AtomicBool::new(true),
                registration,
                close,
                closed,
            }
        });

        tokio::spawn(receive_loop(
            BufReader::new(reader).lines(),
            writer,
            outbox_rx,
            close_rx,
            Arc::clone(&shared),
        ));

        Ok(Self { shared })
    }

    /// Sends the registration handshake. Must be the first message on the
    /// connection and can only be sent once.
    pub fn register(&self, nickname: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(ProtocolError::NotConnected);
        }
        if self.shared.handshake_sent.swap(true, Ordering::SeqCst) {
            return Err(ProtocolError::AlreadyRegistered);
        }
        *self
            .shared
            .nickname
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(nickname.to_string());
        self.shared.enqueue(&Request::new(REGISTRATION, nickname.to_string()))
    }

    /// Waits until the server answers the handshake or the connection ends.
    pub async fn registration(&self) -> Result<ConnectionId> {
        let mut state = self.shared.registration.subscribe();
        let mut closed = self.shared.closed.subscribe();
        select! {
            _ = async { let _ = state.wait_for(|state| *state != Registration::Pending).await; } => {}
            _ = async { let _ = closed.wait_for(|closed| *closed).await; } => {}
        }

        let outcome = *self.shared.registration.borrow();
        match outcome {
            Registration::Accepted(id) => Ok(id),
            Registration::Rejected => Err(ProtocolError::RegistrationRejected),
            Registration::Pending => Err(ProtocolError::NotConnected),
        }
    }

    /// Server-assigned id, once the handshake has been accepted.
    pub fn id(&self) -> Option<ConnectionId> {
        match *self.shared.registration.borrow() {
            Registration::Accepted(id) => Some(id),
            _ => None,
        }
    }

    pub fn nickname(&self) -> Option<String> {
        self.shared
            .nickname
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.shared.server
    }

    /// Registers `handler` for inbound messages with `key`, replacing any
    /// previous one. [`CONNECTION_CLOSED`] is invoked once on teardown with a
    /// timestamp body.
    pub fn add_message_handler<F>(&self, key: impl Into<String>, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.shared.handlers.insert(key, Arc::new(handler));
    }

    pub fn remove_message_handler(&self, key: &str) {
        self.shared.handlers.remove(key);
    }

    /// Queues a request and returns without waiting for the reply. Replies
    /// come back through the handler registered for the same key; there is
    /// no correlation beyond the key.
    pub fn send_request(&self, key: &str, body: impl Into<String>) -> Result<()> {
        if !self.is_connected() {
            return Err(ProtocolError::NotConnected);
        }
        if !self.shared.handshake_sent.load(Ordering::SeqCst) {
            return Err(ProtocolError::NotRegistered);
        }
        self.shared.enqueue(&Request::new(key, body.into()))
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Asks the receive task to flush pending requests and close the socket.
    /// Returns immediately; await [`Client::closed`] for completion.
    pub fn close_connection(&self) {
        self.shared.request_close();
    }

    /// Resolves once the receive task has torn the connection down.
    pub async fn closed(&self) {
        let mut closed = self.shared.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

impl ClientState {
    fn enqueue(&self, request: &Request) -> Result<()> {
        let line = request.encode()?;
        self.outbox
            .send(line)
            .map_err(|_| ProtocolError::NotConnected)
    }

    fn request_close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if !self.close.send_replace(true) {
            debug!(server = %self.server, "closing connection");
        }
    }

    fn dispatch(&self, push: Push) -> Result<()> {
        let Some(handler) = self.handlers.get(&push.key) else {
            trace!(key = %push.key, "no handler registered, message dropped");
            return Ok(());
        };
        trace!(key = %push.key, "dispatching message");
        catch_unwind(AssertUnwindSafe(|| handler(&push.body)))
            .map_err(|_| ProtocolError::HandlerPanicked { key: push.key })
    }

    fn teardown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let closed_at = Push::new(CONNECTION_CLOSED, Value::from(Utc::now().to_rfc3339()));
        if let Err(err) = self.dispatch(closed_at) {
            warn!(error = ?err, "connection_closed handler failed");
        }
    }
}

fn registration_handler(state: Weak<ClientState>) -> impl Fn(&Value) + Send + Sync + 'static {
    move |body: &Value| {
        let Some(state) = state.upgrade() else {
            return;
        };
        match body.get("id").and_then(|id| ConnectionId::deserialize(id).ok()) {
            Some(id) => {
                info!(%id, "registration accepted");
                state.registration.send_replace(Registration::Accepted(id));
            }
            None => {
                warn!(reply = %body, "registration rejected");
                state.registration.send_replace(Registration::Rejected);
                state.request_close();
            }
        }
    }
}

/// Marks the client closed when the receive task ends, however it ends.
struct ClosedSignal(Arc<ClientState>);

impl Drop for ClosedSignal {
    fn drop(&mut self) {
        self.0.connected.store(false, Ordering::SeqCst);
        self.0.closed.send_replace(true);
    }
}

async fn close_requested(close: &mut watch::Receiver<bool>) {
    let _ = close.wait_for(|close| *close).await;
}

async fn receive_loop(
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    mut writer: OwnedWriteHalf,
    mut outbox: mpsc::UnboundedReceiver<String>,
    mut close: watch::Receiver<bool>,
    state: Arc<ClientState>,
) {
    let _closed = ClosedSignal(Arc::clone(&state));

    let outcome: Result<()> = loop {
        select! {
            _ = close_requested(&mut close) => {
                flush_outbox(&mut outbox, &mut writer).await;
                break Ok(());
            }
            inbound = read_envelope::<_, Value>(&mut lines) => match inbound {
                Ok(Some(push)) => {
                    if let Err(err) = state.dispatch(push) {
                        break Err(err);
                    }
                }
                Ok(None) => {
                    info!(server = %state.server, "server closed the connection");
                    break Ok(());
                }
                Err(err) => break Err(err),
            },
            Some(line) = outbox.recv() => {
                match write_line_until(&mut writer, &line, close_requested(&mut close), CLOSE_GRACE).await {
                    Ok(false) => {}
                    Ok(true) => {
                        flush_outbox(&mut outbox, &mut writer).await;
                        break Ok(());
                    }
                    Err(err) => break Err(err),
                }
            }
        }
    };

    if let Err(err) = &outcome {
        warn!(server = %state.server, error = ?err, "connection lost");
    }

    state.teardown();
    match timeout(CLOSE_GRACE, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(error = ?err, "failed to shut down writer cleanly"),
        Err(_) => debug!("server not reading, writer dropped"),
    }
    drop(writer);
    drop(lines);
}

/// Writes whatever is still queued, for at most [`CLOSE_GRACE`].
async fn flush_outbox(outbox: &mut mpsc::UnboundedReceiver<String>, writer: &mut OwnedWriteHalf) {
    let flush = async {
        while let Ok(line) = outbox.try_recv() {
            write_line(writer, &line).await?;
        }
        Ok::<_, ProtocolError>(())
    };
    match timeout(CLOSE_GRACE, flush).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(error = ?err, "failed to flush queued request"),
        Err(_) => debug!("server not reading, queued requests dropped"),
    }
}
