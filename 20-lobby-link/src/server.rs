//! Authoritative side of the lobby protocol.
//!
//! One accept loop spawns a task per connection. Each task performs the
//! registration handshake, then answers requests on its own socket and drains
//! its outbox, which is where broadcasts land. Broadcasts never touch a socket
//! directly, so a slow or dead peer cannot hold up the others.
//!
//! Every socket write races the stop signal. Once a stop arrives, a task gets
//! [`SHUTDOWN_GRACE`] to finish the line in flight and again to flush what is
//! queued, then drops the socket.

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use serde_json::{Value, json};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, BufReader, Lines},
    net::{TcpListener, TcpStream},
    select,
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    task::{JoinError, JoinHandle, JoinSet},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    envelope::{
        CLIENTS_LIST_CHANGED, GET_CLIENTS_LIST, Push, REGISTRATION, REGISTRATION_CLOSED, Request,
        SERVER_SHUTDOWN, read_envelope, write_line, write_line_until,
    },
    error::{ProtocolError, Result},
    handlers::{EventTable, ResponseTable},
    registry::{
        ClientInfo, Connection, ConnectionId, ConnectionRegistry, MembershipChange,
        OUTBOX_CAPACITY,
    },
};

/// How long a connection task may spend writing after a stop was requested.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Handle to a lobby server. Clones share the same listener, registry and
/// handler tables.
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerState>,
}

struct ServerState {
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    registry: ConnectionRegistry,
    events: EventTable,
    responses: ResponseTable,
    next_id: AtomicU64,
    registration_open: AtomicBool,
    running: AtomicBool,
    stopped: AtomicBool,
    // Held from body generation to the last enqueue so concurrent broadcasts
    // reach every outbox in the same order.
    broadcast_lock: Mutex<()>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ProtocolError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Self::new(listener).map_err(|source| ProtocolError::Bind {
            addr: addr.to_string(),
            source,
        })
    }

    /// Wraps an already bound listener. Nothing is accepted until [`Server::run`].
    pub fn new(listener: TcpListener) -> std::io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (shutdown, _) = watch::channel(false);

        let shared = Arc::new_cyclic(|weak: &Weak<ServerState>| {
            let on_change = weak.clone();
            ServerState {
                local_addr,
                listener: Mutex::new(Some(listener)),
                accept_task: Mutex::new(None),
                registry: ConnectionRegistry::new(move |change| {
                    if let Some(state) = on_change.upgrade() {
                        state.announce_membership(change);
                    }
                }),
                events: EventTable::new(),
                responses: ResponseTable::new(),
                next_id: AtomicU64::new(1),
                registration_open: AtomicBool::new(true),
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                broadcast_lock: Mutex::new(()),
                shutdown,
            }
        });
        install_builtins(&shared);

        Ok(Self { shared })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Registers a generator invoked each time `key` is broadcast.
    pub fn add_event<F>(&self, key: impl Into<String>, generator: F)
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.shared.events.insert(key, Arc::new(generator));
    }

    pub fn remove_event(&self, key: &str) {
        self.shared.events.remove(key);
    }

    /// Registers a responder for requests carrying `key`.
    pub fn add_response<F>(&self, key: impl Into<String>, responder: F)
    where
        F: Fn(&str) -> Value + Send + Sync + 'static,
    {
        self.shared.responses.insert(key, Arc::new(responder));
    }

    pub fn remove_response(&self, key: &str) {
        self.shared.responses.remove(key);
    }

    /// Broadcasts `key` to every registered connection in registry order and
    /// returns how many outboxes accepted the envelope.
    ///
    /// The body is generated now. Must not be called from inside an event
    /// generator.
    pub fn send_event(&self, key: &str) -> Result<usize> {
        self.shared.send_event(key)
    }

    pub fn close_registration(&self) {
        self.shared.registration_open.store(false, Ordering::SeqCst);
        info!("registration closed");
    }

    pub fn open_registration(&self) {
        self.shared.registration_open.store(true, Ordering::SeqCst);
        info!("registration opened");
    }

    pub fn is_registration_open(&self) -> bool {
        self.shared.registration_open.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.shared.registry.infos()
    }

    pub fn client_count(&self) -> usize {
        self.shared.registry.size()
    }

    /// Starts the accept loop on its own task and returns immediately.
    pub fn run(&self) -> Result<()> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(ProtocolError::AlreadyStarted);
        }
        let listener = self
            .shared
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ProtocolError::AlreadyStarted)?;

        let task = tokio::spawn(accept_loop(listener, Arc::clone(&self.shared)));
        *self
            .shared
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
        self.shared.running.store(true, Ordering::SeqCst);

        info!(addr = %self.shared.local_addr, "server started");
        Ok(())
    }

    /// Broadcasts `server_shutdown`, stops accepting, and waits for every
    /// connection task to flush its outbox and close. A peer that stopped
    /// reading is cut off after [`SHUTDOWN_GRACE`]. Later calls do nothing.
    pub async fn shutdown(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("server shutting down");

        if let Err(err) = self.shared.send_event(SERVER_SHUTDOWN) {
            debug!(error = ?err, "shutdown event not sent");
        }
        self.shared.shutdown.send_replace(true);

        let unused_listener = self
            .shared
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(unused_listener);

        let task = self
            .shared
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = ?err, "accept loop ended abnormally");
            }
        }

        self.shared.running.store(false, Ordering::SeqCst);
        info!("server stopped");
    }
}

impl ServerState {
    fn allocate_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn registration_open(&self) -> bool {
        self.registration_open.load(Ordering::SeqCst)
    }

    fn send_event(&self, key: &str) -> Result<usize> {
        let generator = self
            .events
            .get(key)
            .ok_or_else(|| ProtocolError::UnknownKey(key.to_string()))?;

        let _order = self
            .broadcast_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let line = Push::new(key, generator()).encode()?;

        let mut delivered = 0;
        for connection in self.registry.values() {
            match connection.send_line(line.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(id = %connection.id(), key, "outbox full, peer not reading, skipping event")
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(id = %connection.id(), key, "connection gone, skipping event")
                }
            }
        }
        debug!(key, delivered, "event broadcast");
        Ok(delivered)
    }

    fn announce_membership(&self, change: &MembershipChange) {
        match change {
            MembershipChange::Joined(info) => {
                debug!(id = %info.id, nickname = %info.nickname, "member joined")
            }
            MembershipChange::Left(info) => {
                debug!(id = %info.id, nickname = %info.nickname, "member left")
            }
        }
        if let Err(err) = self.send_event(CLIENTS_LIST_CHANGED) {
            debug!(error = ?err, "membership change not announced");
        }
    }

    fn respond(&self, request: Request) -> Result<String> {
        let responder = self
            .responses
            .get(&request.key)
            .ok_or_else(|| ProtocolError::UnknownKey(request.key.clone()))?;
        debug!(key = %request.key, "answering request");
        let body = responder(&request.body);
        Push::new(request.key, body).encode()
    }
}

fn install_builtins(shared: &Arc<ServerState>) {
    let state = Arc::downgrade(shared);
    shared.events.insert(
        CLIENTS_LIST_CHANGED,
        Arc::new(move || clients_list_body(&state)),
    );
    shared.events.insert(
        SERVER_SHUTDOWN,
        Arc::new(|| json!({ "shutdown_timestamp": Utc::now().to_rfc3339() })),
    );

    let state = Arc::downgrade(shared);
    shared.responses.insert(
        GET_CLIENTS_LIST,
        Arc::new(move |_: &str| clients_list_body(&state)),
    );
}

fn clients_list_body(state: &Weak<ServerState>) -> Value {
    let clients = state
        .upgrade()
        .map(|state| state.registry.infos())
        .unwrap_or_default();
    json!({ "clients_list": clients })
}

async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender also means stop.
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

async fn accept_loop(listener: TcpListener, state: Arc<ServerState>) {
    let mut shutdown = state.shutdown.subscribe();
    let mut connections = JoinSet::new();

    loop {
        select! {
            _ = stop_requested(&mut shutdown) => break,
            accept_result = listener.accept() => {
                handle_accept_result(accept_result, &state, &mut connections);
            }
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                reap_connection(finished);
            }
        }
    }

    drop(listener);
    while let Some(finished) = connections.join_next().await {
        reap_connection(finished);
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<ServerState>,
    connections: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => {
            debug!(%peer, "accepted connection");
            connections.spawn(serve_connection(stream, peer, Arc::clone(state)));
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn reap_connection(finished: std::result::Result<(), JoinError>) {
    if let Err(err) = finished {
        warn!(error = ?err, "connection task panicked or was cancelled");
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, state: Arc<ServerState>) {
    match handle_connection(stream, peer, &state).await {
        Ok(()) => {}
        Err(ProtocolError::RegistrationRejected) => {
            info!(%peer, "registration rejected, connection closed")
        }
        Err(err) => warn!(%peer, error = ?err, "connection closed with error"),
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: &Arc<ServerState>,
) -> Result<()> {
    let mut shutdown = state.shutdown.subscribe();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let handshake = select! {
        _ = stop_requested(&mut shutdown) => return Ok(()),
        handshake = perform_handshake(&mut lines) => handshake?,
    };
    let Some(nickname) = handshake else {
        debug!(%peer, "connection closed before handshake");
        return Ok(());
    };

    if !state.registration_open() {
        let rejection = Push::new(REGISTRATION, Value::from(REGISTRATION_CLOSED)).encode()?;
        write_line_until(
            &mut writer,
            &rejection,
            stop_requested(&mut shutdown),
            SHUTDOWN_GRACE,
        )
        .await?;
        return Err(ProtocolError::RegistrationRejected);
    }

    let id = state.allocate_id();
    let (outbox_tx, mut outbox) = mpsc::channel(OUTBOX_CAPACITY);
    // Joining first makes the client a broadcast target before it learns its
    // id; the reply below still hits the socket ahead of anything queued.
    state
        .registry
        .insert(id, Connection::new(id, nickname.clone(), outbox_tx));
    let _membership = Membership {
        registry: &state.registry,
        id,
    };
    info!(%peer, %id, nickname, "client registered");

    let reply = Push::new(REGISTRATION, json!({ "id": id })).encode()?;
    let stopped =
        write_line_until(&mut writer, &reply, stop_requested(&mut shutdown), SHUTDOWN_GRACE)
            .await?;
    let result = if stopped {
        flush_outbox(&mut outbox, &mut writer).await;
        Ok(())
    } else {
        run_session(state, &mut lines, &mut writer, &mut outbox, &mut shutdown).await
    };

    info!(%peer, %id, nickname, "client disconnected");
    result
}

/// Keeps a connection registered for as long as it is alive. Dropping it
/// deregisters, also when a responder panics and unwinds the task.
struct Membership<'a> {
    registry: &'a ConnectionRegistry,
    id: ConnectionId,
}

impl Drop for Membership<'_> {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

async fn perform_handshake<R>(lines: &mut Lines<R>) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let Some(request) = read_envelope::<_, String>(lines).await? else {
        return Ok(None);
    };
    if request.key != REGISTRATION {
        return Err(ProtocolError::UnexpectedHandshake { key: request.key });
    }
    Ok(Some(request.body))
}

async fn run_session<R, W>(
    state: &ServerState,
    lines: &mut Lines<R>,
    writer: &mut W,
    outbox: &mut mpsc::Receiver<String>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let line = select! {
            _ = stop_requested(shutdown) => break,
            request = read_envelope::<_, String>(lines) => {
                let Some(request) = request? else {
                    return Ok(());
                };
                state.respond(request)?
            }
            Some(line) = outbox.recv() => line,
        };
        if write_line_until(writer, &line, stop_requested(shutdown), SHUTDOWN_GRACE).await? {
            break;
        }
    }

    flush_outbox(outbox, writer).await;
    Ok(())
}

/// Writes whatever is still queued, for at most [`SHUTDOWN_GRACE`].
async fn flush_outbox<W>(outbox: &mut mpsc::Receiver<String>, writer: &mut W)
where
    W: AsyncWrite + Unpin,
{
    let flush = async {
        while let Ok(line) = outbox.try_recv() {
            write_line(writer, &line).await?;
        }
        Ok::<_, ProtocolError>(())
    };
    match timeout(SHUTDOWN_GRACE, flush).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(error = ?err, "failed to flush queued message"),
        Err(_) => debug!("peer not reading, queued messages dropped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn idle_server() -> Server {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        Server::new(listener).expect("server")
    }

    #[tokio::test]
    async fn builtins_are_installed() {
        let server = idle_server().await;
        assert!(server.shared.events.contains(CLIENTS_LIST_CHANGED));
        assert!(server.shared.events.contains(SERVER_SHUTDOWN));
        assert!(server.shared.responses.contains(GET_CLIENTS_LIST));
    }

    #[tokio::test]
    async fn unknown_event_sends_nothing() {
        let server = idle_server().await;
        let err = server.send_event("missing").expect_err("no generator");
        assert!(matches!(err, ProtocolError::UnknownKey(key) if key == "missing"));
    }

    #[tokio::test]
    async fn registry_mutations_broadcast_the_new_membership() {
        let server = idle_server().await;
        let (tx_a, mut rx_a) = mpsc::channel(OUTBOX_CAPACITY);
        let (tx_b, mut rx_b) = mpsc::channel(OUTBOX_CAPACITY);

        server.shared.registry.insert(
            ConnectionId(1),
            Connection::new(ConnectionId(1), "A".into(), tx_a),
        );
        server.shared.registry.insert(
            ConnectionId(2),
            Connection::new(ConnectionId(2), "B".into(), tx_b),
        );
        server.shared.registry.remove(ConnectionId(1));

        let a_seen: Vec<Push> = std::iter::from_fn(|| rx_a.try_recv().ok())
            .map(|line| Push::decode(&line).expect("decode"))
            .collect();
        assert_eq!(a_seen.len(), 2, "A saw its own join and B's join");

        let b_seen: Vec<Push> = std::iter::from_fn(|| rx_b.try_recv().ok())
            .map(|line| Push::decode(&line).expect("decode"))
            .collect();
        assert_eq!(b_seen.len(), 2);
        assert!(b_seen.iter().all(|push| push.key == CLIENTS_LIST_CHANGED));
        assert_eq!(
            b_seen[1].body,
            json!({ "clients_list": [{ "id": "2", "nickname": "B" }] })
        );
    }

    #[tokio::test]
    async fn one_dead_outbox_does_not_stop_the_broadcast() {
        let server = idle_server().await;
        let (dead_tx, dead_rx) = mpsc::channel(OUTBOX_CAPACITY);
        drop(dead_rx);
        let (live_tx, mut live_rx) = mpsc::channel(OUTBOX_CAPACITY);

        // The dead connection comes first in registry order.
        server.shared.registry.insert(
            ConnectionId(1),
            Connection::new(ConnectionId(1), "gone".into(), dead_tx),
        );
        server.shared.registry.insert(
            ConnectionId(2),
            Connection::new(ConnectionId(2), "here".into(), live_tx),
        );
        server.add_event("tick", || json!("tock"));

        assert_eq!(server.send_event("tick").expect("broadcast"), 1);

        let ticks: Vec<Push> = std::iter::from_fn(|| live_rx.try_recv().ok())
            .map(|line| Push::decode(&line).expect("decode"))
            .filter(|push| push.key == "tick")
            .collect();
        assert_eq!(ticks, vec![Push::new("tick", json!("tock"))]);
    }

    #[tokio::test]
    async fn full_outbox_is_skipped_without_blocking() {
        let server = idle_server().await;
        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        let (live_tx, mut live_rx) = mpsc::channel(OUTBOX_CAPACITY);
        server.shared.registry.insert(
            ConnectionId(1),
            Connection::new(ConnectionId(1), "slow".into(), slow_tx),
        );
        server.shared.registry.insert(
            ConnectionId(2),
            Connection::new(ConnectionId(2), "live".into(), live_tx),
        );
        server.add_event("tick", || json!("tock"));

        // The slow outbox is already holding its own join announcement.
        assert_eq!(server.send_event("tick").expect("broadcast"), 1);
        assert_eq!(
            Push::decode(&slow_rx.try_recv().expect("join")).expect("decode").key,
            CLIENTS_LIST_CHANGED
        );
        assert!(slow_rx.try_recv().is_err());

        let last = std::iter::from_fn(|| live_rx.try_recv().ok()).last();
        let last = Push::decode(&last.expect("queued")).expect("decode");
        assert_eq!(last, Push::new("tick", json!("tock")));
    }

    #[tokio::test]
    async fn membership_guard_deregisters_on_unwind() {
        let server = idle_server().await;
        let (tx, _rx) = mpsc::channel(OUTBOX_CAPACITY);
        server.shared.registry.insert(
            ConnectionId(5),
            Connection::new(ConnectionId(5), "doomed".into(), tx),
        );

        let registry = &server.shared.registry;
        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _membership = Membership {
                registry,
                id: ConnectionId(5),
            };
            panic!("responder failed");
        }));
        assert!(unwound.is_err());
        assert_eq!(server.client_count(), 0);
    }

    #[tokio::test]
    async fn responses_echo_the_request_key() {
        let server = idle_server().await;
        server.add_response("shout", |body: &str| Value::from(body.to_uppercase()));

        let line = server
            .shared
            .respond(Request::new("shout", "hey".to_string()))
            .expect("respond");
        assert_eq!(Push::decode(&line).expect("decode"), Push::new("shout", json!("HEY")));

        server.remove_response("shout");
        let err = server
            .shared
            .respond(Request::new("shout", String::new()))
            .expect_err("removed");
        assert!(matches!(err, ProtocolError::UnknownKey(_)));
    }

    #[tokio::test]
    async fn shutdown_before_run_is_clean_and_final() {
        let server = idle_server().await;
        server.shutdown().await;
        server.shutdown().await;
        assert!(!server.is_running());
        assert!(matches!(server.run(), Err(ProtocolError::AlreadyStarted)));
    }
}
