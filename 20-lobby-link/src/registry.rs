use std::{
    fmt,
    num::ParseIntError,
    str::FromStr,
    sync::{Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Lines a connection may have queued before further broadcasts skip it.
pub const OUTBOX_CAPACITY: usize = 256;

/// Server-assigned connection id, handed out in increasing order. Travels as
/// a decimal string (`"id": "3"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ConnectionId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

impl From<ConnectionId> for String {
    fn from(id: ConnectionId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for ConnectionId {
    type Error = ParseIntError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Public view of a registered connection, as listed in `clients_list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: ConnectionId,
    pub nickname: String,
}

/// A registered connection. The socket itself is owned by the connection's
/// task; the registry only keeps the outbox feeding it.
#[derive(Debug, Clone)]
pub struct Connection {
    info: ClientInfo,
    outbox: mpsc::Sender<String>,
}

impl Connection {
    pub fn new(id: ConnectionId, nickname: String, outbox: mpsc::Sender<String>) -> Self {
        Self {
            info: ClientInfo { id, nickname },
            outbox,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.info.id
    }

    pub fn nickname(&self) -> &str {
        &self.info.nickname
    }

    pub fn info(&self) -> &ClientInfo {
        &self.info
    }

    /// Queues an encoded line for the connection's task without waiting.
    /// Fails once the task has gone away or when the outbox is full because
    /// the peer stopped reading.
    pub fn send_line(&self, line: String) -> Result<(), mpsc::error::TrySendError<String>> {
        self.outbox.try_send(line)
    }
}

/// Emitted by every successful registry mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Joined(ClientInfo),
    Left(ClientInfo),
}

type ChangeListener = Box<dyn Fn(&MembershipChange) + Send + Sync>;

/// Insertion-ordered set of registered connections.
///
/// `insert` and `remove` call the change listener after the mutation and
/// before returning. The listener runs with the lock released, so it may
/// read `values()`.
pub struct ConnectionRegistry {
    entries: Mutex<Vec<Connection>>,
    listener: ChangeListener,
}

impl ConnectionRegistry {
    pub fn new<L>(listener: L) -> Self
    where
        L: Fn(&MembershipChange) + Send + Sync + 'static,
    {
        Self {
            entries: Mutex::new(Vec::new()),
            listener: Box::new(listener),
        }
    }

    /// Adds `connection` under `id`. Re-inserting an id replaces the entry in
    /// place and keeps its position.
    pub fn insert(&self, id: ConnectionId, connection: Connection) {
        let info = connection.info().clone();
        {
            let mut entries = self.lock();
            match entries.iter_mut().find(|existing| existing.id() == id) {
                Some(existing) => *existing = connection,
                None => entries.push(connection),
            }
        }
        (self.listener)(&MembershipChange::Joined(info));
    }

    /// Removes the connection with `id`. Removing an absent id changes
    /// nothing and notifies nobody.
    pub fn remove(&self, id: ConnectionId) -> Option<Connection> {
        let removed = {
            let mut entries = self.lock();
            let position = entries.iter().position(|existing| existing.id() == id)?;
            entries.remove(position)
        };
        (self.listener)(&MembershipChange::Left(removed.info().clone()));
        Some(removed)
    }

    /// Snapshot of the current members in insertion order.
    pub fn values(&self) -> Vec<Connection> {
        self.lock().clone()
    }

    pub fn infos(&self) -> Vec<ClientInfo> {
        self.lock()
            .iter()
            .map(|connection| connection.info().clone())
            .collect()
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Connection>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("members", &self.infos())
            .finish()
    }
}
