//! Small lobby protocol: one authoritative server, a handful of peers, one
//! TCP connection per peer carrying newline-delimited JSON envelopes.
//!
//! Two disciplines share each connection:
//!
//! - client requests, answered by the server on the same connection with an
//!   envelope carrying the same key;
//! - server events, generated at send time and pushed to every registered
//!   connection.
//!
//! Modules:
//!
//! - [`envelope`] is the wire codec and the reserved keys.
//! - [`handlers`] holds the string-keyed callback tables both sides dispatch through.
//! - [`registry`] tracks registered connections and reports every membership change.
//! - [`server`] accepts connections, runs the handshake, answers and broadcasts.
//! - [`client`] connects, registers, and dispatches pushes from a background task.
//! - [`cli`] and [`console`] are the terminal front-ends used by the binary.

pub mod cli;
pub mod client;
pub mod console;
pub mod envelope;
pub mod error;
pub mod handlers;
pub mod registry;
pub mod server;

pub use client::{Client, Registration};
pub use envelope::{Envelope, Push, Request};
pub use error::{ProtocolError, Result};
pub use registry::{ClientInfo, ConnectionId};
pub use server::Server;
