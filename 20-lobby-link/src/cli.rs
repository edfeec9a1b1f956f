use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the lobby server, accepting local TCP connections.
    Server(ServerArgs),
    /// Connect to a lobby server and exchange messages from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub listen: SocketAddr,

    /// Start with registration closed.
    #[arg(long)]
    pub closed: bool,

    /// Broadcast a `ping` event every N milliseconds.
    #[arg(long)]
    pub ping_interval_ms: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Nickname sent with the registration handshake.
    #[arg(long)]
    pub nickname: String,

    /// Address of the server to connect to.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub server: SocketAddr,
}
