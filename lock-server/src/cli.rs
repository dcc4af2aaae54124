use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::{
    DEFAULT_INBOUND_CAPACITY, DEFAULT_LISTEN, DEFAULT_REPLY_CAPACITY, DEFAULT_REPLY_WINDOW,
    ServerConfig, min_reply_capacity,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the lock server.
    Serve(ServeArgs),
    /// Send commands typed on stdin to a running server.
    Client(ClientArgs),
    /// Hammer a running server with pipelined requests.
    Bench(BenchArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address to listen on. Use port 0 for an ephemeral port.
    #[arg(long, short = 's', default_value = DEFAULT_LISTEN)]
    pub listen: SocketAddr,

    /// Queued replies at which a client's further requests are left unread.
    #[arg(long, default_value_t = DEFAULT_REPLY_WINDOW)]
    pub reply_window: usize,

    /// Queued replies at which a client is disconnected. Defaults to 4096,
    /// raised when the window and inbound queue need more.
    #[arg(long)]
    pub reply_capacity: Option<usize>,

    /// Requests buffered between all clients and the lock core.
    #[arg(long, default_value_t = DEFAULT_INBOUND_CAPACITY)]
    pub inbound_capacity: usize,

    /// Log request throughput every N seconds.
    #[arg(long)]
    pub stats_interval_secs: Option<u64>,
}

impl ServeArgs {
    pub fn into_config(self) -> ServerConfig {
        ServerConfig {
            listen: self.listen,
            inbound_capacity: self.inbound_capacity,
            reply_window: self.reply_window,
            reply_capacity: self.reply_capacity.unwrap_or_else(|| {
                DEFAULT_REPLY_CAPACITY.max(min_reply_capacity(self.reply_window, self.inbound_capacity))
            }),
            stats_interval: self.stats_interval_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the server to connect to.
    #[arg(long, default_value = DEFAULT_LISTEN)]
    pub server: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct BenchArgs {
    /// Address of the server under test.
    #[arg(long, short = 't', default_value = DEFAULT_LISTEN)]
    pub target: SocketAddr,

    /// Number of concurrent connections.
    #[arg(long, short = 'c', default_value_t = 50)]
    pub connections: usize,

    /// Requests sent by each connection.
    #[arg(long, short = 'n', default_value_t = 10_000)]
    pub iterations: usize,

    /// Request pairs written before waiting for their replies.
    #[arg(long, short = 'p', default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub pipeline: u32,

    #[arg(long, value_enum, default_value_t = Workload::Lock)]
    pub workload: Workload,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workload {
    /// lock then unlock a key private to each connection.
    Lock,
    /// incr then reset one counter shared by all connections.
    Counter,
}
