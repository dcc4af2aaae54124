use std::{net::SocketAddr, time::Duration};

use anyhow::{Result, ensure};

use crate::connection::ReplyLimits;

/// Port the lock service has always listened on.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:4002";

/// Queued replies at which a connection stops reading further requests.
pub const DEFAULT_REPLY_WINDOW: usize = 16;

/// Requests buffered between all connections and the core.
pub const DEFAULT_INBOUND_CAPACITY: usize = DEFAULT_REPLY_WINDOW * 128;

/// Queued replies at which a connection is disconnected.
pub const DEFAULT_REPLY_CAPACITY: usize = DEFAULT_REPLY_WINDOW * 256;

/// Smallest reply capacity a client that keeps reading can never fill: the
/// window, every request it can have waiting in the inbound queue, the one
/// the core is handling and the one blocked on a full queue.
pub fn min_reply_capacity(reply_window: usize, inbound_capacity: usize) -> usize {
    reply_window.saturating_add(inbound_capacity).saturating_add(1)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub inbound_capacity: usize,
    pub reply_window: usize,
    pub reply_capacity: usize,
    /// Log throughput on this interval; `None` keeps the server quiet.
    pub stats_interval: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 4002)),
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            reply_window: DEFAULT_REPLY_WINDOW,
            reply_capacity: DEFAULT_REPLY_CAPACITY,
            stats_interval: None,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.inbound_capacity > 0,
            "inbound queue capacity must be at least 1"
        );
        ensure!(self.reply_window > 0, "reply window must be at least 1");
        let minimum = min_reply_capacity(self.reply_window, self.inbound_capacity);
        ensure!(
            self.reply_capacity >= minimum,
            "reply queue capacity must be at least {minimum} (reply window + inbound capacity + 1)"
        );
        if let Some(interval) = self.stats_interval {
            ensure!(!interval.is_zero(), "stats interval must be positive");
        }
        Ok(())
    }

    pub fn reply_limits(&self) -> ReplyLimits {
        ReplyLimits {
            window: self.reply_window,
            capacity: self.reply_capacity,
        }
    }
}
