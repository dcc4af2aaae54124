use std::{
    future::Future,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{info, warn};

use crate::{
    config::ServerConfig,
    connection::{self, ReplyLimits},
    serializer::{self, ConnectionId, CoreHandle, Stats},
};

/// Accepts clients and wires each one to the shared lock core.
pub struct Server {
    listener: TcpListener,
    core: CoreHandle,
    core_task: JoinHandle<()>,
    reply_limits: ReplyLimits,
    stats_interval: Option<Duration>,
    next_id: AtomicU64,
}

impl Server {
    /// Binds the listening socket and starts the core task.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        Ok(Self::with_listener(listener, &config))
    }

    /// Uses an already bound listener; handy for tests that bind port 0.
    pub fn with_listener(listener: TcpListener, config: &ServerConfig) -> Self {
        let (core, core_task) = serializer::start(config.inbound_capacity);
        Self {
            listener,
            core,
            core_task,
            reply_limits: config.reply_limits(),
            stats_interval: config.stats_interval,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Read-only access to the core's processed-request counter.
    pub fn stats(&self) -> Stats {
        self.core.stats()
    }

    /// Accepts connections until `shutdown` resolves.
    ///
    /// Connections accepted before shutdown keep being served. An error is
    /// returned only if the core task dies, which means the lock table can
    /// no longer be trusted.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            core,
            mut core_task,
            reply_limits,
            stats_interval,
            next_id,
        } = self;
        tokio::pin!(shutdown);

        let reporter = stats_interval.map(|interval| spawn_stats_reporter(core.stats(), interval));

        let result = loop {
            select! {
                _ = &mut shutdown => {
                    info!("lock server no longer accepting connections");
                    break Ok(());
                }
                outcome = &mut core_task => {
                    break match outcome {
                        Ok(()) => Err(anyhow!("lock core exited unexpectedly")),
                        Err(err) => Err(anyhow::Error::new(err).context("lock core crashed")),
                    };
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &core, &next_id, reply_limits);
                }
            }
        };

        if let Some(reporter) = reporter {
            reporter.abort();
        }
        result
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    core: &CoreHandle,
    next_id: &AtomicU64,
    reply_limits: ReplyLimits,
) {
    match result {
        Ok((stream, peer)) => {
            let id = ConnectionId(next_id.fetch_add(1, Ordering::Relaxed));
            if let Err(err) = stream.set_nodelay(true) {
                warn!(conn = %id, error = ?err, "failed to disable nagle");
            }
            info!(conn = %id, %peer, "client connected");
            connection::spawn(stream, id, core.clone(), reply_limits);
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_stats_reporter(stats: Stats, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut last_count = stats.processed();
        let mut last_tick = Instant::now();
        loop {
            ticker.tick().await;
            let count = stats.processed();
            let elapsed = last_tick.elapsed().as_secs_f64();
            let delta = count - last_count;
            let rate = if elapsed > 0.0 { delta as f64 / elapsed } else { 0.0 };
            info!(requests = count, delta, per_sec = rate.round(), "throughput");
            last_count = count;
            last_tick = Instant::now();
        }
    })
}
