//! Load generator: many connections pipelining request pairs.

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncWriteExt, BufReader, BufWriter},
    net::TcpStream,
    task::JoinSet,
};
use tracing::{debug, warn};

use crate::{
    cli::{BenchArgs, Workload},
    message::{Operation, Reply, Request, read_message, write_buffered},
};

#[derive(Debug, Clone, Copy)]
pub struct BenchReport {
    pub replies: u64,
    pub failures: u64,
    pub elapsed: Duration,
}

impl BenchReport {
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.replies as f64 / secs
        } else {
            0.0
        }
    }
}

pub async fn run(args: BenchArgs) -> Result<BenchReport> {
    let started = Instant::now();
    let mut connections = JoinSet::new();
    for index in 0..args.connections {
        let args = args.clone();
        connections.spawn(async move { client_loop(&args, index).await });
    }

    let mut replies = 0;
    let mut failures = 0;
    while let Some(joined) = connections.join_next().await {
        match joined {
            Ok(Ok(count)) => replies += count,
            Ok(Err(err)) => {
                warn!(error = ?err, "bench connection failed");
                failures += 1;
            }
            Err(err) => {
                warn!(error = ?err, "bench task panicked");
                failures += 1;
            }
        }
    }

    Ok(BenchReport {
        replies,
        failures,
        elapsed: started.elapsed(),
    })
}

impl Workload {
    fn requests(self, connection: usize) -> [Request; 2] {
        match self {
            Workload::Lock => {
                let key = format!("bench-{connection}");
                [Request::lock(key.clone()), Request::unlock(key)]
            }
            Workload::Counter => [
                Request::new(Operation::Incr, "counter").with_arg("1"),
                Request::new(Operation::Set, "counter").with_arg("0"),
            ],
        }
    }
}

async fn client_loop(args: &BenchArgs, index: usize) -> Result<u64> {
    let stream = connect(args.target).await?;
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);

    let pair = args.workload.requests(index);
    let batch_limit = args.pipeline as usize * pair.len();
    let mut sent = 0;
    let mut received = 0;

    while sent < args.iterations {
        let mut batch = 0;
        while sent < args.iterations && batch < batch_limit {
            for request in &pair {
                write_buffered(&mut writer, request).await?;
            }
            sent += pair.len();
            batch += pair.len();
        }
        writer.flush().await?;

        for _ in 0..batch {
            match read_message::<_, Reply>(&mut reader).await? {
                Some(reply) => {
                    if !reply.is_ok() {
                        debug!(connection = index, ?reply, "request refused");
                    }
                    received += 1;
                }
                None => return Ok(received),
            }
        }
    }

    writer.shutdown().await?;
    Ok(received)
}

async fn connect(target: SocketAddr) -> Result<TcpStream> {
    let stream = TcpStream::connect(target)
        .await
        .with_context(|| format!("failed to connect to {target}"))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
