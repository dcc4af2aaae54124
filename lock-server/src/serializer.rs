//! The serializer: one task that owns the lock table and the counters.
//!
//! Every connection adapter pushes [`Envelope`]s into a shared bounded
//! queue. The core drains it one envelope at a time, so each request is
//! applied atomically and no lock is needed around the table. Replies go
//! back through the [`Replier`] capability registered when the connection
//! opened; the core never sees the socket.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, trace};

use crate::{
    error::{CoreStopped, RequestError},
    lock_table::LockTable,
    message::{Operation, Reply, Request},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the core hands to a connection's outbound side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Reply(Reply),
    /// Acknowledges CLOSE. Nothing follows it for this connection.
    Closed,
}

/// The only thing the core may do with a connection: give it something to
/// send. Implementations must not block.
pub trait Replier: Send {
    fn deliver(&self, message: Outbound);
}

pub enum Command {
    /// First message of every connection, carrying its reply capability.
    Open(Box<dyn Replier>),
    Close,
    Request(Request),
    /// The connection sent something the codec could not decode.
    Malformed,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Open(_) => f.write_str("Open"),
            Command::Close => f.write_str("Close"),
            Command::Request(request) => f.debug_tuple("Request").field(request).finish(),
            Command::Malformed => f.write_str("Malformed"),
        }
    }
}

#[derive(Debug)]
pub struct Envelope {
    pub from: ConnectionId,
    pub command: Command,
}

/// Producer side of the serializer queue, cloned into every connection.
#[derive(Clone)]
pub struct CoreHandle {
    inbound: mpsc::Sender<Envelope>,
    processed: Arc<AtomicU64>,
}

impl CoreHandle {
    /// Queues `command` behind everything already sent by any connection.
    /// Waits while the queue is full.
    pub async fn enqueue(&self, from: ConnectionId, command: Command) -> Result<(), CoreStopped> {
        self.inbound
            .send(Envelope { from, command })
            .await
            .map_err(|_| CoreStopped)
    }

    /// Number of envelopes the core has finished processing.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> Stats {
        Stats(Arc::clone(&self.processed))
    }
}

/// Read-only view of the core's processed counter for monitoring.
#[derive(Debug, Clone)]
pub struct Stats(Arc<AtomicU64>);

impl Stats {
    pub fn processed(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Spawns the core on the current runtime with an inbound queue of
/// `capacity` envelopes.
pub fn start(capacity: usize) -> (CoreHandle, JoinHandle<()>) {
    let (inbound, queue) = mpsc::channel(capacity);
    let core = Core::new();
    let handle = CoreHandle {
        inbound,
        processed: Arc::clone(&core.processed),
    };
    let task = tokio::spawn(core.run(queue));
    (handle, task)
}

#[derive(Default)]
pub struct Core {
    table: LockTable<ConnectionId>,
    counters: HashMap<String, i64>,
    repliers: HashMap<ConnectionId, Box<dyn Replier>>,
    processed: Arc<AtomicU64>,
}

impl Core {
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes envelopes until every [`CoreHandle`] is dropped.
    pub async fn run(mut self, mut queue: mpsc::Receiver<Envelope>) {
        while let Some(envelope) = queue.recv().await {
            self.handle(envelope);
        }
        debug!("lock core queue closed");
    }

    pub fn handle(&mut self, envelope: Envelope) {
        let Envelope { from, command } = envelope;
        match command {
            Command::Open(replier) => self.open(from, replier),
            Command::Close => self.close(from),
            Command::Request(request) => self.request(from, request),
            Command::Malformed => self.reply(from, Reply::failure(RequestError::Malformed)),
        }
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn table(&self) -> &LockTable<ConnectionId> {
        &self.table
    }

    pub fn counter(&self, name: &str) -> Option<i64> {
        self.counters.get(name).copied()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    fn open(&mut self, from: ConnectionId, replier: Box<dyn Replier>) {
        debug!(conn = %from, "connection opened");
        self.table.add_client(from);
        self.repliers.insert(from, replier);
    }

    fn close(&mut self, from: ConnectionId) {
        let promoted = self.table.remove_client(from);
        debug!(conn = %from, promoted = promoted.len(), "connection closed");

        // Dropping the replier closes the reply queue behind the ack.
        if let Some(replier) = self.repliers.remove(&from) {
            replier.deliver(Outbound::Closed);
        }
        for next in promoted {
            self.reply(next, Reply::ok());
        }
    }

    fn request(&mut self, from: ConnectionId, request: Request) {
        trace!(conn = %from, op = %request.op, target = %request.target, "request");
        let Some(op) = Operation::parse(&request.op) else {
            self.reply(from, Reply::failure(RequestError::UnknownOperation));
            return;
        };

        match op {
            Operation::Lock => {
                if self.table.acquire(from, &request.target) {
                    self.reply(from, Reply::ok());
                }
            }
            Operation::Unlock => match self.table.release(from, &request.target) {
                Ok(released) => {
                    self.reply(from, Reply::ok());
                    if let Some(next) = released.promoted() {
                        self.reply(next, Reply::ok());
                    }
                }
                Err(_) => self.reply(from, Reply::failure(RequestError::NoSuchLock)),
            },
            Operation::Get => {
                let value = self.counter(&request.target).unwrap_or_default();
                self.reply(from, Reply::value(value));
            }
            Operation::Set => {
                let reply = match parse_number(request.arg.as_deref()) {
                    Ok(value) => {
                        self.counters.insert(request.target, value);
                        Reply::ok()
                    }
                    Err(err) => Reply::failure(err),
                };
                self.reply(from, reply);
            }
            Operation::Incr => {
                let reply = match self.increment(request.target, request.arg.as_deref()) {
                    Ok(value) => Reply::value(value),
                    Err(err) => Reply::failure(err),
                };
                self.reply(from, reply);
            }
        }
    }

    fn increment(&mut self, name: String, arg: Option<&str>) -> Result<i64, RequestError> {
        let delta = parse_number(arg)?;
        let counter = self.counters.entry(name).or_default();
        *counter = counter.checked_add(delta).ok_or(RequestError::Overflow)?;
        Ok(*counter)
    }

    fn reply(&self, to: ConnectionId, reply: Reply) {
        match self.repliers.get(&to) {
            Some(replier) => replier.deliver(Outbound::Reply(reply)),
            None => debug!(conn = %to, "dropping reply for unregistered connection"),
        }
    }
}

fn parse_number(arg: Option<&str>) -> Result<i64, RequestError> {
    arg.unwrap_or_default()
        .parse()
        .map_err(|_| RequestError::InvalidNumber)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::message::Status;

    type Log = Arc<Mutex<Vec<(ConnectionId, Outbound)>>>;

    struct Recorder {
        id: ConnectionId,
        log: Log,
    }

    impl Replier for Recorder {
        fn deliver(&self, message: Outbound) {
            self.log.lock().unwrap().push((self.id, message));
        }
    }

    struct Harness {
        core: Core,
        log: Log,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                core: Core::new(),
                log: Log::default(),
            }
        }

        fn open(&mut self, id: u64) -> ConnectionId {
            let id = ConnectionId(id);
            let replier = Recorder {
                id,
                log: Arc::clone(&self.log),
            };
            self.send(id, Command::Open(Box::new(replier)));
            id
        }

        fn send(&mut self, from: ConnectionId, command: Command) {
            self.core.handle(Envelope { from, command });
        }

        fn request(&mut self, from: ConnectionId, request: Request) {
            self.send(from, Command::Request(request));
        }

        fn drain(&self) -> Vec<(ConnectionId, Outbound)> {
            std::mem::take(&mut *self.log.lock().unwrap())
        }
    }

    fn ok(id: ConnectionId) -> (ConnectionId, Outbound) {
        (id, Outbound::Reply(Reply::ok()))
    }

    #[test]
    fn queued_lock_is_answered_on_unlock() {
        let mut h = Harness::new();
        let a = h.open(1);
        let b = h.open(2);

        h.request(a, Request::lock("x"));
        assert_eq!(h.drain(), vec![ok(a)]);

        h.request(b, Request::lock("x"));
        assert!(h.drain().is_empty());

        h.request(a, Request::unlock("x"));
        assert_eq!(h.drain(), vec![ok(a), ok(b)]);
        assert_eq!(h.core.table().holder("x"), Some(b));
    }

    #[test]
    fn close_releases_locks_and_acknowledges() {
        let mut h = Harness::new();
        let a = h.open(1);
        let b = h.open(2);
        h.request(a, Request::lock("x"));
        h.request(b, Request::lock("x"));
        h.drain();

        h.send(a, Command::Close);
        assert_eq!(h.drain(), vec![(a, Outbound::Closed), ok(b)]);
        assert!(!h.core.table().is_registered(a));

        // The replier is gone, later traffic for `a` is dropped.
        h.request(b, Request::unlock("x"));
        assert_eq!(h.drain(), vec![ok(b)]);
        assert_eq!(h.core.table().key_count(), 0);
    }

    #[test]
    fn lone_holder_disconnect_deletes_key() {
        let mut h = Harness::new();
        let a = h.open(1);
        h.request(a, Request::lock("x"));
        h.send(a, Command::Close);
        assert_eq!(h.core.table().key_count(), 0);
    }

    #[test]
    fn departed_waiter_is_not_promoted() {
        let mut h = Harness::new();
        let a = h.open(1);
        let b = h.open(2);
        h.request(a, Request::lock("x"));
        h.request(b, Request::lock("x"));
        h.send(b, Command::Close);
        h.drain();

        h.request(a, Request::unlock("x"));
        assert_eq!(h.drain(), vec![ok(a)]);
    }

    #[test]
    fn unlock_without_holding_is_a_user_error() {
        let mut h = Harness::new();
        let a = h.open(1);
        h.request(a, Request::unlock("x"));

        let replies = h.drain();
        let [(to, Outbound::Reply(reply))] = replies.as_slice() else {
            panic!("unexpected replies: {replies:?}");
        };
        assert_eq!(*to, a);
        assert_eq!(reply.status, Status::Ko);
        assert_eq!(reply.error.as_deref(), Some("no such lock held"));
    }

    #[test]
    fn counters_set_increment_and_reject_garbage() {
        let mut h = Harness::new();
        let a = h.open(1);

        h.request(a, Request::new(Operation::Set, "ctr").with_arg("5"));
        h.request(a, Request::new(Operation::Incr, "ctr").with_arg("3"));
        h.request(a, Request::new(Operation::Incr, "ctr").with_arg("abc"));
        h.request(a, Request::new(Operation::Get, "ctr"));

        let replies: Vec<_> = h.drain().into_iter().map(|(_, message)| message).collect();
        assert_eq!(
            replies,
            vec![
                Outbound::Reply(Reply::ok()),
                Outbound::Reply(Reply::value(8)),
                Outbound::Reply(Reply::failure(RequestError::InvalidNumber)),
                Outbound::Reply(Reply::value(8)),
            ]
        );
        assert_eq!(h.core.counter("ctr"), Some(8));
    }

    #[test]
    fn missing_counter_reads_as_zero() {
        let mut h = Harness::new();
        let a = h.open(1);
        h.request(a, Request::new(Operation::Get, "nothing"));
        assert_eq!(h.drain(), vec![(a, Outbound::Reply(Reply::value(0)))]);
    }

    #[test]
    fn increment_overflow_leaves_counter_untouched() {
        let mut h = Harness::new();
        let a = h.open(1);
        h.request(a, Request::new(Operation::Set, "ctr").with_arg(i64::MAX.to_string()));
        h.request(a, Request::new(Operation::Incr, "ctr").with_arg("1"));

        let replies = h.drain();
        assert_eq!(
            replies.last(),
            Some(&(a, Outbound::Reply(Reply::failure(RequestError::Overflow))))
        );
        assert_eq!(h.core.counter("ctr"), Some(i64::MAX));
    }

    #[test]
    fn set_without_argument_is_invalid() {
        let mut h = Harness::new();
        let a = h.open(1);
        h.request(a, Request::new(Operation::Set, "ctr"));
        assert_eq!(
            h.drain(),
            vec![(a, Outbound::Reply(Reply::failure(RequestError::InvalidNumber)))]
        );
        assert_eq!(h.core.counter("ctr"), None);
    }

    #[test]
    fn unknown_and_malformed_requests_are_rejected() {
        let mut h = Harness::new();
        let a = h.open(1);
        h.request(
            a,
            Request {
                op: "frobnicate".into(),
                target: "x".into(),
                arg: None,
            },
        );
        h.send(a, Command::Malformed);

        assert_eq!(
            h.drain(),
            vec![
                (a, Outbound::Reply(Reply::failure(RequestError::UnknownOperation))),
                (a, Outbound::Reply(Reply::failure(RequestError::Malformed))),
            ]
        );
        assert_eq!(h.core.table().key_count(), 0);
    }

    #[test]
    fn reentrant_lock_keeps_single_slot() {
        let mut h = Harness::new();
        let a = h.open(1);
        h.request(a, Request::lock("x"));
        h.request(a, Request::lock("x"));
        assert_eq!(h.drain(), vec![ok(a), ok(a)]);
        assert_eq!(h.core.table().queue_len("x"), 1);
    }

    #[test]
    fn every_envelope_is_counted() {
        let mut h = Harness::new();
        let a = h.open(1);
        h.request(a, Request::lock("x"));
        h.send(a, Command::Close);
        assert_eq!(h.core.processed(), 3);
    }

    #[tokio::test]
    async fn spawned_core_serves_handles() {
        let (handle, task) = start(8);
        let (tx, mut rx) = mpsc::unbounded_channel();

        struct Forward(mpsc::UnboundedSender<Outbound>);
        impl Replier for Forward {
            fn deliver(&self, message: Outbound) {
                let _ = self.0.send(message);
            }
        }

        let id = ConnectionId(1);
        handle
            .enqueue(id, Command::Open(Box::new(Forward(tx))))
            .await
            .expect("open");
        handle
            .enqueue(id, Command::Request(Request::lock("x")))
            .await
            .expect("lock");
        handle.enqueue(id, Command::Close).await.expect("close");

        assert_eq!(rx.recv().await, Some(Outbound::Reply(Reply::ok())));
        assert_eq!(rx.recv().await, Some(Outbound::Closed));
        // The core dropped the replier after the ack.
        assert_eq!(rx.recv().await, None);

        drop(handle);
        task.await.expect("core exits once all handles are gone");
    }
}
