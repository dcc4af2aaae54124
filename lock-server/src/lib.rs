//! Pessimistic lock server: clients ask for exclusive ownership of named
//! keys over TCP, and the server grants each key to one client at a time,
//! queueing the others in arrival order.
//!
//! Requests and replies are JSON records, one per line. Each module covers
//! one piece of the pipeline:
//!
//! - [`server`] accepts TCP connections and hands them to [`connection`].
//! - [`connection`] runs the inbound (decode) and outbound (encode) tasks of
//!   one client and keeps its reply backlog bounded.
//! - [`serializer`] is the single task that owns all shared state and applies
//!   requests one at a time.
//! - [`lock_table`] tracks holders and FIFO waiters per key.
//! - [`message`] defines the wire records and the line codec.
//! - [`error`] lists the failures reported back to clients.
//! - [`config`] and [`cli`] describe how the server is configured.
//! - [`client`] and [`bench`] are the interactive client and the load
//!   generator shipped in the same binary.

pub mod bench;
pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod lock_table;
pub mod message;
pub mod serializer;
pub mod server;
