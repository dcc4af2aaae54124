//! Bookkeeping of who holds what, and who waits for what.
//!
//! The table keeps two views of the same relation:
//!
//! - `locks`: key → FIFO queue of connections. The front of the queue is the
//!   holder, everybody behind it is waiting in arrival order.
//! - `clients`: connection → (key → [`Interest`]) so a disconnecting client
//!   can be removed from every queue it appears in without scanning the
//!   whole table.
//!
//! The table has no internal synchronisation. It is owned by the serializer
//! task, which is the only code allowed to mutate it.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::Hash;

/// What a connection currently has at stake for a given key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// The connection is at the front of the queue and owns the key.
    Holding,
    /// The connection is queued behind the holder.
    Waiting,
}

/// Result of a successful [`LockTable::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released<C> {
    /// Nobody was waiting; the key has been dropped from the table.
    Vacated,
    /// The next waiter now holds the key and must be told so.
    Promoted(C),
}

impl<C> Released<C> {
    pub fn promoted(self) -> Option<C> {
        match self {
            Released::Vacated => None,
            Released::Promoted(next) => Some(next),
        }
    }
}

/// Returned by [`LockTable::release`] when the caller does not hold the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotHeld;

#[derive(Debug)]
pub struct LockTable<C> {
    locks: HashMap<String, VecDeque<C>>,
    clients: HashMap<C, BTreeMap<String, Interest>>,
}

impl<C> Default for LockTable<C> {
    fn default() -> Self {
        Self {
            locks: HashMap::new(),
            clients: HashMap::new(),
        }
    }
}

impl<C> LockTable<C>
where
    C: Copy + Eq + Hash + std::fmt::Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection with an empty interest set.
    ///
    /// Registering the same connection twice keeps its existing interests.
    pub fn add_client(&mut self, client: C) {
        self.clients.entry(client).or_default();
    }

    /// Asks for `key` on behalf of `client`.
    ///
    /// Returns `true` when the client holds the key after the call, either
    /// because the key was free or because the client already held it.
    /// Returns `false` when the client was queued; the caller must stay
    /// silent until the client is promoted.
    pub fn acquire(&mut self, client: C, key: &str) -> bool {
        let interests = self.clients.entry(client).or_default();

        match self.locks.get_mut(key) {
            None => {
                self.locks.insert(key.to_string(), VecDeque::from([client]));
                interests.insert(key.to_string(), Interest::Holding);
                true
            }
            Some(queue) if queue.front() == Some(&client) => true,
            Some(queue) => {
                // A waiter asking again keeps its original place in line.
                if interests.get(key).is_none() {
                    queue.push_back(client);
                    interests.insert(key.to_string(), Interest::Waiting);
                }
                false
            }
        }
    }

    /// Gives `key` up on behalf of `client`.
    ///
    /// Fails without touching the table if the key is unknown or `client`
    /// is not its holder.
    ///
    /// # Panics
    ///
    /// Panics if the interest map says `client` holds the key but the queue
    /// disagrees. That state can only be reached through a bug in the table
    /// itself and nothing built on top of it can be trusted afterwards.
    pub fn release(&mut self, client: C, key: &str) -> Result<Released<C>, NotHeld> {
        if !self.locks.contains_key(key) {
            return Err(NotHeld);
        }
        let holding = self
            .clients
            .get(&client)
            .and_then(|interests| interests.get(key))
            .is_some_and(|interest| *interest == Interest::Holding);
        if !holding {
            return Err(NotHeld);
        }

        if let Some(interests) = self.clients.get_mut(&client) {
            interests.remove(key);
        }
        Ok(self.pop_holder(client, key))
    }

    /// Forgets everything about `client`, releasing what it holds and
    /// withdrawing it from every queue it waits in.
    ///
    /// Returns the connections that were granted a key as a consequence,
    /// in key order.
    pub fn remove_client(&mut self, client: C) -> Vec<C> {
        let Some(interests) = self.clients.remove(&client) else {
            return Vec::new();
        };

        let mut promoted = Vec::new();
        for (key, interest) in interests {
            match interest {
                Interest::Holding => {
                    if let Released::Promoted(next) = self.pop_holder(client, &key) {
                        promoted.push(next);
                    }
                }
                Interest::Waiting => self.withdraw(client, &key),
            }
        }
        promoted
    }

    /// Removes the front of `key`'s queue, which must be `client`, and hands
    /// the key to the next waiter if there is one.
    fn pop_holder(&mut self, client: C, key: &str) -> Released<C> {
        let Some(queue) = self.locks.get_mut(key) else {
            panic!("lock table corrupted: {client:?} holds {key:?} but the key has no queue");
        };
        match queue.pop_front() {
            Some(front) if front == client => {}
            other => panic!(
                "lock table corrupted: {client:?} holds {key:?} but the queue front is {other:?}"
            ),
        }

        match queue.front().copied() {
            None => {
                self.locks.remove(key);
                Released::Vacated
            }
            Some(next) => {
                self.clients
                    .entry(next)
                    .or_default()
                    .insert(key.to_string(), Interest::Holding);
                Released::Promoted(next)
            }
        }
    }

    fn withdraw(&mut self, client: C, key: &str) {
        let Some(queue) = self.locks.get_mut(key) else {
            return;
        };
        queue.retain(|waiter| *waiter != client);
        if queue.is_empty() {
            self.locks.remove(key);
        }
    }

    /// Current holder of `key`, if anyone holds it.
    pub fn holder(&self, key: &str) -> Option<C> {
        self.locks.get(key).and_then(|queue| queue.front().copied())
    }

    /// Connections queued behind the holder of `key`, in grant order.
    pub fn waiters(&self, key: &str) -> Vec<C> {
        self.locks
            .get(key)
            .map(|queue| queue.iter().skip(1).copied().collect())
            .unwrap_or_default()
    }

    /// Holder plus waiters for `key`; zero when the key is not in the table.
    pub fn queue_len(&self, key: &str) -> usize {
        self.locks.get(key).map_or(0, VecDeque::len)
    }

    pub fn interest(&self, client: C, key: &str) -> Option<Interest> {
        self.clients
            .get(&client)
            .and_then(|interests| interests.get(key))
            .copied()
    }

    pub fn is_registered(&self, client: C) -> bool {
        self.clients.contains_key(&client)
    }

    /// Number of keys that are currently held.
    pub fn key_count(&self) -> usize {
        self.locks.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Verifies that both views of the table agree with each other.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        for (key, queue) in &self.locks {
            assert!(!queue.is_empty(), "key {key:?} has an empty queue");
            for (position, client) in queue.iter().enumerate() {
                let expected = if position == 0 {
                    Interest::Holding
                } else {
                    Interest::Waiting
                };
                assert_eq!(
                    self.interest(*client, key),
                    Some(expected),
                    "{client:?} at position {position} of {key:?}"
                );
                assert_eq!(
                    queue.iter().filter(|other| *other == client).count(),
                    1,
                    "{client:?} queued twice for {key:?}"
                );
            }
        }
        for (client, interests) in &self.clients {
            for key in interests.keys() {
                let queue = self
                    .locks
                    .get(key)
                    .unwrap_or_else(|| panic!("{client:?} references missing key {key:?}"));
                assert!(queue.contains(client), "{client:?} missing from {key:?}");
            }
        }
    }
}
