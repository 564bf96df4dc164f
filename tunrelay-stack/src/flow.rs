//! Flow keys and the bounded flow table
//!
//! One [`FlowTable`] holds TCP connection records, another holds cached UDP
//! sockets. Both evict their least-recently-used entry once the configured
//! capacity is exceeded and hand it to an eviction callback, which is where
//! the owned socket gets closed.

use crate::packet::Packet;
use lru::LruCache;
use std::fmt;
use std::hash::Hash;
use std::net::SocketAddrV4;

/// Identifies one virtual connection: remote endpoint plus local source port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub destination: SocketAddrV4,
    pub source_port: u16,
}

impl FlowKey {
    pub fn new(destination: SocketAddrV4, source_port: u16) -> Self {
        Self { destination, source_port }
    }

    /// Key of a packet read from the tunnel, `None` for non-TCP/UDP traffic.
    pub fn from_packet(packet: &Packet) -> Option<Self> {
        if !packet.is_tcp() && !packet.is_udp() {
            return None;
        }
        Some(Self::new(packet.destination(), packet.source().port()))
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.destination.ip(),
            self.destination.port(),
            self.source_port
        )
    }
}

pub type EvictionCallback<K, V> = Box<dyn Fn(K, V) + Send + Sync>;

/// Bounded LRU map that reports evicted entries.
pub struct FlowTable<K: Hash + Eq, V> {
    entries: LruCache<K, V>,
    capacity: usize,
    on_evict: EvictionCallback<K, V>,
}

impl<K: Hash + Eq, V> FlowTable<K, V> {
    pub fn new<F>(capacity: usize, on_evict: F) -> Self
    where
        F: Fn(K, V) + Send + Sync + 'static,
    {
        Self {
            entries: LruCache::unbounded(),
            capacity,
            on_evict: Box::new(on_evict),
        }
    }

    /// Look up `key` and mark it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Look up `key` without touching recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.peek(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    /// Insert or replace `key` as most recently used.
    ///
    /// Returns the replaced value, if any. Replacement never counts as an
    /// eviction; overflowing the capacity evicts exactly one entry.
    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        let replaced = self.entries.put(key, value);
        while self.entries.len() > self.capacity {
            match self.entries.pop_lru() {
                Some((k, v)) => (self.on_evict)(k, v),
                None => break,
            }
        }
        replaced
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.pop(key)
    }

    /// Remove `key` only while `pred` holds for the resident value.
    ///
    /// Used to avoid tearing down a newer record that replaced the one a
    /// worker was holding.
    pub fn remove_if<P>(&mut self, key: &K, pred: P) -> Option<V>
    where
        P: FnOnce(&V) -> bool,
    {
        match self.entries.peek(key) {
            Some(v) if pred(v) => self.entries.pop(key),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Empty the table, returning entries from least to most recently used.
    /// The eviction callback is not invoked.
    pub fn drain(&mut self) -> Vec<(K, V)> {
        let mut out = Vec::with_capacity(self.entries.len());
        while let Some(entry) = self.entries.pop_lru() {
            out.push(entry);
        }
        out
    }
}

impl<K: Hash + Eq + fmt::Debug, V> fmt::Debug for FlowTable<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowTable")
            .field("len", &self.entries.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
