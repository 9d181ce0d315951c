//! Connection tracking.
//!
//! Flows are keyed by their 5-tuple and spread over independently locked
//! shards so polling loops on different queues rarely contend. Entries are
//! evicted by an idle sweep that runs outside the hot path.

use std::collections::HashMap;
use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::config::ConnTrackConfig;
use crate::lock;
use crate::rules::Protocol;

/// 5-tuple flow identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionKey {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    /// IPv4 protocol number
    pub protocol: u8,
}

/// Per-flow counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionValue {
    pub packets: u64,
    pub bytes: u64,
    /// Monotonic nanoseconds since the table was created
    pub last_seen_ns: u64,
    pub service_id: u32,
    pub authenticated: bool,
}

/// Result of recording a packet against the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Created,
    Updated,
    /// Table at capacity; the flow is not tracked
    Full,
}

/// Idle time after which a flow is evicted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleTimeouts {
    pub tcp: Duration,
    pub udp: Duration,
    pub other: Duration,
}

impl Default for IdleTimeouts {
    fn default() -> Self {
        Self {
            tcp: Duration::from_secs(300),
            udp: Duration::from_secs(30),
            other: Duration::from_secs(60),
        }
    }
}

impl IdleTimeouts {
    pub fn from_config(config: &ConnTrackConfig) -> Self {
        Self {
            tcp: Duration::from_secs(config.tcp_timeout_secs),
            udp: Duration::from_secs(config.udp_timeout_secs),
            other: Duration::from_secs(config.default_timeout_secs),
        }
    }

    fn for_protocol(&self, protocol: u8) -> u64 {
        let timeout = match Protocol::from_ip_number(protocol) {
            Some(Protocol::Tcp) => self.tcp,
            Some(Protocol::Udp) => self.udp,
            _ => self.other,
        };
        timeout.as_nanos() as u64
    }
}

/// Sharded flow table
pub struct ConnectionTable {
    shards: Box<[Mutex<HashMap<ConnectionKey, ConnectionValue>>]>,
    mask: usize,
    hasher: RandomState,
    len: AtomicUsize,
    max_entries: usize,
    epoch: Instant,
}

impl ConnectionTable {
    /// Create a table. `shards` is rounded up to a power of two.
    pub fn new(max_entries: usize, shards: usize) -> Self {
        let shards = shards.max(1).next_power_of_two();
        Self {
            shards: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
            mask: shards - 1,
            hasher: RandomState::new(),
            len: AtomicUsize::new(0),
            max_entries,
            epoch: Instant::now(),
        }
    }

    pub fn from_config(config: &ConnTrackConfig) -> Self {
        Self::new(config.max_connections, config.shards)
    }

    #[inline]
    fn shard(&self, key: &ConnectionKey) -> &Mutex<HashMap<ConnectionKey, ConnectionValue>> {
        let hash = self.hasher.hash_one(key) as usize;
        &self.shards[hash & self.mask]
    }

    /// Current table clock
    pub fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Record one packet of `bytes` for the flow.
    #[inline]
    pub fn upsert(&self, key: ConnectionKey, bytes: u64, service_id: u32) -> Upsert {
        self.upsert_at(key, bytes, service_id, self.now_ns())
    }

    pub fn upsert_at(&self, key: ConnectionKey, bytes: u64, service_id: u32, now_ns: u64) -> Upsert {
        let mut shard = lock(self.shard(&key));
        if let Some(value) = shard.get_mut(&key) {
            value.packets += 1;
            value.bytes += bytes;
            value.last_seen_ns = value.last_seen_ns.max(now_ns);
            return Upsert::Updated;
        }

        if self.len.fetch_add(1, Ordering::Relaxed) >= self.max_entries {
            self.len.fetch_sub(1, Ordering::Relaxed);
            return Upsert::Full;
        }
        shard.insert(
            key,
            ConnectionValue {
                packets: 1,
                bytes,
                last_seen_ns: now_ns,
                service_id,
                authenticated: false,
            },
        );
        Upsert::Created
    }

    pub fn get(&self, key: &ConnectionKey) -> Option<ConnectionValue> {
        lock(self.shard(key)).get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict flows idle longer than their protocol's timeout.
    pub fn sweep(&self, timeouts: &IdleTimeouts) -> usize {
        self.sweep_at(self.now_ns(), timeouts)
    }

    pub fn sweep_at(&self, now_ns: u64, timeouts: &IdleTimeouts) -> usize {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut shard = lock(shard);
            let before = shard.len();
            shard.retain(|key, value| {
                now_ns.saturating_sub(value.last_seen_ns) < timeouts.for_protocol(key.protocol)
            });
            removed += before - shard.len();
        }
        if removed > 0 {
            self.len.fetch_sub(removed, Ordering::Relaxed);
            debug!(removed, remaining = self.len(), "Evicted idle connections");
        }
        removed
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            let mut shard = lock(shard);
            self.len.fetch_sub(shard.len(), Ordering::Relaxed);
            shard.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000_000;

    fn key(protocol: Protocol, src_port: u16) -> ConnectionKey {
        ConnectionKey {
            src_addr: Ipv4Addr::new(192, 168, 1, 10),
            dst_addr: Ipv4Addr::new(10, 0, 0, 5),
            src_port,
            dst_port: 80,
            protocol: protocol.ip_number(),
        }
    }

    #[test]
    fn test_aggregates_same_flow() {
        let table = ConnectionTable::new(1024, 4);
        let k = key(Protocol::Tcp, 40000);

        assert_eq!(table.upsert(k, 100, 1), Upsert::Created);
        for _ in 0..9 {
            assert_eq!(table.upsert(k, 100, 1), Upsert::Updated);
        }

        assert_eq!(table.len(), 1);
        let value = table.get(&k).unwrap();
        assert_eq!(value.packets, 10);
        assert_eq!(value.bytes, 1000);
        assert_eq!(value.service_id, 1);
        assert!(!value.authenticated);
    }

    #[test]
    fn test_distinct_flows() {
        let table = ConnectionTable::new(1024, 4);
        for port in 0..50 {
            table.upsert(key(Protocol::Udp, 5000 + port), 64, 2);
        }
        assert_eq!(table.len(), 50);
    }

    #[test]
    fn test_timestamp_never_goes_back() {
        let table = ConnectionTable::new(16, 1);
        let k = key(Protocol::Tcp, 1);
        table.upsert_at(k, 1, 1, 10 * SEC);
        table.upsert_at(k, 1, 1, 5 * SEC);
        assert_eq!(table.get(&k).unwrap().last_seen_ns, 10 * SEC);
    }

    #[test]
    fn test_capacity_limit() {
        let table = ConnectionTable::new(2, 2);
        assert_eq!(table.upsert(key(Protocol::Tcp, 1), 1, 1), Upsert::Created);
        assert_eq!(table.upsert(key(Protocol::Tcp, 2), 1, 1), Upsert::Created);
        assert_eq!(table.upsert(key(Protocol::Tcp, 3), 1, 1), Upsert::Full);
        // Existing flows still update when full
        assert_eq!(table.upsert(key(Protocol::Tcp, 1), 1, 1), Upsert::Updated);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_sweep_per_protocol_timeouts() {
        let table = ConnectionTable::new(16, 2);
        let tcp = key(Protocol::Tcp, 1);
        let udp = key(Protocol::Udp, 2);
        let icmp = key(Protocol::Icmp, 0);
        table.upsert_at(tcp, 1, 1, 0);
        table.upsert_at(udp, 1, 1, 0);
        table.upsert_at(icmp, 1, 1, 0);

        let timeouts = IdleTimeouts::default();
        assert_eq!(table.sweep_at(29 * SEC, &timeouts), 0);
        assert_eq!(table.sweep_at(31 * SEC, &timeouts), 1);
        assert!(table.get(&udp).is_none());
        assert!(table.get(&tcp).is_some());

        assert_eq!(table.sweep_at(61 * SEC, &timeouts), 1);
        assert!(table.get(&icmp).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_sweep_keeps_active_flow() {
        let table = ConnectionTable::new(16, 2);
        let udp = key(Protocol::Udp, 7);
        table.upsert_at(udp, 1, 1, 0);
        table.upsert_at(udp, 1, 1, 25 * SEC);
        assert_eq!(table.sweep_at(40 * SEC, &IdleTimeouts::default()), 0);
    }

    #[test]
    fn test_clear() {
        let table = ConnectionTable::new(16, 4);
        table.upsert(key(Protocol::Tcp, 1), 1, 1);
        table.upsert(key(Protocol::Tcp, 2), 1, 1);
        table.clear();
        assert!(table.is_empty());
    }

    #[test]
    fn test_timeouts_from_config() {
        let config = ConnTrackConfig {
            udp_timeout_secs: 5,
            ..Default::default()
        };
        let timeouts = IdleTimeouts::from_config(&config);
        assert_eq!(timeouts.udp, Duration::from_secs(5));
        assert_eq!(timeouts.tcp, Duration::from_secs(300));
    }

    #[test]
    fn test_concurrent_upserts() {
        let table = std::sync::Arc::new(ConnectionTable::new(1024, 8));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        table.upsert(key(Protocol::Tcp, 9), 10, 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&key(Protocol::Tcp, 9)).unwrap().packets, 4000);
    }
}
