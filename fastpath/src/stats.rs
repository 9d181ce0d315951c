//! Packet counters.
//!
//! Every counter is its own atomic; writers never take a lock and a
//! snapshot never observes a torn value. Counters only go up until an
//! operator calls `reset`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

#[inline]
fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Aggregate classifier counters, shared by every polling loop
#[derive(Debug, Default)]
pub struct FastPathStats {
    pub(crate) total_packets: AtomicU64,
    pub(crate) total_bytes: AtomicU64,
    pub(crate) tcp_packets: AtomicU64,
    pub(crate) udp_packets: AtomicU64,
    pub(crate) icmp_packets: AtomicU64,
    pub(crate) non_ip_packets: AtomicU64,
    /// IPv4 with a protocol other than TCP/UDP/ICMP
    pub(crate) other_packets: AtomicU64,
    pub(crate) malformed_packets: AtomicU64,
    pub(crate) dropped_packets: AtomicU64,
    pub(crate) forwarded_packets: AtomicU64,
    pub(crate) auth_required_packets: AtomicU64,
    pub(crate) fallback_to_slow_path_packets: AtomicU64,
    pub(crate) conntrack_full: AtomicU64,
    pub(crate) slow_path_queue_drops: AtomicU64,
}

/// Point-in-time copy of [`FastPathStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total_packets: u64,
    pub total_bytes: u64,
    pub tcp_packets: u64,
    pub udp_packets: u64,
    pub icmp_packets: u64,
    pub non_ip_packets: u64,
    pub other_packets: u64,
    pub malformed_packets: u64,
    pub dropped_packets: u64,
    pub forwarded_packets: u64,
    pub auth_required_packets: u64,
    pub fallback_to_slow_path_packets: u64,
    pub conntrack_full: u64,
    pub slow_path_queue_drops: u64,
}

impl FastPathStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_packets: read(&self.total_packets),
            total_bytes: read(&self.total_bytes),
            tcp_packets: read(&self.tcp_packets),
            udp_packets: read(&self.udp_packets),
            icmp_packets: read(&self.icmp_packets),
            non_ip_packets: read(&self.non_ip_packets),
            other_packets: read(&self.other_packets),
            malformed_packets: read(&self.malformed_packets),
            dropped_packets: read(&self.dropped_packets),
            forwarded_packets: read(&self.forwarded_packets),
            auth_required_packets: read(&self.auth_required_packets),
            fallback_to_slow_path_packets: read(&self.fallback_to_slow_path_packets),
            conntrack_full: read(&self.conntrack_full),
            slow_path_queue_drops: read(&self.slow_path_queue_drops),
        }
    }

    /// Zero every counter. Operator action only.
    pub fn reset(&self) {
        for counter in [
            &self.total_packets,
            &self.total_bytes,
            &self.tcp_packets,
            &self.udp_packets,
            &self.icmp_packets,
            &self.non_ip_packets,
            &self.other_packets,
            &self.malformed_packets,
            &self.dropped_packets,
            &self.forwarded_packets,
            &self.auth_required_packets,
            &self.fallback_to_slow_path_packets,
            &self.conntrack_full,
            &self.slow_path_queue_drops,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Per-queue engine counters, written by the polling loop, the
/// transport and `send_packet` callers
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub(crate) rx_packets: AtomicU64,
    pub(crate) rx_bytes: AtomicU64,
    pub(crate) rx_dropped: AtomicU64,
    /// Descriptors or received frames that did not fit a frame
    pub(crate) rx_invalid: AtomicU64,
    pub(crate) rx_ring_full: AtomicU64,
    pub(crate) fill_ring_empty: AtomicU64,
    pub(crate) refill_exhausted: AtomicU64,
    pub(crate) tx_packets: AtomicU64,
    pub(crate) tx_bytes: AtomicU64,
    pub(crate) tx_dropped: AtomicU64,
    pub(crate) tx_invalid: AtomicU64,
    pub(crate) tx_ring_full: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) handler_faults: AtomicU64,
    pub(crate) transport_errors: AtomicU64,
}

/// Point-in-time copy of one queue's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatsSnapshot {
    pub interface: String,
    pub queue_id: u32,
    pub running: bool,
    pub free_frames: usize,
    pub fill_posted: usize,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_dropped: u64,
    pub rx_invalid: u64,
    pub rx_ring_full: u64,
    pub fill_ring_empty: u64,
    pub refill_exhausted: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_dropped: u64,
    pub tx_invalid: u64,
    pub tx_ring_full: u64,
    pub completed: u64,
    pub handler_faults: u64,
    pub transport_errors: u64,
}

impl EngineCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy the counters; binding fields are filled in by the engine.
    pub(crate) fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            rx_packets: read(&self.rx_packets),
            rx_bytes: read(&self.rx_bytes),
            rx_dropped: read(&self.rx_dropped),
            rx_invalid: read(&self.rx_invalid),
            rx_ring_full: read(&self.rx_ring_full),
            fill_ring_empty: read(&self.fill_ring_empty),
            refill_exhausted: read(&self.refill_exhausted),
            tx_packets: read(&self.tx_packets),
            tx_bytes: read(&self.tx_bytes),
            tx_dropped: read(&self.tx_dropped),
            tx_invalid: read(&self.tx_invalid),
            tx_ring_full: read(&self.tx_ring_full),
            completed: read(&self.completed),
            handler_faults: read(&self.handler_faults),
            transport_errors: read(&self.transport_errors),
            ..Default::default()
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.rx_packets,
            &self.rx_bytes,
            &self.rx_dropped,
            &self.rx_invalid,
            &self.rx_ring_full,
            &self.fill_ring_empty,
            &self.refill_exhausted,
            &self.tx_packets,
            &self.tx_bytes,
            &self.tx_dropped,
            &self.tx_invalid,
            &self.tx_ring_full,
            &self.completed,
            &self.handler_faults,
            &self.transport_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_reset() {
        let stats = FastPathStats::new();
        bump(&stats.total_packets);
        add(&stats.total_bytes, 60);
        bump(&stats.tcp_packets);

        let snap = stats.snapshot();
        assert_eq!(snap.total_packets, 1);
        assert_eq!(snap.total_bytes, 60);
        assert_eq!(snap.tcp_packets, 1);
        assert_eq!(snap.udp_packets, 0);

        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_engine_snapshot_and_reset() {
        let counters = EngineCounters::new();
        add(&counters.rx_packets, 3);
        add(&counters.rx_bytes, 300);
        bump(&counters.handler_faults);

        let snap = counters.snapshot();
        assert_eq!(snap.rx_packets, 3);
        assert_eq!(snap.rx_bytes, 300);
        assert_eq!(snap.handler_faults, 1);
        assert!(snap.interface.is_empty());

        counters.reset();
        assert_eq!(counters.snapshot(), EngineStatsSnapshot::default());
    }

    #[test]
    fn test_snapshot_serializes_with_counter_names() {
        let json = serde_json::to_value(FastPathStats::new().snapshot()).unwrap();
        assert!(json.get("fallback_to_slow_path_packets").is_some());
        assert!(json.get("auth_required_packets").is_some());
    }
}
