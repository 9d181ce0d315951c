//! Per-packet classification against the installed rule table.
//!
//! Parsing uses smoltcp's checked packet views; nothing is copied. The
//! verdict is a pure function of the frame and the table, the only side
//! effects are the counters and the connection table.

use std::net::Ipv4Addr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use crossbeam_channel::Sender;
use serde::Serialize;
use smoltcp::wire::{EthernetFrame, EthernetProtocol, Ipv4Packet, TcpPacket, UdpPacket};
use tracing::trace;

use crate::config::AllowAction;
use crate::conntrack::{ConnectionKey, ConnectionTable, Upsert};
use crate::rules::{Protocol, RuleTable};
use crate::stats::{FastPathStats, add, bump};
use crate::xsk::engine::{PacketHandler, RxAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
    Drop,
    Allow,
    RedirectToSlowPath,
}

/// Notification for a packet that needs the authenticating proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlowPathPacket {
    pub key: ConnectionKey,
    pub mapping_id: u32,
    pub service_id: u32,
    pub len: usize,
}

enum Parsed {
    NonIp,
    Malformed,
    Ipv4(ConnectionKey),
}

fn addr_at(header: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        header[offset],
        header[offset + 1],
        header[offset + 2],
        header[offset + 3],
    )
}

fn parse(packet: &[u8]) -> Parsed {
    let Ok(eth) = EthernetFrame::new_checked(packet) else {
        return Parsed::Malformed;
    };
    if eth.ethertype() != EthernetProtocol::Ipv4 {
        return Parsed::NonIp;
    }

    let payload = eth.payload();
    let Ok(ip) = Ipv4Packet::new_checked(payload) else {
        return Parsed::Malformed;
    };
    if ip.version() != 4 {
        return Parsed::Malformed;
    }
    let protocol: u8 = ip.next_header().into();

    let (src_port, dst_port) = match Protocol::from_ip_number(protocol) {
        Some(Protocol::Tcp) => match TcpPacket::new_checked(ip.payload()) {
            Ok(tcp) => (tcp.src_port(), tcp.dst_port()),
            Err(_) => return Parsed::Malformed,
        },
        Some(Protocol::Udp) => match UdpPacket::new_checked(ip.payload()) {
            Ok(udp) => (udp.src_port(), udp.dst_port()),
            Err(_) => return Parsed::Malformed,
        },
        _ => (0, 0),
    };

    // Source and destination sit at fixed offsets of the checked header
    Parsed::Ipv4(ConnectionKey {
        src_addr: addr_at(payload, 12),
        dst_addr: addr_at(payload, 16),
        src_port,
        dst_port,
        protocol,
    })
}

/// Classify one frame.
///
/// Updates `stats` for every packet and `connections` for allowed flows.
pub fn classify(
    packet: &[u8],
    table: &RuleTable,
    connections: &ConnectionTable,
    stats: &FastPathStats,
) -> Verdict {
    evaluate(packet, table, connections, stats).0
}

fn drop_packet(stats: &FastPathStats) -> (Verdict, Option<SlowPathPacket>) {
    bump(&stats.dropped_packets);
    (Verdict::Drop, None)
}

fn evaluate(
    packet: &[u8],
    table: &RuleTable,
    connections: &ConnectionTable,
    stats: &FastPathStats,
) -> (Verdict, Option<SlowPathPacket>) {
    let len = packet.len();
    bump(&stats.total_packets);
    add(&stats.total_bytes, len as u64);

    let key = match parse(packet) {
        Parsed::NonIp => {
            bump(&stats.non_ip_packets);
            return (Verdict::Allow, None);
        }
        Parsed::Malformed => {
            bump(&stats.malformed_packets);
            return drop_packet(stats);
        }
        Parsed::Ipv4(key) => key,
    };

    let Some(protocol) = Protocol::from_ip_number(key.protocol) else {
        bump(&stats.other_packets);
        return drop_packet(stats);
    };
    match protocol {
        Protocol::Tcp => bump(&stats.tcp_packets),
        Protocol::Udp => bump(&stats.udp_packets),
        Protocol::Icmp => bump(&stats.icmp_packets),
    }

    let Some(mapping) = table.lookup(protocol, key.dst_port) else {
        trace!(?key, "No mapping");
        return drop_packet(stats);
    };
    let Some(service) = table.dest_service(mapping) else {
        trace!(?key, mapping = mapping.id, "Mapping has no reachable service");
        return drop_packet(stats);
    };

    if mapping.auth_required || service.auth_required {
        bump(&stats.auth_required_packets);
        bump(&stats.fallback_to_slow_path_packets);
        return (
            Verdict::RedirectToSlowPath,
            Some(SlowPathPacket {
                key,
                mapping_id: mapping.id,
                service_id: service.id,
                len,
            }),
        );
    }

    if connections.upsert(key, len as u64, service.id) == Upsert::Full {
        bump(&stats.conntrack_full);
    }
    bump(&stats.forwarded_packets);
    (Verdict::Allow, None)
}

/// Classifier bound to the live table, shared state and slow-path queue
#[derive(Clone)]
pub struct PacketClassifier {
    table: Arc<ArcSwap<RuleTable>>,
    connections: Arc<ConnectionTable>,
    stats: Arc<FastPathStats>,
    slow_path: Option<Sender<SlowPathPacket>>,
}

impl PacketClassifier {
    pub fn new(
        table: Arc<ArcSwap<RuleTable>>,
        connections: Arc<ConnectionTable>,
        stats: Arc<FastPathStats>,
    ) -> Self {
        Self {
            table,
            connections,
            stats,
            slow_path: None,
        }
    }

    pub fn with_slow_path(mut self, tx: Sender<SlowPathPacket>) -> Self {
        self.slow_path = Some(tx);
        self
    }

    /// Classify against whatever table is installed right now.
    pub fn classify(&self, packet: &[u8]) -> Verdict {
        let table = self.table.load();
        let (verdict, redirect) = evaluate(packet, &table, &self.connections, &self.stats);
        if let (Some(tx), Some(redirect)) = (&self.slow_path, redirect)
            && tx.try_send(redirect).is_err()
        {
            bump(&self.stats.slow_path_queue_drops);
        }
        verdict
    }

    /// Engine handler that maps verdicts to frame actions.
    pub fn into_handler(self, allow: AllowAction) -> ClassifierHandler {
        ClassifierHandler {
            classifier: self,
            allow,
        }
    }
}

pub struct ClassifierHandler {
    classifier: PacketClassifier,
    allow: AllowAction,
}

impl PacketHandler for ClassifierHandler {
    fn handle(&mut self, packet: &mut [u8]) -> RxAction {
        match self.classifier.classify(packet) {
            Verdict::Drop => RxAction::Drop,
            // The slow path picks the packet up from the regular stack
            Verdict::RedirectToSlowPath => RxAction::Pass,
            Verdict::Allow => match self.allow {
                AllowAction::Pass => RxAction::Pass,
                AllowAction::Transmit => RxAction::Transmit,
            },
        }
    }
}
