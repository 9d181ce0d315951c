//! In-process transport backed by channels.
//!
//! Each `(interface, queue)` pair gets a wire: frames injected on the wire
//! show up on the engine's RX ring and frames the engine transmits come out
//! the other end. Used by the integration tests and by hosts without a
//! usable NIC queue.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use tracing::{debug, trace};

use super::{
    Binding, RxSide, Transport, TransportContext, TransportFactory, TransportRings, TxSide,
};
use crate::config::BindMode;
use crate::lock;

const DEFAULT_WIRE_DEPTH: usize = 4096;

/// Test-side handle of one queue's wire
#[derive(Clone)]
pub struct MemoryWire {
    inbound: Sender<Vec<u8>>,
    outbound: Receiver<Vec<u8>>,
}

impl MemoryWire {
    /// Queue a frame for reception. Returns false if the wire is full.
    pub fn inject(&self, frame: impl Into<Vec<u8>>) -> bool {
        self.inbound.try_send(frame.into()).is_ok()
    }

    /// Next frame the engine transmitted, waiting up to `timeout`.
    pub fn recv_transmitted(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.outbound.recv_timeout(timeout).ok()
    }

    pub fn try_recv_transmitted(&self) -> Option<Vec<u8>> {
        self.outbound.try_recv().ok()
    }
}

struct WireEnds {
    inbound_tx: Sender<Vec<u8>>,
    inbound_rx: Receiver<Vec<u8>>,
    outbound_tx: Sender<Vec<u8>>,
    outbound_rx: Receiver<Vec<u8>>,
}

impl WireEnds {
    fn new(depth: usize) -> Self {
        let (inbound_tx, inbound_rx) = bounded(depth);
        let (outbound_tx, outbound_rx) = bounded(depth);
        Self {
            inbound_tx,
            inbound_rx,
            outbound_tx,
            outbound_rx,
        }
    }
}

/// Opens [`MemoryTransport`]s on a set of known interfaces
pub struct MemoryTransportFactory {
    interfaces: Mutex<HashSet<String>>,
    wires: Mutex<HashMap<(String, u32), WireEnds>>,
    depth: usize,
}

impl Default for MemoryTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransportFactory {
    pub fn new() -> Self {
        Self {
            interfaces: Mutex::new(HashSet::new()),
            wires: Mutex::new(HashMap::new()),
            depth: DEFAULT_WIRE_DEPTH,
        }
    }

    pub fn with_interfaces<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let factory = Self::new();
        for name in names {
            factory.add_interface(name);
        }
        factory
    }

    /// Frames a wire buffers in each direction
    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth.max(1);
        self
    }

    pub fn add_interface(&self, name: impl Into<String>) {
        lock(&self.interfaces).insert(name.into());
    }

    pub fn remove_interface(&self, name: &str) {
        lock(&self.interfaces).remove(name);
    }

    /// The wire of one queue, created on first use.
    pub fn wire(&self, interface: &str, queue_id: u32) -> MemoryWire {
        let mut wires = lock(&self.wires);
        let ends = wires
            .entry((interface.to_string(), queue_id))
            .or_insert_with(|| WireEnds::new(self.depth));
        MemoryWire {
            inbound: ends.inbound_tx.clone(),
            outbound: ends.outbound_rx.clone(),
        }
    }
}

impl TransportFactory for MemoryTransportFactory {
    fn open(
        &self,
        binding: &Binding,
        rings: TransportRings,
        ctx: TransportContext,
    ) -> io::Result<Arc<dyn Transport>> {
        if !lock(&self.interfaces).contains(&binding.interface) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such interface: {}", binding.interface),
            ));
        }
        if binding.bind_mode == BindMode::ZeroCopy {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "memory transport only supports copy mode",
            ));
        }

        let (inbound, outbound) = {
            let mut wires = lock(&self.wires);
            let ends = wires
                .entry((binding.interface.clone(), binding.queue_id))
                .or_insert_with(|| WireEnds::new(self.depth));
            (ends.inbound_rx.clone(), ends.outbound_tx.clone())
        };

        debug!(binding = %binding, "Memory transport opened");
        Ok(Arc::new(MemoryTransport {
            label: binding.to_string(),
            rx: Mutex::new(Some(RxSide::new(rings.fill, rings.rx, ctx.clone()))),
            tx: Mutex::new(Some(TxSide::new(rings.tx, rings.completion, ctx))),
            inbound,
            outbound,
        }))
    }
}

pub struct MemoryTransport {
    label: String,
    rx: Mutex<Option<RxSide>>,
    tx: Mutex<Option<TxSide>>,
    inbound: Receiver<Vec<u8>>,
    outbound: Sender<Vec<u8>>,
}

impl Transport for MemoryTransport {
    fn wait(&self, timeout: Duration) -> io::Result<bool> {
        self.kick()?;

        let mut guard = lock(&self.rx);
        let Some(side) = guard.as_mut() else {
            return Ok(false);
        };

        // Entries still queued on RX mean the poller has work; don't block
        let timeout = if side.pending() { Duration::ZERO } else { timeout };
        let first = match self.inbound.recv_timeout(timeout) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => return Ok(side.pending()),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "memory wire disconnected",
                ));
            }
        };

        let mut received = 1;
        side.deliver(&first);
        while received < side.capacity() {
            match self.inbound.try_recv() {
                Ok(frame) => {
                    side.deliver(&frame);
                    received += 1;
                }
                Err(_) => break,
            }
        }
        trace!(transport = %self.label, received, "Frames received");
        Ok(side.pending())
    }

    fn kick(&self) -> io::Result<()> {
        let mut guard = lock(&self.tx);
        let Some(side) = guard.as_mut() else {
            return Ok(());
        };
        side.transmit(|frame| match self.outbound.try_send(frame.to_vec()) {
            // A full wire loses the frame like a congested link would
            Ok(()) | Err(TrySendError::Full(_)) => Ok(true),
            Err(TrySendError::Disconnected(_)) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "memory wire disconnected",
            )),
        })?;
        Ok(())
    }

    fn close(&self) {
        lock(&self.rx).take();
        lock(&self.tx).take();
        debug!(transport = %self.label, "Memory transport closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::stats::EngineCounters;
    use crate::xsk::ring::{Consumer, Producer, XdpDesc, ring};
    use crate::xsk::umem::Umem;

    struct UserEnds {
        fill: Producer<u64>,
        rx: Consumer<XdpDesc>,
        tx: Producer<XdpDesc>,
        completion: Consumer<u64>,
    }

    fn parts() -> (TransportRings, UserEnds, TransportContext) {
        let config = EngineConfig::default()
            .with_frame_count(8)
            .with_ring_size(4)
            .with_hugepages(false);
        let ctx = TransportContext {
            umem: Arc::new(Umem::new(&config).unwrap()),
            counters: Arc::new(EngineCounters::new()),
        };
        let (fill_p, fill_c) = ring(4);
        let (rx_p, rx_c) = ring(4);
        let (tx_p, tx_c) = ring(4);
        let (comp_p, comp_c) = ring(4);
        let rings = TransportRings {
            fill: fill_c,
            rx: rx_p,
            tx: tx_c,
            completion: comp_p,
        };
        let ends = UserEnds {
            fill: fill_p,
            rx: rx_c,
            tx: tx_p,
            completion: comp_c,
        };
        (rings, ends, ctx)
    }

    fn open(
        factory: &MemoryTransportFactory,
        binding: &Binding,
    ) -> (Arc<dyn Transport>, UserEnds, TransportContext) {
        let (rings, ends, ctx) = parts();
        let transport = factory.open(binding, rings, ctx.clone()).unwrap();
        (transport, ends, ctx)
    }

    #[test]
    fn test_unknown_interface() {
        let factory = MemoryTransportFactory::new();
        let (rings, _ends, ctx) = parts();
        let err = factory
            .open(&Binding::new("missing0", 0), rings, ctx)
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_receive_into_posted_frames() {
        let factory = MemoryTransportFactory::with_interfaces(["eth0"]);
        let binding = Binding::new("eth0", 0);
        let (transport, mut ends, ctx) = open(&factory, &binding);
        let wire = factory.wire("eth0", 0);

        let addr = ctx.umem.alloc_frame().unwrap();
        assert!(ends.fill.push(addr));
        assert!(wire.inject(vec![7u8; 60]));

        assert!(transport.wait(Duration::from_millis(100)).unwrap());
        let desc = ends.rx.pop().unwrap();
        assert_eq!(desc, XdpDesc { addr, len: 60 });
        assert_eq!(unsafe { ctx.umem.frame(addr, 60) }, &[7u8; 60][..]);
    }

    #[test]
    fn test_receive_without_fill_frames_drops() {
        let factory = MemoryTransportFactory::with_interfaces(["eth0"]);
        let (transport, mut ends, ctx) = open(&factory, &Binding::new("eth0", 0));
        factory.wire("eth0", 0).inject(vec![1u8; 60]);

        assert!(!transport.wait(Duration::from_millis(100)).unwrap());
        assert!(ends.rx.pop().is_none());
        assert_eq!(ctx.counters.snapshot().fill_ring_empty, 1);
    }

    #[test]
    fn test_wait_does_not_block_with_rx_pending() {
        let factory = MemoryTransportFactory::with_interfaces(["eth0"]);
        let (transport, mut ends, ctx) = open(&factory, &Binding::new("eth0", 0));
        ends.fill.push(ctx.umem.alloc_frame().unwrap());
        factory.wire("eth0", 0).inject(vec![1u8; 60]);
        assert!(transport.wait(Duration::from_millis(100)).unwrap());

        // Nothing new on the wire, but RX still holds the first frame
        let start = std::time::Instant::now();
        assert!(transport.wait(Duration::from_secs(2)).unwrap());
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(ends.rx.pop().is_some());
    }

    #[test]
    fn test_oversized_frame_is_invalid() {
        let factory = MemoryTransportFactory::with_interfaces(["eth0"]);
        let (transport, mut ends, ctx) = open(&factory, &Binding::new("eth0", 0));
        ends.fill.push(ctx.umem.alloc_frame().unwrap());
        factory.wire("eth0", 0).inject(vec![0u8; 4000]);

        transport.wait(Duration::from_millis(100)).unwrap();
        assert!(ends.rx.pop().is_none());
        assert_eq!(ctx.counters.snapshot().rx_invalid, 1);
        // The frame stays posted on Fill
        assert_eq!(ends.fill.occupancy(), 1);
    }

    #[test]
    fn test_transmit_and_complete() {
        let factory = MemoryTransportFactory::with_interfaces(["eth0"]);
        let (transport, mut ends, ctx) = open(&factory, &Binding::new("eth0", 1));
        let wire = factory.wire("eth0", 1);

        let addr = ctx.umem.alloc_frame().unwrap();
        unsafe { ctx.umem.frame_mut(addr, 3) }.copy_from_slice(&[1, 2, 3]);
        assert!(ends.tx.push(XdpDesc { addr, len: 3 }));

        transport.kick().unwrap();
        assert_eq!(wire.try_recv_transmitted(), Some(vec![1, 2, 3]));
        assert_eq!(ends.completion.pop(), Some(addr));
    }

    #[test]
    fn test_closed_transport_is_inert() {
        let factory = MemoryTransportFactory::with_interfaces(["eth0"]);
        let (transport, mut ends, ctx) = open(&factory, &Binding::new("eth0", 0));
        transport.close();

        ends.fill.push(ctx.umem.alloc_frame().unwrap());
        factory.wire("eth0", 0).inject(vec![1u8; 60]);
        assert!(!transport.wait(Duration::from_millis(10)).unwrap());
        transport.kick().unwrap();
        assert!(ends.rx.pop().is_none());
    }

    #[test]
    fn test_zero_copy_mode_rejected() {
        let factory = MemoryTransportFactory::with_interfaces(["eth0"]);
        let binding = Binding::new("eth0", 0).with_bind_mode(BindMode::ZeroCopy);
        let (rings, _ends, ctx) = parts();
        let err = factory.open(&binding, rings, ctx).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
