//! Transports move frames between a NIC queue and the engine's rings.
//!
//! A transport owns the kernel-side ends of the four rings: it consumes
//! Fill and TX and produces RX and Completion. The engine only ever sees the
//! user-side ends.

mod memory;
mod packet;

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::config::BindMode;
use crate::stats::{EngineCounters, bump};
use crate::xsk::ring::{Consumer, Producer, XdpDesc};
use crate::xsk::umem::Umem;

pub use memory::{MemoryTransport, MemoryTransportFactory, MemoryWire};
pub use packet::{PacketSocketFactory, PacketTransport};

/// The NIC queue an engine is bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub interface: String,
    pub queue_id: u32,
    /// Queues attached on this interface in total
    pub queue_count: u32,
    pub bind_mode: BindMode,
}

impl Binding {
    pub fn new(interface: impl Into<String>, queue_id: u32) -> Self {
        Self {
            interface: interface.into(),
            queue_id,
            queue_count: 1,
            bind_mode: BindMode::Auto,
        }
    }

    pub fn with_queue_count(mut self, queue_count: u32) -> Self {
        self.queue_count = queue_count;
        self
    }

    pub fn with_bind_mode(mut self, bind_mode: BindMode) -> Self {
        self.bind_mode = bind_mode;
        self
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.interface, self.queue_id)
    }
}

/// Transport-side ring ends handed over when a binding is opened
pub struct TransportRings {
    pub fill: Consumer<u64>,
    pub rx: Producer<XdpDesc>,
    pub tx: Consumer<XdpDesc>,
    pub completion: Producer<u64>,
}

/// Shared state a transport writes into
#[derive(Clone)]
pub struct TransportContext {
    pub umem: Arc<Umem>,
    pub counters: Arc<EngineCounters>,
}

pub trait Transport: Send + Sync {
    /// Block up to `timeout` for traffic and move received packets onto
    /// the RX ring. Pending TX entries are serviced first. Returns true if
    /// the RX ring holds entries afterwards.
    fn wait(&self, timeout: Duration) -> io::Result<bool>;

    /// Service pending TX entries without blocking.
    fn kick(&self) -> io::Result<()>;

    /// Release the binding. Later calls on the transport are no-ops.
    fn close(&self);
}

pub trait TransportFactory: Send + Sync {
    fn open(
        &self,
        binding: &Binding,
        rings: TransportRings,
        ctx: TransportContext,
    ) -> io::Result<Arc<dyn Transport>>;
}

/// Receive half: Fill in, RX out
pub(crate) struct RxSide {
    fill: Consumer<u64>,
    rx: Producer<XdpDesc>,
    ctx: TransportContext,
}

impl RxSide {
    fn new(fill: Consumer<u64>, rx: Producer<XdpDesc>, ctx: TransportContext) -> Self {
        Self { fill, rx, ctx }
    }

    /// Frame the next packet can be received into, if the rings allow it.
    fn next_frame(&mut self) -> Option<u64> {
        if self.rx.free() == 0 {
            bump(&self.ctx.counters.rx_ring_full);
            return None;
        }
        if self.fill.peek(1) == 0 {
            bump(&self.ctx.counters.fill_ring_empty);
            return None;
        }
        Some(self.fill.read(0))
    }

    /// Buffer of the frame returned by `next_frame`.
    fn buffer(&mut self, addr: u64) -> &mut [u8] {
        // SAFETY: addr came off the Fill ring, so the transport owns the
        // frame until it is published on RX.
        unsafe { self.ctx.umem.frame_mut(addr, self.ctx.umem.frame_size() as usize) }
    }

    /// Publish a packet of `len` bytes received into `addr`.
    fn commit(&mut self, addr: u64, len: usize) {
        self.fill.release(1);
        self.rx.reserve(1);
        self.rx.write(
            0,
            XdpDesc {
                addr,
                len: len as u32,
            },
        );
        self.rx.publish(1);
    }

    /// Copy a packet into the next frame. Returns false if it was dropped.
    fn deliver(&mut self, packet: &[u8]) -> bool {
        let Some(addr) = self.next_frame() else {
            return false;
        };
        if packet.len() > self.ctx.umem.frame_size() as usize {
            bump(&self.ctx.counters.rx_invalid);
            return false;
        }
        self.buffer(addr)[..packet.len()].copy_from_slice(packet);
        self.commit(addr, packet.len());
        true
    }

    fn pending(&self) -> bool {
        self.rx.occupancy() > 0
    }

    fn capacity(&self) -> u32 {
        self.rx.size()
    }
}

/// Transmit half: TX in, Completion out
pub(crate) struct TxSide {
    tx: Consumer<XdpDesc>,
    completion: Producer<u64>,
    ctx: TransportContext,
}

impl TxSide {
    fn new(tx: Consumer<XdpDesc>, completion: Producer<u64>, ctx: TransportContext) -> Self {
        Self {
            tx,
            completion,
            ctx,
        }
    }

    /// Hand queued TX frames to `send` and post them on Completion.
    ///
    /// `send` returns `Ok(false)` when the device would block; that frame and
    /// everything behind it stay queued. Frames that fail to send are still
    /// completed so the engine gets them back.
    fn transmit(
        &mut self,
        mut send: impl FnMut(&[u8]) -> io::Result<bool>,
    ) -> io::Result<u32> {
        let room = self.completion.free();
        let n = self.tx.peek(room);
        if n == 0 {
            return Ok(0);
        }
        self.completion.reserve(n);

        let mut consumed = 0;
        let mut done = 0;
        let mut result = Ok(());
        for i in 0..n {
            let desc = self.tx.read(i);
            if self.ctx.umem.contains(desc.addr, desc.len as usize) {
                // SAFETY: the frame sits on TX, owned by the transport
                let frame = unsafe { self.ctx.umem.frame(desc.addr, desc.len as usize) };
                match send(frame) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        bump(&self.ctx.counters.transport_errors);
                        result = Err(e);
                    }
                }
            } else {
                bump(&self.ctx.counters.tx_invalid);
            }
            consumed += 1;
            // A bogus address is not ours to hand back
            if self.ctx.umem.is_frame(desc.addr) {
                self.completion.write(done, desc.addr);
                done += 1;
            }
        }

        self.completion.publish(done);
        self.tx.release(consumed);
        result.map(|()| done)
    }
}
