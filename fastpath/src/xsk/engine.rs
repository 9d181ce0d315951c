//! Per-queue packet engine.
//!
//! An engine owns one UMEM, the user-side ends of its four rings and the
//! polling thread that drives them:
//!
//! ```text
//! loop {
//!     transport.wait()        // RX filled, pending TX flushed
//!     drain RX -> handler     // Drop / Pass / Transmit
//!     drain Completion        // frames back to the pool
//!     top up Fill             // below half the target
//! }
//! ```
//!
//! Handler panics and transport errors are contained per packet. After
//! `max_consecutive_faults` failures in a row the loop reports an
//! [`EngineFault`] and exits; the rest of the process keeps running.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use arc_swap::ArcSwapOption;
use crossbeam_channel::Sender;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::lock;
use crate::stats::{EngineCounters, EngineStatsSnapshot, add, bump};
use crate::xsk::ring::{Consumer, Producer, XdpDesc, ring};
use crate::xsk::transport::{
    Binding, Transport, TransportContext, TransportFactory, TransportRings,
};
use crate::xsk::umem::Umem;

/// What to do with a received frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxAction {
    /// Return the frame to the pool and count it as dropped
    Drop,
    /// Return the frame to the pool
    Pass,
    /// Send the (possibly rewritten) frame back out the same queue
    Transmit,
}

/// Called by the polling thread for every received frame
pub trait PacketHandler: Send + 'static {
    fn handle(&mut self, packet: &mut [u8]) -> RxAction;
}

impl<F> PacketHandler for F
where
    F: FnMut(&mut [u8]) -> RxAction + Send + 'static,
{
    fn handle(&mut self, packet: &mut [u8]) -> RxAction {
        self(packet)
    }
}

/// A polling loop gave up after repeated failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFault {
    pub interface: String,
    pub queue_id: u32,
    pub consecutive_faults: u32,
    pub reason: String,
}

/// Everything that exists while the queue is bound
struct Live {
    umem: Arc<Umem>,
    tx: Mutex<Producer<XdpDesc>>,
    transport: Arc<dyn Transport>,
    /// Fill ring occupancy as of the poller's last refill
    fill_posted: AtomicUsize,
}

/// Ring ends owned by the polling thread
struct UserRings {
    fill: Producer<u64>,
    rx: Consumer<XdpDesc>,
    completion: Consumer<u64>,
}

pub struct ZeroCopyEngine {
    binding: Binding,
    config: EngineConfig,
    counters: Arc<EngineCounters>,
    live: ArcSwapOption<Live>,
    rings: Mutex<Option<UserRings>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    stopped: AtomicBool,
    fault_tx: Option<Sender<EngineFault>>,
}

impl ZeroCopyEngine {
    /// Map the UMEM, create the rings and bind them through `factory`.
    pub fn new(
        binding: Binding,
        config: EngineConfig,
        factory: &dyn TransportFactory,
    ) -> Result<Self> {
        config.validate()?;

        let umem = Arc::new(
            Umem::new(&config)
                .map_err(|e| Error::resource(format!("failed to map UMEM for {binding}"), e))?,
        );
        let counters = Arc::new(EngineCounters::new());

        let (fill, fill_kernel) = ring(config.ring_size);
        let (rx_kernel, rx) = ring(config.ring_size);
        let (tx, tx_kernel) = ring(config.ring_size);
        let (completion_kernel, completion) = ring(config.ring_size);

        let transport = factory
            .open(
                &binding,
                TransportRings {
                    fill: fill_kernel,
                    rx: rx_kernel,
                    tx: tx_kernel,
                    completion: completion_kernel,
                },
                TransportContext {
                    umem: Arc::clone(&umem),
                    counters: Arc::clone(&counters),
                },
            )
            .map_err(|e| Error::resource(format!("failed to bind {binding}"), e))?;

        info!(
            binding = %binding,
            frames = config.frame_count,
            frame_size = config.frame_size,
            ring_size = config.ring_size,
            "Engine bound"
        );

        Ok(Self {
            binding,
            config,
            counters,
            live: ArcSwapOption::from_pointee(Live {
                umem,
                tx: Mutex::new(tx),
                transport,
                fill_posted: AtomicUsize::new(0),
            }),
            rings: Mutex::new(Some(UserRings {
                fill,
                rx,
                completion,
            })),
            worker: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
            stopped: AtomicBool::new(false),
            fault_tx: None,
        })
    }

    /// Report loop escalations on `tx`.
    pub fn with_fault_reporter(mut self, tx: Sender<EngineFault>) -> Self {
        self.fault_tx = Some(tx);
        self
    }

    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    pub fn counters(&self) -> &Arc<EngineCounters> {
        &self.counters
    }

    /// Post the initial Fill frames and spawn the polling thread.
    pub fn start<H: PacketHandler>(&self, handler: H) -> Result<()> {
        let live = self.live.load_full().ok_or(Error::EngineStopped)?;
        let rings = lock(&self.rings).take().ok_or(Error::AlreadyStarted)?;

        let mut poller = Poller {
            label: self.binding.to_string(),
            interface: self.binding.interface.clone(),
            queue_id: self.binding.queue_id,
            config: self.config.clone(),
            counters: Arc::clone(&self.counters),
            live,
            rings,
            handler,
            shutdown: Arc::clone(&self.shutdown),
            fault_tx: self.fault_tx.clone(),
            consecutive_faults: 0,
        };
        poller.refill(true);

        let handle = thread::Builder::new()
            .name(format!(
                "xsk-{}-{}",
                self.binding.interface, self.binding.queue_id
            ))
            .spawn(move || poller.run())
            .map_err(|e| Error::resource("failed to spawn polling thread", e))?;
        *lock(&self.worker) = Some(handle);
        Ok(())
    }

    /// Copy `packet` into a free frame and queue it on TX.
    ///
    /// Frames come back through the Completion ring, which only the polling
    /// thread drains.
    pub fn send_packet(&self, packet: &[u8]) -> Result<()> {
        let live = self.live.load_full().ok_or(Error::EngineStopped)?;
        let frame_size = live.umem.frame_size();
        if packet.len() > frame_size as usize {
            bump(&self.counters.tx_invalid);
            return Err(Error::PacketTooLarge {
                len: packet.len(),
                frame_size,
            });
        }

        let Some(addr) = live.umem.alloc_frame() else {
            bump(&self.counters.tx_dropped);
            return Err(Error::Exhausted);
        };
        // SAFETY: the frame was just taken from the pool
        unsafe { live.umem.frame_mut(addr, packet.len()) }.copy_from_slice(packet);

        {
            let mut tx = lock(&live.tx);
            if tx.reserve(1) == 0 {
                drop(tx);
                live.umem.free_frame(addr);
                bump(&self.counters.tx_ring_full);
                bump(&self.counters.tx_dropped);
                return Err(Error::TxRingFull);
            }
            tx.write(
                0,
                XdpDesc {
                    addr,
                    len: packet.len() as u32,
                },
            );
            tx.publish(1);
        }
        bump(&self.counters.tx_packets);
        add(&self.counters.tx_bytes, packet.len() as u64);

        if self.config.wakeup
            && let Err(e) = live.transport.kick()
        {
            bump(&self.counters.transport_errors);
            debug!(binding = %self.binding, error = %e, "TX kick failed");
        }
        Ok(())
    }

    /// Stop the polling thread, release the binding and unmap the UMEM.
    ///
    /// Safe to call more than once.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.store(true, Ordering::Release);

        let handle = lock(&self.worker).take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            error!(binding = %self.binding, "Polling thread panicked");
        }
        lock(&self.rings).take();
        if let Some(live) = self.live.swap(None) {
            live.transport.close();
        }
        info!(binding = %self.binding, "Engine stopped");
    }

    /// True while the polling thread is alive.
    pub fn is_running(&self) -> bool {
        lock(&self.worker)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Frames in the free pool, or `None` once stopped.
    pub fn free_frames(&self) -> Option<usize> {
        self.live.load().as_ref().map(|live| live.umem.available())
    }

    /// Frames posted on the Fill ring, or `None` once stopped.
    pub fn fill_posted(&self) -> Option<usize> {
        self.live
            .load()
            .as_ref()
            .map(|live| live.fill_posted.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            interface: self.binding.interface.clone(),
            queue_id: self.binding.queue_id,
            running: self.is_running(),
            free_frames: self.free_frames().unwrap_or(0),
            fill_posted: self.fill_posted().unwrap_or(0),
            ..self.counters.snapshot()
        }
    }
}

impl Drop for ZeroCopyEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Poller<H> {
    label: String,
    interface: String,
    queue_id: u32,
    config: EngineConfig,
    counters: Arc<EngineCounters>,
    live: Arc<Live>,
    rings: UserRings,
    handler: H,
    shutdown: Arc<AtomicBool>,
    fault_tx: Option<Sender<EngineFault>>,
    consecutive_faults: u32,
}

impl<H: PacketHandler> Poller<H> {
    fn run(mut self) {
        info!(binding = %self.label, "Polling loop started");
        let timeout = self.config.poll_timeout();

        while !self.shutdown.load(Ordering::Acquire) {
            let mut faulted = false;

            if let Err(e) = self.live.transport.wait(timeout) {
                bump(&self.counters.transport_errors);
                faulted = true;
                if self.fault(format!("transport wait failed: {e}")) {
                    break;
                }
            }

            match self.drain_rx() {
                Drained::Clean => {}
                Drained::Faulted => faulted = true,
                Drained::Escalated => break,
            }

            self.reclaim_completions();
            self.refill(false);

            if !faulted {
                self.consecutive_faults = 0;
            }
        }

        self.reclaim_completions();
        info!(binding = %self.label, "Polling loop exited");
    }

    fn drain_rx(&mut self) -> Drained {
        let n = self.rings.rx.peek(self.config.batch_size);
        if n == 0 {
            return Drained::Clean;
        }

        let umem = Arc::clone(&self.live.umem);
        let mut outcome = Drained::Clean;
        let mut transmitted = 0;

        for i in 0..n {
            let desc = self.rings.rx.read(i);
            if !umem.contains(desc.addr, desc.len as usize) {
                bump(&self.counters.rx_invalid);
                if umem.is_frame(desc.addr) {
                    umem.free_frame(desc.addr);
                } else {
                    warn!(binding = %self.label, addr = desc.addr, "RX descriptor outside UMEM");
                }
                continue;
            }
            if outcome == Drained::Escalated {
                umem.free_frame(desc.addr);
                continue;
            }

            bump(&self.counters.rx_packets);
            add(&self.counters.rx_bytes, desc.len as u64);

            // SAFETY: the descriptor came off RX, so this thread owns the frame
            let frame = unsafe { umem.frame_mut(desc.addr, desc.len as usize) };
            let handler = &mut self.handler;
            match catch_unwind(AssertUnwindSafe(|| handler.handle(frame))) {
                Ok(action) => {
                    self.consecutive_faults = 0;
                    match action {
                        RxAction::Drop => {
                            bump(&self.counters.rx_dropped);
                            umem.free_frame(desc.addr);
                        }
                        RxAction::Pass => {
                            umem.free_frame(desc.addr);
                        }
                        RxAction::Transmit => {
                            if self.queue_tx(desc) {
                                transmitted += 1;
                            } else {
                                umem.free_frame(desc.addr);
                            }
                        }
                    }
                }
                Err(panic) => {
                    umem.free_frame(desc.addr);
                    bump(&self.counters.handler_faults);
                    outcome = if self.fault(format!("handler panicked: {}", panic_message(&*panic)))
                    {
                        Drained::Escalated
                    } else {
                        Drained::Faulted
                    };
                }
            }
        }
        self.rings.rx.release(n);

        if transmitted > 0 && self.config.wakeup {
            self.kick();
        }
        outcome
    }

    fn queue_tx(&self, desc: XdpDesc) -> bool {
        let mut tx = lock(&self.live.tx);
        if !tx.push(desc) {
            bump(&self.counters.tx_ring_full);
            bump(&self.counters.tx_dropped);
            return false;
        }
        bump(&self.counters.tx_packets);
        add(&self.counters.tx_bytes, desc.len as u64);
        true
    }

    fn reclaim_completions(&mut self) {
        let n = self.rings.completion.peek(self.rings.completion.size());
        for i in 0..n {
            self.live.umem.free_frame(self.rings.completion.read(i));
        }
        self.rings.completion.release(n);
        add(&self.counters.completed, n as u64);
    }

    /// Top up the Fill ring once it drops below half the target, or
    /// unconditionally when `force` is set.
    fn refill(&mut self, force: bool) {
        self.top_up(force);
        self.live
            .fill_posted
            .store(self.rings.fill.occupancy() as usize, Ordering::Release);
    }

    fn top_up(&mut self, force: bool) {
        let target = self.config.fill_target();
        let occupancy = self.rings.fill.occupancy();
        if occupancy >= target || (!force && occupancy * 2 >= target) {
            return;
        }

        let reserved = self.rings.fill.reserve(target - occupancy);
        let mut written = 0;
        while written < reserved {
            let Some(addr) = self.live.umem.alloc_frame() else {
                bump(&self.counters.refill_exhausted);
                break;
            };
            self.rings.fill.write(written, addr);
            written += 1;
        }
        self.rings.fill.publish(written);

        if written > 0 && self.config.wakeup {
            self.kick();
        }
    }

    fn kick(&self) {
        if let Err(e) = self.live.transport.kick() {
            bump(&self.counters.transport_errors);
            debug!(binding = %self.label, error = %e, "Kick failed");
        }
    }

    /// Record one failure. Returns true once the loop has to give up.
    fn fault(&mut self, reason: String) -> bool {
        self.consecutive_faults += 1;
        warn!(
            binding = %self.label,
            consecutive = self.consecutive_faults,
            reason = %reason,
            "Polling loop fault"
        );
        if self.consecutive_faults < self.config.max_consecutive_faults {
            return false;
        }

        error!(
            binding = %self.label,
            consecutive = self.consecutive_faults,
            "Polling loop stopped after repeated faults"
        );
        if let Some(tx) = &self.fault_tx {
            let _ = tx.send(EngineFault {
                interface: self.interface.clone(),
                queue_id: self.queue_id,
                consecutive_faults: self.consecutive_faults,
                reason,
            });
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drained {
    Clean,
    Faulted,
    Escalated,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
