//! AF_XDP-style queue engine: UMEM, descriptor rings, transports and the
//! per-queue polling loop.

pub mod engine;
pub mod ring;
pub mod transport;
pub mod umem;

pub use engine::{EngineFault, PacketHandler, RxAction, ZeroCopyEngine};
pub use ring::XdpDesc;
pub use transport::{
    Binding, MemoryTransportFactory, MemoryWire, PacketSocketFactory, Transport,
    TransportContext, TransportFactory, TransportRings,
};
pub use umem::Umem;
