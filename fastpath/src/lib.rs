//! fastpath: kernel-bypass packet classification for service traffic.
//!
//! Each attached NIC queue is bound to a shared frame region (the UMEM) and
//! four descriptor rings. A dedicated polling thread pulls received frames,
//! classifies them against a compiled rule table and decides whether they
//! are dropped, forwarded or handed to the authenticating slow path.
//!
//! # Architecture
//!
//! ```text
//! NIC queue --> Transport --> RX ring --> poll thread --> PacketClassifier
//!    ^                                         |              |
//!    |                                         |              +--> RuleTable (ArcSwap)
//!    +------ Completion <-- TX ring <----------+              +--> ConnectionTable
//!                                                             +--> slow path queue
//! FastPathManager: load / attach / update / stats / maintenance thread
//! ```

pub mod classifier;
pub mod config;
pub mod conntrack;
pub mod error;
pub mod manager;
pub mod rules;
pub mod stats;
pub mod xsk;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use classifier::{PacketClassifier, SlowPathPacket, Verdict, classify};
pub use config::{AllowAction, BindMode, ConnTrackConfig, EngineConfig, FastPathConfig};
pub use conntrack::{ConnectionKey, ConnectionTable, ConnectionValue};
pub use error::{ConfigError, Error, Result};
pub use manager::{FastPathManager, ManagerStats};
pub use rules::{AuthType, Mapping, Protocol, ProtocolMask, RuleCompiler, RuleSet, RuleTable, Service};
pub use stats::{EngineStatsSnapshot, FastPathStats, StatsSnapshot};
pub use xsk::{
    Binding, EngineFault, PacketHandler, RxAction, Transport, TransportFactory, ZeroCopyEngine,
};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
