//! Fast path configuration.
//!
//! All structs deserialize with defaults for missing fields, so a partial
//! JSON document only needs to name the settings it changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default frame size in bytes (one Ethernet MTU plus headroom)
pub const DEFAULT_FRAME_SIZE: u32 = 2048;

/// Default number of frames carved out of the UMEM
pub const DEFAULT_FRAME_COUNT: u32 = 4096;

/// Default descriptor count for each of the four rings
pub const DEFAULT_RING_SIZE: u32 = 2048;

/// Default RX batch drained per poll iteration
pub const DEFAULT_BATCH_SIZE: u32 = 64;

/// Default readiness wait
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 1;

/// Default number of mappings examined per packet
pub const DEFAULT_SCAN_LIMIT: usize = 32;

/// Default table limits
pub const DEFAULT_MAX_SERVICES: usize = 1024;
pub const DEFAULT_MAX_MAPPINGS: usize = 512;
pub const DEFAULT_MAX_CONNECTIONS: usize = 65536;

/// Consecutive loop faults before a polling loop gives up
pub const DEFAULT_MAX_CONSECUTIVE_FAULTS: u32 = 3;

const MIN_FRAME_SIZE: u32 = 2048;
const MAX_FRAME_SIZE: u32 = 65536;

/// How a queue binds to its transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BindMode {
    /// Zero-copy if the transport supports it, copy otherwise
    #[default]
    Auto,
    /// Require zero-copy; binding fails if the transport cannot do it
    ZeroCopy,
    /// Always copy between the wire and the UMEM
    Copy,
}

impl BindMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindMode::Auto => "auto",
            BindMode::ZeroCopy => "zero-copy",
            BindMode::Copy => "copy",
        }
    }
}

impl std::str::FromStr for BindMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(BindMode::Auto),
            "zero-copy" => Ok(BindMode::ZeroCopy),
            "copy" => Ok(BindMode::Copy),
            _ => Err(()),
        }
    }
}

/// What the engine does with a packet the classifier allowed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AllowAction {
    /// Release the frame and let the packet continue on the normal stack
    #[default]
    Pass,
    /// Put the frame straight onto the TX ring
    Transmit,
}

impl AllowAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllowAction::Pass => "pass",
            AllowAction::Transmit => "transmit",
        }
    }
}

impl std::str::FromStr for AllowAction {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pass" => Ok(AllowAction::Pass),
            "transmit" => Ok(AllowAction::Transmit),
            _ => Err(()),
        }
    }
}

/// Per-queue engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub frame_size: u32,
    pub frame_count: u32,
    /// Size of each of the Fill, RX, TX and Completion rings
    pub ring_size: u32,
    pub batch_size: u32,
    pub poll_timeout_ms: u64,
    /// Kick the transport after publishing Fill/TX entries
    pub wakeup: bool,
    pub bind_mode: BindMode,
    pub use_hugepages: bool,
    pub max_consecutive_faults: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            frame_count: DEFAULT_FRAME_COUNT,
            ring_size: DEFAULT_RING_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            wakeup: true,
            bind_mode: BindMode::Auto,
            use_hugepages: true,
            max_consecutive_faults: DEFAULT_MAX_CONSECUTIVE_FAULTS,
        }
    }
}

impl EngineConfig {
    pub fn with_frame_size(mut self, frame_size: u32) -> Self {
        self.frame_size = frame_size;
        self
    }

    pub fn with_frame_count(mut self, frame_count: u32) -> Self {
        self.frame_count = frame_count;
        self
    }

    pub fn with_ring_size(mut self, ring_size: u32) -> Self {
        self.ring_size = ring_size;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_wakeup(mut self, wakeup: bool) -> Self {
        self.wakeup = wakeup;
        self
    }

    pub fn with_bind_mode(mut self, bind_mode: BindMode) -> Self {
        self.bind_mode = bind_mode;
        self
    }

    pub fn with_hugepages(mut self, use_hugepages: bool) -> Self {
        self.use_hugepages = use_hugepages;
        self
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Number of frames kept posted on the Fill ring.
    ///
    /// Half of the pool stays free for `send_packet`.
    pub fn fill_target(&self) -> u32 {
        self.ring_size.min(self.frame_count / 2)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.frame_size.is_power_of_two()
            || !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&self.frame_size)
        {
            return Err(ConfigError::InvalidSetting {
                name: "frame_size",
                reason: format!(
                    "{} is not a power of two in {MIN_FRAME_SIZE}..={MAX_FRAME_SIZE}",
                    self.frame_size
                ),
            });
        }
        if self.frame_count == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "frame_count",
                reason: "must be at least 1".to_string(),
            });
        }
        if !self.ring_size.is_power_of_two() || self.ring_size > 1 << 30 {
            return Err(ConfigError::InvalidSetting {
                name: "ring_size",
                reason: format!("{} is not a power of two", self.ring_size),
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "batch_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_consecutive_faults == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "max_consecutive_faults",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Connection tracking settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnTrackConfig {
    pub max_connections: usize,
    /// Lock stripes; must be a power of two
    pub shards: usize,
    pub tcp_timeout_secs: u64,
    pub udp_timeout_secs: u64,
    pub default_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for ConnTrackConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            shards: 16,
            tcp_timeout_secs: 300,
            udp_timeout_secs: 30,
            default_timeout_secs: 60,
            sweep_interval_secs: 30,
        }
    }
}

impl ConnTrackConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.shards.is_power_of_two() {
            return Err(ConfigError::InvalidSetting {
                name: "conntrack.shards",
                reason: format!("{} is not a power of two", self.shards),
            });
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "conntrack.sweep_interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Top-level fast path settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FastPathConfig {
    pub engine: EngineConfig,
    pub conntrack: ConnTrackConfig,
    pub queues_per_interface: u32,
    /// Mappings examined per packet, in table order
    pub scan_limit: usize,
    pub max_services: usize,
    pub max_mappings: usize,
    pub slow_path_queue_depth: usize,
    pub allow_action: AllowAction,
    pub stats_interval_ms: u64,
}

impl Default for FastPathConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            conntrack: ConnTrackConfig::default(),
            queues_per_interface: 1,
            scan_limit: DEFAULT_SCAN_LIMIT,
            max_services: DEFAULT_MAX_SERVICES,
            max_mappings: DEFAULT_MAX_MAPPINGS,
            slow_path_queue_depth: 1024,
            allow_action: AllowAction::Pass,
            stats_interval_ms: 1000,
        }
    }
}

impl FastPathConfig {
    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_queues_per_interface(mut self, queues: u32) -> Self {
        self.queues_per_interface = queues;
        self
    }

    pub fn with_scan_limit(mut self, scan_limit: usize) -> Self {
        self.scan_limit = scan_limit;
        self
    }

    pub fn with_allow_action(mut self, action: AllowAction) -> Self {
        self.allow_action = action;
        self
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        self.conntrack.validate()?;
        if self.queues_per_interface == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "queues_per_interface",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.scan_limit == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "scan_limit",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.slow_path_queue_depth == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "slow_path_queue_depth",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.stats_interval_ms == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "stats_interval_ms",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_mode_roundtrip() {
        for mode in [BindMode::Auto, BindMode::ZeroCopy, BindMode::Copy] {
            let parsed: BindMode = mode.as_str().parse().unwrap();
            assert_eq!(mode, parsed);
        }
        assert!("turbo".parse::<BindMode>().is_err());
    }

    #[test]
    fn test_allow_action_roundtrip() {
        for action in [AllowAction::Pass, AllowAction::Transmit] {
            let parsed: AllowAction = action.as_str().parse().unwrap();
            assert_eq!(action, parsed);
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = FastPathConfig::default();
        config.validate().unwrap();
        assert_eq!(config.engine.frame_count, 4096);
        assert_eq!(config.engine.frame_size, 2048);
        assert_eq!(config.engine.batch_size, 64);
        assert_eq!(config.scan_limit, 32);
        assert_eq!(config.engine.poll_timeout(), Duration::from_millis(1));
    }

    #[test]
    fn test_fill_target_leaves_half_for_tx() {
        let engine = EngineConfig::default().with_frame_count(4);
        assert_eq!(engine.fill_target(), 2);

        let engine = EngineConfig::default().with_ring_size(64);
        assert_eq!(engine.fill_target(), 64);
    }

    #[test]
    fn test_rejects_bad_ring_size() {
        let engine = EngineConfig::default().with_ring_size(1000);
        let err = engine.validate().unwrap_err();
        assert!(err.to_string().contains("ring_size"));
    }

    #[test]
    fn test_rejects_bad_frame_size() {
        assert!(EngineConfig::default().with_frame_size(3000).validate().is_err());
        assert!(EngineConfig::default().with_frame_size(1024).validate().is_err());
        assert!(EngineConfig::default().with_frame_size(4096).validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: FastPathConfig =
            serde_json::from_str(r#"{"scan_limit": 64, "engine": {"wakeup": false}}"#).unwrap();
        assert_eq!(config.scan_limit, 64);
        assert!(!config.engine.wakeup);
        assert_eq!(config.engine.frame_count, DEFAULT_FRAME_COUNT);
        assert_eq!(config.conntrack.udp_timeout_secs, 30);
    }

    #[test]
    fn test_bind_mode_serde_names() {
        let mode: BindMode = serde_json::from_str(r#""zero-copy""#).unwrap();
        assert_eq!(mode, BindMode::ZeroCopy);
    }
}
