//! Error types for the fast path.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Rejection of a configuration or rule update.
///
/// The offending id is always part of the message so the control plane can
/// point at the record that broke the update.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate service id {0}")]
    DuplicateService(u32),

    #[error("duplicate mapping id {0}")]
    DuplicateMapping(u32),

    #[error("mapping {id}: {field} has {len} entries (max {max})")]
    TooManyEntries {
        id: u32,
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("mapping {0}: protocol mask is empty")]
    EmptyProtocolMask(u32),

    #[error("mapping {id}: unknown protocol bits {bits:#04x}")]
    UnknownProtocolBits { id: u32, bits: u8 },

    #[error("{count} services exceed the table limit of {max}")]
    TooManyServices { count: usize, max: usize },

    #[error("{count} mappings exceed the table limit of {max}")]
    TooManyMappings { count: usize, max: usize },

    #[error("fast path already loaded")]
    AlreadyLoaded,

    #[error("invalid setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },

    #[error("failed to parse rule set: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors surfaced by the fast path.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),

    #[error("{context}: {source}")]
    Resource {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("rule artifact not found: {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("frame pool exhausted")]
    Exhausted,

    #[error("packet of {len} bytes exceeds frame size {frame_size}")]
    PacketTooLarge { len: usize, frame_size: u32 },

    #[error("tx ring full")]
    TxRingFull,

    #[error("interface {0} is already attached")]
    AlreadyAttached(String),

    #[error("fast path is not loaded")]
    NotLoaded,

    #[error("engine already started")]
    AlreadyStarted,

    #[error("engine is stopped")]
    EngineStopped,
}

impl Error {
    pub fn resource(context: impl Into<String>, source: io::Error) -> Self {
        Error::Resource {
            context: context.into(),
            source,
        }
    }

    /// True for errors that clear up once frames are returned to the pool.
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Error::Exhausted | Error::TxRingFull)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
