//! Services, mappings and the compiled rule table.
//!
//! The control plane pushes [`Service`] and [`Mapping`] records. The
//! [`RuleCompiler`] validates them and produces an immutable [`RuleTable`]
//! that the classifier reads through an atomic pointer swap. A table is
//! never mutated after compilation; every update builds a new one.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::ops::BitOr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::FastPathConfig;
use crate::error::{ConfigError, Error, Result};

/// Maximum entries in each of a mapping's id and port lists
pub const MAX_MAPPING_ENTRIES: usize = 16;

/// Transport protocols a mapping can select
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    /// Bit in a [`ProtocolMask`]
    pub fn mask_bit(self) -> u8 {
        match self {
            Protocol::Tcp => 1,
            Protocol::Udp => 2,
            Protocol::Icmp => 4,
        }
    }

    /// IPv4 protocol number
    pub fn ip_number(self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
            Protocol::Icmp => 1,
        }
    }

    pub fn from_ip_number(number: u8) -> Option<Self> {
        match number {
            6 => Some(Protocol::Tcp),
            17 => Some(Protocol::Udp),
            1 => Some(Protocol::Icmp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "icmp" => Ok(Protocol::Icmp),
            _ => Err(()),
        }
    }
}

/// Protocol bitmask: TCP=1, UDP=2, ICMP=4.
///
/// Serialized as a list of protocol names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Protocol>", into = "Vec<Protocol>")]
pub struct ProtocolMask(u8);

impl ProtocolMask {
    pub const TCP: ProtocolMask = ProtocolMask(1);
    pub const UDP: ProtocolMask = ProtocolMask(2);
    pub const ICMP: ProtocolMask = ProtocolMask(4);
    const KNOWN: u8 = 0b111;

    pub const fn from_bits(bits: u8) -> Self {
        ProtocolMask(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, protocol: Protocol) -> bool {
        self.0 & protocol.mask_bit() != 0
    }

    /// Bits outside TCP/UDP/ICMP
    pub fn unknown_bits(self) -> u8 {
        self.0 & !Self::KNOWN
    }

    pub fn protocols(self) -> Vec<Protocol> {
        [Protocol::Tcp, Protocol::Udp, Protocol::Icmp]
            .into_iter()
            .filter(|p| self.contains(*p))
            .collect()
    }
}

impl BitOr for ProtocolMask {
    type Output = ProtocolMask;

    fn bitor(self, rhs: Self) -> Self::Output {
        ProtocolMask(self.0 | rhs.0)
    }
}

impl From<Protocol> for ProtocolMask {
    fn from(protocol: Protocol) -> Self {
        ProtocolMask(protocol.mask_bit())
    }
}

impl From<Vec<Protocol>> for ProtocolMask {
    fn from(protocols: Vec<Protocol>) -> Self {
        protocols
            .into_iter()
            .fold(ProtocolMask::default(), |mask, p| mask | p.into())
    }
}

impl From<ProtocolMask> for Vec<Protocol> {
    fn from(mask: ProtocolMask) -> Self {
        mask.protocols()
    }
}

/// Authentication scheme the slow path applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum AuthType {
    #[default]
    None = 0,
    Base64 = 1,
    Jwt = 2,
}

/// A routable backend endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: u32,
    pub address: Ipv4Addr,
    pub port: u16,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub auth_type: AuthType,
    #[serde(default)]
    pub flags: u32,
}

impl Service {
    pub fn new(id: u32, address: Ipv4Addr, port: u16) -> Self {
        Self {
            id,
            address,
            port,
            auth_required: false,
            auth_type: AuthType::None,
            flags: 0,
        }
    }

    /// Require authentication with the given scheme
    pub fn with_auth(mut self, auth_type: AuthType) -> Self {
        self.auth_required = true;
        self.auth_type = auth_type;
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }
}

/// A traffic policy linking sources to destinations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub id: u32,
    #[serde(default)]
    pub source_services: Vec<u32>,
    #[serde(default)]
    pub dest_services: Vec<u32>,
    #[serde(default)]
    pub ports: Vec<u16>,
    pub protocols: ProtocolMask,
    #[serde(default)]
    pub auth_required: bool,
    /// Carried for the control plane; matching is first-match in table order
    #[serde(default)]
    pub priority: u8,
}

impl Mapping {
    pub fn new(id: u32, protocols: impl Into<ProtocolMask>) -> Self {
        Self {
            id,
            source_services: Vec::new(),
            dest_services: Vec::new(),
            ports: Vec::new(),
            protocols: protocols.into(),
            auth_required: false,
            priority: 0,
        }
    }

    pub fn with_sources(mut self, ids: impl Into<Vec<u32>>) -> Self {
        self.source_services = ids.into();
        self
    }

    pub fn with_dests(mut self, ids: impl Into<Vec<u32>>) -> Self {
        self.dest_services = ids.into();
        self
    }

    pub fn with_ports(mut self, ports: impl Into<Vec<u16>>) -> Self {
        self.ports = ports.into();
        self
    }

    pub fn with_auth_required(mut self, auth_required: bool) -> Self {
        self.auth_required = auth_required;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Protocol must be in the mask and the destination port in the port
    /// list. ICMP carries no ports and is looked up with port 0.
    pub fn matches(&self, protocol: Protocol, dst_port: u16) -> bool {
        self.protocols.contains(protocol) && self.ports.contains(&dst_port)
    }

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        for (field, len) in [
            ("source_services", self.source_services.len()),
            ("dest_services", self.dest_services.len()),
            ("ports", self.ports.len()),
        ] {
            if len > MAX_MAPPING_ENTRIES {
                return Err(ConfigError::TooManyEntries {
                    id: self.id,
                    field,
                    len,
                    max: MAX_MAPPING_ENTRIES,
                });
            }
        }
        if self.protocols.is_empty() {
            return Err(ConfigError::EmptyProtocolMask(self.id));
        }
        if self.protocols.unknown_bits() != 0 {
            return Err(ConfigError::UnknownProtocolBits {
                id: self.id,
                bits: self.protocols.unknown_bits(),
            });
        }
        Ok(())
    }
}

/// Rule artifact as stored on disk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub mappings: Vec<Mapping>,
}

impl RuleSet {
    pub fn from_json(json: &str) -> std::result::Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a rule set from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::MissingArtifact(path.to_path_buf())
            } else {
                Error::resource(format!("read {}", path.display()), e)
            }
        })?;
        Ok(Self::from_json(&json)?)
    }
}

/// Immutable compiled rules
#[derive(Debug, Clone)]
pub struct RuleTable {
    generation: u64,
    services: HashMap<u32, Service>,
    mappings: Vec<Mapping>,
    scan_limit: usize,
    auth_required_any: bool,
}

impl RuleTable {
    /// A table that matches nothing
    pub fn empty(scan_limit: usize) -> Self {
        Self {
            generation: 0,
            services: HashMap::new(),
            mappings: Vec::new(),
            scan_limit,
            auth_required_any: false,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn service(&self, id: u32) -> Option<&Service> {
        self.services.get(&id)
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    pub fn scan_limit(&self) -> usize {
        self.scan_limit
    }

    /// Mappings past the scan limit; they are never evaluated
    pub fn unscanned(&self) -> usize {
        self.mappings.len().saturating_sub(self.scan_limit)
    }

    /// True if any mapping in the table has its auth flag set
    pub fn requires_auth_anywhere(&self) -> bool {
        self.auth_required_any
    }

    /// First mapping within the scan limit that matches.
    pub fn lookup(&self, protocol: Protocol, dst_port: u16) -> Option<&Mapping> {
        self.mappings
            .iter()
            .take(self.scan_limit)
            .find(|m| m.matches(protocol, dst_port))
    }

    /// First destination of the mapping that resolves to a known service.
    pub fn dest_service(&self, mapping: &Mapping) -> Option<&Service> {
        mapping
            .dest_services
            .iter()
            .find_map(|id| self.services.get(id))
    }
}

/// Validates rule input and produces [`RuleTable`]s
#[derive(Debug)]
pub struct RuleCompiler {
    scan_limit: usize,
    max_services: usize,
    max_mappings: usize,
    generation: AtomicU64,
}

impl RuleCompiler {
    pub fn new(scan_limit: usize, max_services: usize, max_mappings: usize) -> Self {
        Self {
            scan_limit,
            max_services,
            max_mappings,
            generation: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &FastPathConfig) -> Self {
        Self::new(config.scan_limit, config.max_services, config.max_mappings)
    }

    pub fn scan_limit(&self) -> usize {
        self.scan_limit
    }

    /// Compile services and mappings into a new table.
    ///
    /// Either the whole input is accepted or nothing is; the error names
    /// the first offending id.
    pub fn compile(
        &self,
        services: &[Service],
        mappings: &[Mapping],
    ) -> std::result::Result<RuleTable, ConfigError> {
        if services.len() > self.max_services {
            return Err(ConfigError::TooManyServices {
                count: services.len(),
                max: self.max_services,
            });
        }
        if mappings.len() > self.max_mappings {
            return Err(ConfigError::TooManyMappings {
                count: mappings.len(),
                max: self.max_mappings,
            });
        }

        let mut table_services = HashMap::with_capacity(services.len());
        for service in services {
            if table_services
                .insert(service.id, service.clone())
                .is_some()
            {
                return Err(ConfigError::DuplicateService(service.id));
            }
        }

        let mut seen = HashSet::with_capacity(mappings.len());
        for mapping in mappings {
            if !seen.insert(mapping.id) {
                return Err(ConfigError::DuplicateMapping(mapping.id));
            }
            mapping.validate()?;
        }

        if mappings.len() > self.scan_limit {
            warn!(
                mappings = mappings.len(),
                scan_limit = self.scan_limit,
                unscanned = mappings.len() - self.scan_limit,
                "Rule set exceeds scan limit; trailing mappings are never evaluated and need an indexed lookup"
            );
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            generation,
            services = services.len(),
            mappings = mappings.len(),
            "Compiled rule table"
        );

        Ok(RuleTable {
            generation,
            services: table_services,
            mappings: mappings.to_vec(),
            scan_limit: self.scan_limit,
            auth_required_any: mappings.iter().any(|m| m.auth_required),
        })
    }
}
