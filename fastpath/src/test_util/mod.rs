//! Test utilities: frame builders and rule fixtures.

pub mod packets;

use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::rules::{Mapping, ProtocolMask, RuleSet, Service};

pub use packets::{
    arp_request, icmp_echo_frame, raw_ipv4_frame, tcp_frame, udp_frame, with_ip_version,
};

pub const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
pub const SERVICE_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

/// One HTTP service behind one TCP/80 mapping
pub fn http_rules(auth_required: bool) -> (Vec<Service>, Vec<Mapping>) {
    let services = vec![Service::new(1, SERVICE_IP, 80)];
    let mappings = vec![
        Mapping::new(1, ProtocolMask::TCP)
            .with_dests(vec![1])
            .with_ports(vec![80])
            .with_auth_required(auth_required),
    ];
    (services, mappings)
}

/// Write a rule set as JSON into `dir`, returning the file path.
pub fn write_rule_file(
    dir: &Path,
    services: Vec<Service>,
    mappings: Vec<Mapping>,
) -> io::Result<PathBuf> {
    let path = dir.join("rules.json");
    let json = serde_json::to_string_pretty(&RuleSet { services, mappings })
        .map_err(io::Error::other)?;
    std::fs::write(&path, json)?;
    Ok(path)
}
