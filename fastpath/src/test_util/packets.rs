//! Frame builders for classifier and engine tests
//!
//! Uses smoltcp for packet construction, matching what the classifier parses.

use std::net::Ipv4Addr;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
    EthernetRepr, Icmpv4Packet, Icmpv4Repr, IpProtocol, Ipv4Packet, Ipv4Repr,
    TcpPacket, UdpPacket, UdpRepr,
};

/// Ethernet header size
pub const ETHERNET_HDR_SIZE: usize = 14;

/// IP header size (without options)
pub const IP_HDR_SIZE: usize = 20;

/// TCP header size (without options)
pub const TCP_HDR_SIZE: usize = 20;

/// UDP header size
pub const UDP_HDR_SIZE: usize = 8;

pub const CLIENT_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
pub const SERVER_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];
pub const BROADCAST_MAC: [u8; 6] = [0xff; 6];

/// Ethernet + IPv4 header around a transport payload of `l4_len` bytes.
/// Returns the frame and the IPv4 header repr.
fn ipv4_frame(src: Ipv4Addr, dst: Ipv4Addr, protocol: IpProtocol, l4_len: usize) -> (Vec<u8>, Ipv4Repr) {
    let mut packet = vec![0u8; ETHERNET_HDR_SIZE + IP_HDR_SIZE + l4_len];

    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(CLIENT_MAC),
        dst_addr: EthernetAddress(SERVER_MAC),
        ethertype: EthernetProtocol::Ipv4,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(&mut packet[..]);
    eth_repr.emit(&mut eth_frame);

    let ip_repr = Ipv4Repr {
        src_addr: src,
        dst_addr: dst,
        next_header: protocol,
        payload_len: l4_len,
        hop_limit: 64,
    };
    let mut ip_packet = Ipv4Packet::new_unchecked(eth_frame.payload_mut());
    ip_repr.emit(&mut ip_packet, &ChecksumCapabilities::default());

    (packet, ip_repr)
}

fn l4_mut(packet: &mut [u8]) -> &mut [u8] {
    &mut packet[ETHERNET_HDR_SIZE + IP_HDR_SIZE..]
}

/// TCP SYN-ish segment carrying `payload`
pub fn tcp_frame(
    src: Ipv4Addr,
    src_port: u16,
    dst: Ipv4Addr,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let (mut packet, _) = ipv4_frame(src, dst, IpProtocol::Tcp, TCP_HDR_SIZE + payload.len());

    let mut tcp = TcpPacket::new_unchecked(l4_mut(&mut packet));
    tcp.set_src_port(src_port);
    tcp.set_dst_port(dst_port);
    tcp.set_header_len(TCP_HDR_SIZE as u8);
    tcp.set_syn(true);
    tcp.set_window_len(64240);
    tcp.payload_mut().copy_from_slice(payload);

    packet
}

pub fn udp_frame(
    src: Ipv4Addr,
    src_port: u16,
    dst: Ipv4Addr,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let (mut packet, ip_repr) =
        ipv4_frame(src, dst, IpProtocol::Udp, UDP_HDR_SIZE + payload.len());

    let udp_repr = UdpRepr { src_port, dst_port };
    let mut udp_packet = UdpPacket::new_unchecked(l4_mut(&mut packet));
    udp_repr.emit(
        &mut udp_packet,
        &ip_repr.src_addr.into(),
        &ip_repr.dst_addr.into(),
        payload.len(),
        |buf| buf.copy_from_slice(payload),
        &ChecksumCapabilities::default(),
    );

    packet
}

pub fn icmp_echo_frame(src: Ipv4Addr, dst: Ipv4Addr, ident: u16, seq_no: u16) -> Vec<u8> {
    let data = b"fastpath ping";
    let icmp_repr = Icmpv4Repr::EchoRequest {
        ident,
        seq_no,
        data,
    };
    let (mut packet, _) = ipv4_frame(src, dst, IpProtocol::Icmp, icmp_repr.buffer_len());

    let mut icmp_packet = Icmpv4Packet::new_unchecked(l4_mut(&mut packet));
    icmp_repr.emit(&mut icmp_packet, &ChecksumCapabilities::default());

    packet
}

/// IPv4 packet with an arbitrary protocol number and opaque payload
pub fn raw_ipv4_frame(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> Vec<u8> {
    let (mut packet, _) = ipv4_frame(src, dst, IpProtocol::from(protocol), payload.len());
    l4_mut(&mut packet).copy_from_slice(payload);
    packet
}

/// ARP who-has, a non-IP frame
pub fn arp_request(sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    let arp_repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: EthernetAddress(CLIENT_MAC),
        source_protocol_addr: sender_ip,
        target_hardware_addr: EthernetAddress([0; 6]),
        target_protocol_addr: target_ip,
    };

    let mut packet = vec![0u8; ETHERNET_HDR_SIZE + arp_repr.buffer_len()];
    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(CLIENT_MAC),
        dst_addr: EthernetAddress(BROADCAST_MAC),
        ethertype: EthernetProtocol::Arp,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(&mut packet[..]);
    eth_repr.emit(&mut eth_frame);

    let mut arp_packet = ArpPacket::new_unchecked(eth_frame.payload_mut());
    arp_repr.emit(&mut arp_packet);

    packet
}

/// Overwrite the IP version nibble, keeping the header length.
pub fn with_ip_version(mut packet: Vec<u8>, version: u8) -> Vec<u8> {
    let byte = &mut packet[ETHERNET_HDR_SIZE];
    *byte = (version << 4) | (*byte & 0x0f);
    packet
}
