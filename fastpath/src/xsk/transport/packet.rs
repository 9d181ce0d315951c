//! AF_PACKET transport.
//!
//! Binds a raw packet socket to the interface and receives straight into
//! UMEM frames taken off the Fill ring. Multiple queues on one interface
//! share the load through a `PACKET_FANOUT` hash group. Copy mode only.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, trace};

use super::{
    Binding, RxSide, Transport, TransportContext, TransportFactory, TransportRings, TxSide,
};
use crate::config::BindMode;
use crate::lock;
use crate::stats::bump;

const PACKET_FANOUT: libc::c_int = 18;
const PACKET_FANOUT_HASH: u32 = 0;
const PACKET_OUTGOING: u8 = 4;

/// Opens [`PacketTransport`]s on host interfaces
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketSocketFactory;

impl TransportFactory for PacketSocketFactory {
    fn open(
        &self,
        binding: &Binding,
        rings: TransportRings,
        ctx: TransportContext,
    ) -> io::Result<Arc<dyn Transport>> {
        Ok(Arc::new(PacketTransport::open(binding, rings, ctx)?))
    }
}

pub struct PacketTransport {
    label: String,
    socket: Socket,
    rx: Mutex<Option<RxSide>>,
    tx: Mutex<Option<TxSide>>,
}

impl PacketTransport {
    pub fn open(binding: &Binding, rings: TransportRings, ctx: TransportContext) -> io::Result<Self> {
        if binding.bind_mode == BindMode::ZeroCopy {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "AF_PACKET binding only supports copy mode",
            ));
        }

        let if_index = if_index(&binding.interface)?;
        let protocol = (libc::ETH_P_ALL as u16).to_be();
        let socket = Socket::new(
            Domain::PACKET,
            Type::RAW,
            Some(Protocol::from(protocol as libc::c_int)),
        )?;
        socket.set_nonblocking(true)?;

        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = protocol;
        addr.sll_ifindex = if_index as i32;

        let ret = unsafe {
            libc::bind(
                socket.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        if binding.queue_count > 1 {
            join_fanout(socket.as_raw_fd(), if_index)?;
        }

        info!(
            binding = %binding,
            if_index,
            queues = binding.queue_count,
            "AF_PACKET socket bound"
        );

        Ok(Self {
            label: binding.to_string(),
            socket,
            rx: Mutex::new(Some(RxSide::new(rings.fill, rings.rx, ctx.clone()))),
            tx: Mutex::new(Some(TxSide::new(rings.tx, rings.completion, ctx))),
        })
    }

    fn readable(&self, timeout: Duration) -> io::Result<bool> {
        let ms = timeout.as_millis().min(u16::MAX as u128) as u16;
        let poll_fd = PollFd::new(self.socket.as_fd(), PollFlags::POLLIN);
        match poll(&mut [poll_fd], PollTimeout::from(ms)) {
            Ok(n) => Ok(n > 0),
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl Transport for PacketTransport {
    fn wait(&self, timeout: Duration) -> io::Result<bool> {
        self.kick()?;

        let mut guard = lock(&self.rx);
        let Some(side) = guard.as_mut() else {
            return Ok(false);
        };
        let timeout = if side.pending() { Duration::ZERO } else { timeout };
        if !self.readable(timeout)? {
            return Ok(side.pending());
        }

        let fd = self.socket.as_raw_fd();
        let frame_size = side.ctx.umem.frame_size() as usize;
        let mut received = 0;
        while received < side.capacity() {
            let Some(addr) = side.next_frame() else {
                break;
            };
            let buf = side.buffer(addr);
            let (len, pkttype) = match recv_frame(fd, buf) {
                Ok(Some(r)) => r,
                Ok(None) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if pkttype == PACKET_OUTGOING {
                continue;
            }
            if len > frame_size {
                bump(&side.ctx.counters.rx_invalid);
                continue;
            }
            side.commit(addr, len);
            received += 1;
        }
        trace!(transport = %self.label, received, "Frames received");
        Ok(side.pending())
    }

    fn kick(&self) -> io::Result<()> {
        let mut guard = lock(&self.tx);
        let Some(side) = guard.as_mut() else {
            return Ok(());
        };
        let fd = self.socket.as_raw_fd();
        side.transmit(|frame| {
            let ret = unsafe {
                libc::send(
                    fd,
                    frame.as_ptr() as *const libc::c_void,
                    frame.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    return Ok(false);
                }
                return Err(err);
            }
            Ok(true)
        })?;
        Ok(())
    }

    fn close(&self) {
        lock(&self.rx).take();
        lock(&self.tx).take();
        debug!(transport = %self.label, "AF_PACKET transport closed");
    }
}

fn if_index(name: &str) -> io::Result<u32> {
    let c_name = CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name contains NUL"))?;
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no such interface: {name}"),
        ));
    }
    Ok(index)
}

fn join_fanout(fd: RawFd, if_index: u32) -> io::Result<()> {
    // Group id is 16 bits; one group per interface
    let arg: u32 = (if_index & 0xffff) | (PACKET_FANOUT_HASH << 16);
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_PACKET,
            PACKET_FANOUT,
            &arg as *const u32 as *const libc::c_void,
            std::mem::size_of::<u32>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Receive one frame. Returns the full on-wire length (which may exceed
/// `buf`) and the packet type, or `None` if nothing is queued.
fn recv_frame(fd: RawFd, buf: &mut [u8]) -> io::Result<Option<(usize, u8)>> {
    let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    let mut addr_len = std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
    let ret = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT | libc::MSG_TRUNC,
            &mut addr as *mut libc::sockaddr_ll as *mut libc::sockaddr,
            &mut addr_len,
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }
    Ok(Some((ret as usize, addr.sll_pkttype)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_interface_is_not_found() {
        let err = if_index("fp-does-not-exist0").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_interface_name_with_nul() {
        let err = if_index("eth\0").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_loopback_index() {
        assert!(if_index("lo").unwrap() > 0);
    }
}
