use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;

use bytes::Bytes;

use crate::packet::DatagramWriter;

/// Opaque handle for a port managed by the event loop.
///
/// Encodes the port slot index and generation for stale detection. Valid
/// from the `add_*` call that returned it until `remove_port` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl PortHandle {
    /// Returns the port slot index. Useful for indexing into per-port arrays.
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// Role of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PortKind {
    Receiver,
    Sender,
}

/// Lifecycle of an installed port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    /// Bound and registered; I/O armed.
    Open,
    /// Async close in progress; waiting for in-flight CQEs to drain.
    Closing,
}

/// Per-port I/O state owned by the loop thread.
///
/// The msghdr/iovec/sockaddr blocks are individually boxed so their addresses
/// stay stable while SQEs referencing them are in flight.
pub(crate) struct PortIo {
    pub kind: PortKind,
    pub lifecycle: Lifecycle,
    pub local_addr: SocketAddr,
    /// Sink for inbound datagrams (receivers only).
    pub writer: Option<Arc<dyn DatagramWriter>>,
    // ── Recv state ──
    pub recv_buf: Box<[u8]>,
    pub recv_addr: Box<libc::sockaddr_storage>,
    pub recv_iov: Box<libc::iovec>,
    pub recv_msghdr: Box<libc::msghdr>,
    pub recv_armed: bool,
    // ── Send state ──
    pub send_addr: Box<libc::sockaddr_storage>,
    pub send_iov: Box<libc::iovec>,
    pub send_msghdr: Box<libc::msghdr>,
    pub send_in_flight: bool,
    /// Payload of the in-flight sendmsg; keeps the bytes alive until the CQE.
    pub current_send: Option<Bytes>,
    /// Outbound datagrams queued behind the in-flight send.
    pub send_queue: VecDeque<(SocketAddr, Bytes)>,
    /// In-flight SQEs referencing this slot (recvmsg, sendmsg, close).
    /// A closing port is recycled once this reaches zero.
    pub inflight_ops: u32,
}

impl PortIo {
    pub(crate) fn new(
        kind: PortKind,
        local_addr: SocketAddr,
        writer: Option<Arc<dyn DatagramWriter>>,
        recv_buffer_size: usize,
    ) -> PortIo {
        let recv_buf = vec![0u8; recv_buffer_size].into_boxed_slice();
        let mut recv_addr: Box<libc::sockaddr_storage> = Box::new(unsafe { std::mem::zeroed() });
        let mut recv_iov = Box::new(libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        });
        let mut recv_msghdr: Box<libc::msghdr> = Box::new(unsafe { std::mem::zeroed() });

        recv_iov.iov_base = recv_buf.as_ptr() as *mut libc::c_void;
        recv_iov.iov_len = recv_buf.len();
        recv_msghdr.msg_name = &mut *recv_addr as *mut _ as *mut libc::c_void;
        recv_msghdr.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as u32;
        recv_msghdr.msg_iov = &mut *recv_iov as *mut libc::iovec;
        recv_msghdr.msg_iovlen = 1;

        let mut send_addr: Box<libc::sockaddr_storage> = Box::new(unsafe { std::mem::zeroed() });
        let mut send_iov = Box::new(libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        });
        let mut send_msghdr: Box<libc::msghdr> = Box::new(unsafe { std::mem::zeroed() });

        send_msghdr.msg_name = &mut *send_addr as *mut _ as *mut libc::c_void;
        send_msghdr.msg_iov = &mut *send_iov as *mut libc::iovec;
        send_msghdr.msg_iovlen = 1;

        PortIo {
            kind,
            lifecycle: Lifecycle::Open,
            local_addr,
            writer,
            recv_buf,
            recv_addr,
            recv_iov,
            recv_msghdr,
            recv_armed: false,
            send_addr,
            send_iov,
            send_msghdr,
            send_in_flight: false,
            current_send: None,
            send_queue: VecDeque::new(),
            inflight_ops: 0,
        }
    }

    /// Reset msg_namelen before re-submitting recvmsg.
    pub fn reset_recv_namelen(&mut self) {
        self.recv_msghdr.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as u32;
    }
}

struct PortSlot {
    active: bool,
    generation: u32,
    io: Option<PortIo>,
}

/// Manages port slots with a free list for O(1) allocation.
///
/// Slot indices double as fixed file table indices.
pub(crate) struct PortTable {
    slots: Vec<PortSlot>,
    free_list: Vec<u32>,
}

impl PortTable {
    pub fn new(max_ports: u32) -> Self {
        let mut slots = Vec::with_capacity(max_ports as usize);
        for _ in 0..max_ports {
            slots.push(PortSlot {
                active: false,
                generation: 0,
                io: None,
            });
        }
        // Free list: indices in reverse order so pop gives lowest first.
        let free_list: Vec<u32> = (0..max_ports).rev().collect();
        PortTable { slots, free_list }
    }

    /// Allocate a port slot. The slot has no I/O state until `install`.
    pub fn allocate(&mut self) -> Option<u32> {
        let idx = self.free_list.pop()?;
        self.slots[idx as usize].active = true;
        Some(idx)
    }

    /// Install the I/O state for an allocated slot.
    pub fn install(&mut self, idx: u32, io: PortIo) {
        self.slots[idx as usize].io = Some(io);
    }

    /// Release a port slot back to the free list and bump its generation.
    pub fn release(&mut self, idx: u32) {
        let Some(slot) = self.slots.get_mut(idx as usize) else {
            return;
        };
        if !slot.active {
            return; // already released — avoid double-push to free list
        }
        slot.active = false;
        slot.io = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(idx);
    }

    pub fn get_io(&self, idx: u32) -> Option<&PortIo> {
        self.slots
            .get(idx as usize)
            .filter(|s| s.active)
            .and_then(|s| s.io.as_ref())
    }

    pub fn get_io_mut(&mut self, idx: u32) -> Option<&mut PortIo> {
        self.slots
            .get_mut(idx as usize)
            .filter(|s| s.active)
            .and_then(|s| s.io.as_mut())
    }

    /// Get the generation for a slot (valid even if inactive).
    pub fn generation(&self, idx: u32) -> u32 {
        self.slots[idx as usize].generation
    }

    /// Number of active port slots, including ones still closing.
    pub fn active_count(&self) -> usize {
        self.slots.len().saturating_sub(self.free_list.len())
    }
}

/// Create a non-blocking UDP socket bound at `bind_addr`.
/// Returns the raw fd and the actually bound address (ephemeral port resolved).
pub(crate) fn open_udp_socket(
    bind_addr: SocketAddr,
    broadcast: bool,
) -> io::Result<(RawFd, SocketAddr)> {
    let domain = if bind_addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };

    let fd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    if broadcast {
        let optval: libc::c_int = 1;
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_BROADCAST,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
            }
            return Err(err);
        }
    }

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let addr_len = socket_addr_to_sockaddr(bind_addr, &mut storage);
    let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, addr_len) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(err);
    }

    match local_addr_of(fd) {
        Ok(local_addr) => Ok((fd, local_addr)),
        Err(err) => {
            unsafe {
                libc::close(fd);
            }
            Err(err)
        }
    }
}

/// Read back the bound address of a socket.
fn local_addr_of(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    sockaddr_to_socket_addr(&storage, len)
        .ok_or_else(|| io::Error::other("unsupported socket address family"))
}

/// Convert a libc sockaddr_storage to a std SocketAddr.
pub(crate) fn sockaddr_to_socket_addr(
    addr: &libc::sockaddr_storage,
    len: u32,
) -> Option<SocketAddr> {
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
    match addr.ss_family as libc::c_int {
        libc::AF_INET if len >= std::mem::size_of::<libc::sockaddr_in>() as u32 => {
            let sa = unsafe { &*(addr as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            let port = u16::from_be(sa.sin_port);
            Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 if len >= std::mem::size_of::<libc::sockaddr_in6>() as u32 => {
            let sa = unsafe { &*(addr as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sa.sin6_addr.s6_addr);
            let port = u16::from_be(sa.sin6_port);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                sa.sin6_flowinfo,
                sa.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Write a SocketAddr into a sockaddr_storage, return the address length.
pub(crate) fn socket_addr_to_sockaddr(
    addr: SocketAddr,
    storage: &mut libc::sockaddr_storage,
) -> u32 {
    // Zero the storage to avoid uninitialised padding bytes.
    unsafe {
        std::ptr::write_bytes(
            storage as *mut _ as *mut u8,
            0,
            std::mem::size_of::<libc::sockaddr_storage>(),
        );
    }
    match addr {
        SocketAddr::V4(v4) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            std::mem::size_of::<libc::sockaddr_in>() as u32
        }
        SocketAddr::V6(v6) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            std::mem::size_of::<libc::sockaddr_in6>() as u32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_round_trip_v4() {
        let addr: SocketAddr = "192.0.2.7:8080".parse().unwrap();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let len = socket_addr_to_sockaddr(addr, &mut storage);
        assert_eq!(sockaddr_to_socket_addr(&storage, len), Some(addr));
    }

    #[test]
    fn sockaddr_round_trip_v6() {
        let addr: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let len = socket_addr_to_sockaddr(addr, &mut storage);
        assert_eq!(sockaddr_to_socket_addr(&storage, len), Some(addr));
    }

    #[test]
    fn table_allocates_lowest_first() {
        let mut table = PortTable::new(4);
        assert_eq!(table.allocate(), Some(0));
        assert_eq!(table.allocate(), Some(1));
        assert_eq!(table.active_count(), 2);
    }

    #[test]
    fn release_bumps_generation() {
        let mut table = PortTable::new(2);
        let idx = table.allocate().unwrap();
        let generation = table.generation(idx);
        table.release(idx);
        assert_eq!(table.generation(idx), generation.wrapping_add(1));
        assert_eq!(table.active_count(), 0);
    }

    #[test]
    fn double_release_is_harmless() {
        let mut table = PortTable::new(2);
        let idx = table.allocate().unwrap();
        table.release(idx);
        table.release(idx);
        assert_eq!(table.active_count(), 0);
        // Both slots are still allocatable exactly once.
        assert!(table.allocate().is_some());
        assert!(table.allocate().is_some());
        assert!(table.allocate().is_none());
    }
}
