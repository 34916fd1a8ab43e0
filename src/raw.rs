//! Low-level socket operations and platform abstractions
//!
//! This module provides the platform-specific socket operations the portable
//! layer cannot express through `mio` or the standard library: creating a
//! socket that is configured *before* it is bound (`SO_REUSEADDR` must
//! precede `bind`), splitting bind from listen, reading back a bound local
//! address from a raw descriptor, multicast group membership with an
//! explicit interface, truncation-aware datagram receive, and scatter/gather
//! datagram send.
//!
//! # Platform Support
//!
//! ## Unix (Linux, Android, BSD)
//! - POSIX socket APIs (`socket`, `bind`, `listen`, `recvmsg`, `sendmsg`)
//! - File-descriptor handles; datagram truncation via `MSG_TRUNC`
//!
//! ## Windows
//! - WinSock2 APIs with automatic WSA initialization
//! - SOCKET handles; truncation reported through `WSAEMSGSIZE`
//!
//! # Safety
//!
//! The `unsafe` code here is confined to raw system calls and to adopting
//! descriptors into owning standard-library types; every entry point is a
//! safe interface except the `*_from_os` adopters, whose callers must hand
//! over exclusive ownership of the descriptor.

use crate::endpoint::Endpoint;
use std::io;
use std::net::Ipv4Addr;

/// Socket type for protocol communication
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Type {
    /// TCP stream socket
    Stream,
    /// UDP datagram socket
    Dgram,
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use std::mem;
        use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
        pub type OsSocket = RawFd;

        fn sockaddr_of(ep: Endpoint) -> libc::sockaddr_in {
            let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
            sa.sin_family = libc::AF_INET as _;
            sa.sin_port = ep.port().to_be();
            sa.sin_addr = libc::in_addr { s_addr: u32::from(ep.address()).to_be() };
            sa
        }

        fn endpoint_of(sa: &libc::sockaddr_in) -> Endpoint {
            Endpoint::new(
                Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr)),
                u16::from_be(sa.sin_port),
            )
        }

        /// Create a new non-blocking IPv4 socket
        pub fn socket(ty: Type) -> io::Result<OsSocket> {
            let t = match ty { Type::Stream => libc::SOCK_STREAM, Type::Dgram => libc::SOCK_DGRAM };
            let fd = unsafe { libc::socket(libc::AF_INET, t | libc::SOCK_CLOEXEC, 0) };
            if fd < 0 { return Err(io::Error::last_os_error()); }
            set_nonblocking(fd, true)?;
            Ok(fd)
        }

        /// Set socket non-blocking mode
        pub fn set_nonblocking(os: OsSocket, on: bool) -> io::Result<()> {
            unsafe {
                let flags = libc::fcntl(os, libc::F_GETFL);
                if flags < 0 { return Err(io::Error::last_os_error()); }
                let nb = if on { flags | libc::O_NONBLOCK } else { flags & !libc::O_NONBLOCK };
                if libc::fcntl(os, libc::F_SETFL, nb) != 0 { return Err(io::Error::last_os_error()); }
                Ok(())
            }
        }

        /// Bind a socket to an endpoint
        pub fn bind_endpoint(os: OsSocket, ep: Endpoint) -> io::Result<()> {
            let sa = sockaddr_of(ep);
            let rc = unsafe {
                libc::bind(os, &sa as *const _ as *const libc::sockaddr,
                           mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
            };
            if rc != 0 { return Err(io::Error::last_os_error()); }
            Ok(())
        }

        /// Start listening on a bound socket with the given backlog
        pub fn listen_raw(os: OsSocket, backlog: i32) -> io::Result<()> {
            if unsafe { libc::listen(os, backlog) } != 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
        }

        /// Read back the locally bound endpoint of a raw descriptor
        pub fn local_endpoint(os: OsSocket) -> io::Result<Endpoint> {
            let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            let rc = unsafe {
                libc::getsockname(os, &mut sa as *mut _ as *mut libc::sockaddr, &mut len)
            };
            if rc != 0 { return Err(io::Error::last_os_error()); }
            Ok(endpoint_of(&sa))
        }

        fn setsockopt_int(fd: RawFd, level: i32, opt: i32, val: i32) -> io::Result<()> {
            let v = val as libc::c_int;
            let rc = unsafe {
                libc::setsockopt(fd, level, opt, &v as *const _ as _,
                                 mem::size_of::<libc::c_int>() as _)
            };
            if rc != 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
        }

        /// Allow address reuse; must be applied before bind
        pub fn set_reuse_addr(os: OsSocket, on: bool) -> io::Result<()> { setsockopt_int(os, libc::SOL_SOCKET, libc::SO_REUSEADDR, on as i32) }
        /// Set socket receive buffer size
        pub fn set_recv_buffer(os: OsSocket, sz: i32) -> io::Result<()> { setsockopt_int(os, libc::SOL_SOCKET, libc::SO_RCVBUF, sz) }
        /// Set socket send buffer size
        pub fn set_send_buffer(os: OsSocket, sz: i32) -> io::Result<()> { setsockopt_int(os, libc::SOL_SOCKET, libc::SO_SNDBUF, sz) }
        /// Disable TCP Nagle algorithm for low latency
        pub fn set_tcp_nodelay(os: OsSocket, on: bool) -> io::Result<()> { setsockopt_int(os, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as i32) }
        /// Set multicast time-to-live
        pub fn set_multicast_ttl(os: OsSocket, ttl: u32) -> io::Result<()> { setsockopt_int(os, libc::IPPROTO_IP, libc::IP_MULTICAST_TTL, ttl as i32) }
        /// Enable or disable local loopback of multicast sends
        pub fn set_multicast_loop(os: OsSocket, on: bool) -> io::Result<()> { setsockopt_int(os, libc::IPPROTO_IP, libc::IP_MULTICAST_LOOP, on as i32) }

        fn mreq_of(group: Ipv4Addr, iface: Ipv4Addr) -> libc::ip_mreq {
            libc::ip_mreq {
                imr_multiaddr: libc::in_addr { s_addr: u32::from(group).to_be() },
                imr_interface: libc::in_addr { s_addr: u32::from(iface).to_be() },
            }
        }

        fn membership(os: OsSocket, opt: i32, group: Ipv4Addr, iface: Ipv4Addr) -> io::Result<()> {
            let mreq = mreq_of(group, iface);
            let rc = unsafe {
                libc::setsockopt(os, libc::IPPROTO_IP, opt, &mreq as *const _ as _,
                                 mem::size_of::<libc::ip_mreq>() as _)
            };
            if rc != 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
        }

        /// Join a multicast group on the given local interface
        pub fn join_multicast(os: OsSocket, group: Ipv4Addr, iface: Ipv4Addr) -> io::Result<()> {
            membership(os, libc::IP_ADD_MEMBERSHIP, group, iface)
        }

        /// Leave a multicast group on the given local interface
        pub fn leave_multicast(os: OsSocket, group: Ipv4Addr, iface: Ipv4Addr) -> io::Result<()> {
            membership(os, libc::IP_DROP_MEMBERSHIP, group, iface)
        }

        /// Raw descriptor of any fd-backed socket
        pub fn os_socket<T: AsRawFd>(sock: &T) -> OsSocket { sock.as_raw_fd() }

        /// Receive one datagram, reporting the sender (when the OS supplied
        /// one) and whether the payload was truncated to fit `buf`.
        pub fn recv_from_trunc(
            sock: &mio::net::UdpSocket,
            buf: &mut [u8],
        ) -> io::Result<(usize, Option<Endpoint>, bool)> {
            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut iov = libc::iovec {
                iov_base: buf.as_mut_ptr() as *mut _,
                iov_len: buf.len(),
            };
            let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
            hdr.msg_name = &mut storage as *mut _ as *mut _;
            hdr.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            hdr.msg_iov = &mut iov;
            hdr.msg_iovlen = 1;

            let n = unsafe { libc::recvmsg(sock.as_raw_fd(), &mut hdr, 0) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            let truncated = hdr.msg_flags & libc::MSG_TRUNC != 0;
            let sender = if hdr.msg_namelen as usize >= mem::size_of::<libc::sockaddr_in>() {
                let sa = unsafe { &*(&storage as *const _ as *const libc::sockaddr_in) };
                if i32::from(sa.sin_family) == libc::AF_INET {
                    Some(endpoint_of(sa))
                } else {
                    None
                }
            } else {
                None
            };
            Ok((n as usize, sender, truncated))
        }

        /// Send one datagram assembled from several buffers
        pub fn send_to_vectored(
            sock: &mio::net::UdpSocket,
            bufs: &[Vec<u8>],
            to: Endpoint,
        ) -> io::Result<usize> {
            let mut sa = sockaddr_of(to);
            let mut iovs: Vec<libc::iovec> = bufs
                .iter()
                .map(|b| libc::iovec {
                    iov_base: b.as_ptr() as *mut _,
                    iov_len: b.len(),
                })
                .collect();
            let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
            hdr.msg_name = &mut sa as *mut _ as *mut _;
            hdr.msg_namelen = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            hdr.msg_iov = iovs.as_mut_ptr();
            hdr.msg_iovlen = iovs.len() as _;

            let n = unsafe { libc::sendmsg(sock.as_raw_fd(), &hdr, 0) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(n as usize)
        }

        /// Adopt an OS socket as a std UDP socket
        ///
        /// # Safety
        /// The caller transfers exclusive ownership of the descriptor.
        pub unsafe fn udp_from_os(fd: OsSocket) -> std::net::UdpSocket {
            unsafe { std::net::UdpSocket::from_raw_fd(fd) }
        }

        /// Adopt an OS socket as a std TCP listener
        ///
        /// # Safety
        /// The caller transfers exclusive ownership of the descriptor.
        pub unsafe fn tcp_listener_from_os(fd: OsSocket) -> std::net::TcpListener {
            unsafe { std::net::TcpListener::from_raw_fd(fd) }
        }

    } else {
        // Windows
        use std::mem;
        use std::sync::Once;
        use std::os::windows::io::{AsRawSocket, FromRawSocket, RawSocket};
        use windows_sys::Win32::Networking::WinSock::*;

        /// Windows socket handle type
        pub type OsSocket = RawSocket;

        static START: Once = Once::new();
        fn ensure_wsa() {
            START.call_once(|| unsafe {
                let mut data: WSADATA = mem::zeroed();
                let rc = WSAStartup(0x202, &mut data); // MAKEWORD(2,2)
                if rc != 0 { panic!("WSAStartup failed: {}", rc); }
            });
        }

        fn last_error() -> io::Error {
            io::Error::from_raw_os_error(unsafe { WSAGetLastError() })
        }

        fn sockaddr_of(ep: Endpoint) -> SOCKADDR_IN {
            let mut sa: SOCKADDR_IN = unsafe { mem::zeroed() };
            sa.sin_family = AF_INET as _;
            sa.sin_port = ep.port().to_be();
            sa.sin_addr = IN_ADDR { S_un: IN_ADDR_0 { S_addr: u32::from(ep.address()).to_be() } };
            sa
        }

        fn endpoint_of(sa: &SOCKADDR_IN) -> Endpoint {
            let raw = unsafe { sa.sin_addr.S_un.S_addr };
            Endpoint::new(Ipv4Addr::from(u32::from_be(raw)), u16::from_be(sa.sin_port))
        }

        /// Create a new non-blocking IPv4 socket
        pub fn socket(ty: Type) -> io::Result<OsSocket> {
            ensure_wsa();
            let t = match ty { Type::Stream => SOCK_STREAM, Type::Dgram => SOCK_DGRAM } as i32;
            let s = unsafe { WSASocketW(AF_INET as i32, t, 0, std::ptr::null_mut(), 0, WSA_FLAG_OVERLAPPED) };
            if s == INVALID_SOCKET { return Err(last_error()); }
            set_nonblocking(s as _, true)?;
            Ok(s as _)
        }

        /// Set socket non-blocking mode
        pub fn set_nonblocking(os: OsSocket, on: bool) -> io::Result<()> {
            ensure_wsa();
            let mut nb: u32 = if on { 1 } else { 0 };
            if unsafe { ioctlsocket(os as usize, FIONBIO, &mut nb) } != 0 { return Err(last_error()); }
            Ok(())
        }

        /// Bind a socket to an endpoint
        pub fn bind_endpoint(os: OsSocket, ep: Endpoint) -> io::Result<()> {
            let sa = sockaddr_of(ep);
            let rc = unsafe {
                bind(os as usize, &sa as *const _ as *const SOCKADDR, mem::size_of::<SOCKADDR_IN>() as i32)
            };
            if rc != 0 { return Err(last_error()); }
            Ok(())
        }

        /// Start listening on a bound socket with the given backlog
        pub fn listen_raw(os: OsSocket, backlog: i32) -> io::Result<()> {
            if unsafe { listen(os as usize, backlog) } != 0 { Err(last_error()) } else { Ok(()) }
        }

        /// Read back the locally bound endpoint of a raw descriptor
        pub fn local_endpoint(os: OsSocket) -> io::Result<Endpoint> {
            let mut sa: SOCKADDR_IN = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<SOCKADDR_IN>() as i32;
            let rc = unsafe { getsockname(os as usize, &mut sa as *mut _ as *mut SOCKADDR, &mut len) };
            if rc != 0 { return Err(last_error()); }
            Ok(endpoint_of(&sa))
        }

        fn setsockopt_int(os: OsSocket, level: i32, opt: i32, val: i32) -> io::Result<()> {
            unsafe {
                let rc = setsockopt(os as usize, level, opt, &val as *const _ as _, mem::size_of::<i32>() as _);
                if rc != 0 { Err(last_error()) } else { Ok(()) }
            }
        }

        /// Allow address reuse; must be applied before bind
        pub fn set_reuse_addr(os: OsSocket, on: bool) -> io::Result<()> { setsockopt_int(os, SOL_SOCKET as _, SO_REUSEADDR as _, on as i32) }
        /// Set socket receive buffer size
        pub fn set_recv_buffer(os: OsSocket, sz: i32) -> io::Result<()> { setsockopt_int(os, SOL_SOCKET as _, SO_RCVBUF as _, sz) }
        /// Set socket send buffer size
        pub fn set_send_buffer(os: OsSocket, sz: i32) -> io::Result<()> { setsockopt_int(os, SOL_SOCKET as _, SO_SNDBUF as _, sz) }
        /// Disable TCP Nagle algorithm for low latency
        pub fn set_tcp_nodelay(os: OsSocket, on: bool) -> io::Result<()> { setsockopt_int(os, IPPROTO_TCP as _, TCP_NODELAY as _, if on { 1 } else { 0 }) }
        /// Set multicast time-to-live
        pub fn set_multicast_ttl(os: OsSocket, ttl: u32) -> io::Result<()> { setsockopt_int(os, IPPROTO_IP as _, IP_MULTICAST_TTL as _, ttl as i32) }
        /// Enable or disable local loopback of multicast sends
        pub fn set_multicast_loop(os: OsSocket, on: bool) -> io::Result<()> { setsockopt_int(os, IPPROTO_IP as _, IP_MULTICAST_LOOP as _, if on { 1 } else { 0 }) }

        fn membership(os: OsSocket, opt: i32, group: Ipv4Addr, iface: Ipv4Addr) -> io::Result<()> {
            let mreq = IP_MREQ {
                imr_multiaddr: IN_ADDR { S_un: IN_ADDR_0 { S_addr: u32::from(group).to_be() } },
                imr_interface: IN_ADDR { S_un: IN_ADDR_0 { S_addr: u32::from(iface).to_be() } },
            };
            let rc = unsafe {
                setsockopt(os as usize, IPPROTO_IP as _, opt, &mreq as *const _ as _, mem::size_of::<IP_MREQ>() as _)
            };
            if rc != 0 { Err(last_error()) } else { Ok(()) }
        }

        /// Join a multicast group on the given local interface
        pub fn join_multicast(os: OsSocket, group: Ipv4Addr, iface: Ipv4Addr) -> io::Result<()> {
            membership(os, IP_ADD_MEMBERSHIP as _, group, iface)
        }

        /// Leave a multicast group on the given local interface
        pub fn leave_multicast(os: OsSocket, group: Ipv4Addr, iface: Ipv4Addr) -> io::Result<()> {
            membership(os, IP_DROP_MEMBERSHIP as _, group, iface)
        }

        /// Raw descriptor of any socket-backed handle
        pub fn os_socket<T: AsRawSocket>(sock: &T) -> OsSocket { sock.as_raw_socket() }

        /// Receive one datagram, reporting truncation via WSAEMSGSIZE.
        ///
        /// WinSock discards the sender address on a truncated receive, so a
        /// partial datagram is reported with the buffer length and no sender.
        pub fn recv_from_trunc(
            sock: &mio::net::UdpSocket,
            buf: &mut [u8],
        ) -> io::Result<(usize, Option<Endpoint>, bool)> {
            const WSAEMSGSIZE_CODE: i32 = 10040;
            match sock.recv_from(buf) {
                Ok((n, addr)) => Ok((n, Some(Endpoint::from_socket_addr(addr)), false)),
                Err(e) if e.raw_os_error() == Some(WSAEMSGSIZE_CODE) => Ok((buf.len(), None, true)),
                Err(e) => Err(e),
            }
        }

        /// Send one datagram assembled from several buffers
        pub fn send_to_vectored(
            sock: &mio::net::UdpSocket,
            bufs: &[Vec<u8>],
            to: Endpoint,
        ) -> io::Result<usize> {
            let total: usize = bufs.iter().map(|b| b.len()).sum();
            let mut joined = Vec::with_capacity(total);
            for b in bufs {
                joined.extend_from_slice(b);
            }
            sock.send_to(&joined, std::net::SocketAddr::from(to))
        }

        /// Adopt an OS socket as a std UDP socket
        ///
        /// # Safety
        /// The caller transfers exclusive ownership of the descriptor.
        pub unsafe fn udp_from_os(s: OsSocket) -> std::net::UdpSocket {
            unsafe { std::net::UdpSocket::from_raw_socket(s) }
        }

        /// Adopt an OS socket as a std TCP listener
        ///
        /// # Safety
        /// The caller transfers exclusive ownership of the descriptor.
        pub unsafe fn tcp_listener_from_os(s: OsSocket) -> std::net::TcpListener {
            unsafe { std::net::TcpListener::from_raw_socket(s) }
        }
    }
}
