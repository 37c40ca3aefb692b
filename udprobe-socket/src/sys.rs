//! Platform socket plumbing: buffer sizing and per-datagram ToS.

use std::{io, net::SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// Creates a non-blocking UDP socket bound to `addr`, with the given receive buffer size.
///
/// A receive buffer the kernel refuses to grow is logged, not fatal. The address is not
/// shared: binding a port that is already in use fails with `AddrInUse`.
pub(crate) fn bind_udp(addr: SocketAddr, recv_buffer_size: usize) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;

    if let Err(e) = socket.set_recv_buffer_size(recv_buffer_size) {
        tracing::warn!(
            %addr,
            size = recv_buffer_size,
            error = ?e,
            "Failed to set receive buffer size"
        );
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    UdpSocket::from_std(socket.into())
}

/// Sends `buf` to `target`, with the IP ToS (or IPv6 traffic class) of this single datagram set
/// to `tos` through an ancillary message. The socket-level ToS is left untouched.
#[cfg(target_os = "linux")]
pub(crate) async fn send_to_with_tos(
    socket: &UdpSocket,
    buf: &[u8],
    target: SocketAddr,
    tos: u8,
) -> io::Result<usize> {
    use std::os::fd::AsRawFd;
    use tokio::io::Interest;

    let addr = socket2::SockAddr::from(target);
    let fd = socket.as_raw_fd();

    socket.async_io(Interest::WRITABLE, || linux::sendmsg_tos(fd, buf, &addr, tos)).await
}

/// Sends `buf` to `target` after setting the socket-level ToS. Without per-datagram control
/// messages, concurrent senders on the same socket may race on the option.
#[cfg(all(unix, not(target_os = "linux")))]
pub(crate) async fn send_to_with_tos(
    socket: &UdpSocket,
    buf: &[u8],
    target: SocketAddr,
    tos: u8,
) -> io::Result<usize> {
    if target.is_ipv4() {
        socket2::SockRef::from(socket).set_tos(u32::from(tos))?;
    }

    socket.send_to(buf, target).await
}

#[cfg(target_os = "linux")]
mod linux {
    use std::{io, mem, os::fd::RawFd, ptr};

    use libc::{c_int, c_void};
    use socket2::SockAddr;

    /// Room for one `cmsghdr` carrying a `c_int`, aligned for `cmsghdr`.
    type ControlBuf = [u64; 4];

    pub(super) fn sendmsg_tos(
        fd: RawFd,
        buf: &[u8],
        addr: &SockAddr,
        tos: u8,
    ) -> io::Result<usize> {
        let (level, ty) = if addr.is_ipv4() {
            (libc::IPPROTO_IP, libc::IP_TOS)
        } else {
            (libc::IPPROTO_IPV6, libc::IPV6_TCLASS)
        };

        let mut control: ControlBuf = [0; 4];
        let mut iov = libc::iovec { iov_base: buf.as_ptr() as *mut c_void, iov_len: buf.len() };

        // SAFETY: an all-zero msghdr is a valid empty message.
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_name = addr.as_ptr() as *mut c_void;
        msg.msg_namelen = addr.len();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast();

        // SAFETY: CMSG_SPACE only computes a size.
        let space = unsafe { libc::CMSG_SPACE(mem::size_of::<c_int>() as u32) } as usize;
        debug_assert!(space <= mem::size_of::<ControlBuf>());
        msg.msg_controllen = space as _;

        // SAFETY: the control buffer is large enough and aligned for one cmsghdr plus a c_int,
        // and outlives the sendmsg call along with the iovec and address.
        let sent = unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            if cmsg.is_null() {
                return Err(io::Error::new(io::ErrorKind::Other, "control buffer too small"));
            }

            (*cmsg).cmsg_level = level;
            (*cmsg).cmsg_type = ty;
            (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<c_int>() as u32) as _;
            ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<c_int>(), c_int::from(tos));

            libc::sendmsg(fd, &msg, 0)
        };

        if sent < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(sent as usize)
        }
    }
}
