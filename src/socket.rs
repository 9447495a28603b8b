use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::trace;

use dhcplink_proto::ident::HardwareAddr;
use dhcplink_proto::{CLIENT_PORT, SERVER_PORT};

use crate::bpf;
use crate::sys;
use crate::syscall_los;

/// Whether the kernel vouched for the UDP checksum of a received frame.
///
/// `Unverified` covers both "not computed yet" (locally looped or
/// offloaded traffic) and plain absence of auxdata; either way the
/// transport verifies in user space before the packet is let through.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum ChecksumState {
    Verified,
    Unverified,
}

/// The raw-mode transport: a PF_PACKET datagram socket bound to the
/// interface, with the xid-parameterized admission filter attached and
/// `PACKET_AUXDATA` enabled for checksum reporting.
///
/// Used while the interface has no usable address: INIT through REQUESTING,
/// REBINDING, and any broadcast.
pub(crate) struct RawSocket {
    fd: OwnedFd,
    ifindex: u32,
}

impl RawSocket {
    pub fn open(ifindex: u32, xid: u32) -> io::Result<Self> {
        let fd = syscall_los!(unsafe {
            sys::socket(
                sys::PF_PACKET,
                sys::SOCK_DGRAM | sys::SOCK_NONBLOCK | sys::SOCK_CLOEXEC,
                (sys::ETH_P_IP as u16).to_be() as _,
            )
        })?;

        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        // Filter first, bind second: nothing foreign to the xid ever queues
        bpf::attach(fd.as_raw_fd(), xid)?;

        let one: sys::c_int = 1;
        syscall_los!(unsafe {
            sys::setsockopt(
                fd.as_raw_fd(),
                sys::SOL_PACKET,
                sys::PACKET_AUXDATA,
                &one as *const _ as *const _,
                core::mem::size_of::<sys::c_int>() as _,
            )
        })?;

        let sockaddr = sys::sockaddr_ll {
            sll_family: sys::AF_PACKET as _,
            sll_protocol: (sys::ETH_P_IP as u16).to_be() as _,
            sll_ifindex: ifindex as _,
            sll_hatype: 0,
            sll_pkttype: 0,
            sll_halen: 0,
            sll_addr: Default::default(),
        };

        syscall_los!(unsafe {
            sys::bind(
                fd.as_raw_fd(),
                &sockaddr as *const _ as *const _,
                core::mem::size_of::<sys::sockaddr_ll>() as _,
            )
        })?;

        Ok(Self { fd, ifindex })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Single best-effort transmission of one pre-assembled IP frame
    pub fn send(&self, frame: &[u8], dest: &HardwareAddr) -> io::Result<()> {
        let mut sockaddr = sys::sockaddr_ll_ext {
            sll_family: sys::AF_PACKET as _,
            sll_protocol: (sys::ETH_P_IP as u16).to_be() as _,
            sll_ifindex: self.ifindex as _,
            sll_hatype: 0,
            sll_pkttype: 0,
            sll_halen: dest.len() as _,
            sll_addr: [0; 24],
        };

        sockaddr.sll_addr[..dest.len()].copy_from_slice(dest.as_slice());

        syscall_los!(unsafe {
            sys::sendto(
                self.fd.as_raw_fd(),
                frame.as_ptr() as *const _,
                frame.len(),
                sys::MSG_NOSIGNAL,
                &sockaddr as *const _ as *const _,
                core::mem::size_of::<sys::sockaddr_ll_ext>() as _,
            )
        })?;

        Ok(())
    }

    /// One frame per call, or `None` once drained
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<Option<(usize, ChecksumState)>> {
        let mut iov = sys::iovec {
            iov_base: buf.as_mut_ptr() as *mut _,
            iov_len: buf.len(),
        };

        let mut control = [0u8; 64];

        let mut msg: sys::msghdr = unsafe { core::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut _;
        msg.msg_controllen = control.len() as _;

        let len = match syscall_los!(unsafe { sys::recvmsg(self.fd.as_raw_fd(), &mut msg, 0) }) {
            Ok(len) => len as usize,
            Err(err) if drained(&err) => return Ok(None),
            Err(err) => return Err(err),
        };

        let mut state = ChecksumState::Unverified;

        unsafe {
            let mut cmsg = sys::CMSG_FIRSTHDR(&msg);

            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == sys::SOL_PACKET && (*cmsg).cmsg_type == sys::PACKET_AUXDATA
                {
                    let aux = sys::CMSG_DATA(cmsg) as *const sys::tpacket_auxdata;
                    let status = (*aux).tp_status;

                    if status & sys::TP_STATUS_CSUM_VALID != 0 {
                        state = ChecksumState::Verified;
                    }

                    trace!("Frame of {} bytes, auxdata status {:#x}", len, status);
                }

                cmsg = sys::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        Ok(Some((len, state)))
    }
}

/// The bound-mode transport: an ordinary UDP socket on the leased address,
/// connected to the lease's server, bound to the interface. Used in BOUND
/// and RENEWING, where the kernel's UDP demux suffices and no filter is
/// needed.
pub(crate) struct UdpSocket {
    fd: OwnedFd,
}

impl UdpSocket {
    pub fn open(ifindex: u32, local: Ipv4Addr, server: Ipv4Addr) -> io::Result<Self> {
        let fd = syscall_los!(unsafe {
            sys::socket(
                sys::AF_INET,
                sys::SOCK_DGRAM | sys::SOCK_NONBLOCK | sys::SOCK_CLOEXEC,
                0,
            )
        })?;

        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let one: sys::c_int = 1;
        syscall_los!(unsafe {
            sys::setsockopt(
                fd.as_raw_fd(),
                sys::SOL_SOCKET,
                sys::SO_REUSEADDR,
                &one as *const _ as *const _,
                core::mem::size_of::<sys::c_int>() as _,
            )
        })?;

        bind_to_device(fd.as_raw_fd(), ifindex)?;

        let local = sys::sockaddr_in {
            sin_family: sys::AF_INET as _,
            sin_port: CLIENT_PORT.to_be(),
            sin_addr: sys::in_addr {
                s_addr: u32::from_ne_bytes(local.octets()),
            },
            sin_zero: [0; 8],
        };

        syscall_los!(unsafe {
            sys::bind(
                fd.as_raw_fd(),
                &local as *const _ as *const _,
                core::mem::size_of::<sys::sockaddr_in>() as _,
            )
        })?;

        let remote = sys::sockaddr_in {
            sin_family: sys::AF_INET as _,
            sin_port: SERVER_PORT.to_be(),
            sin_addr: sys::in_addr {
                s_addr: u32::from_ne_bytes(server.octets()),
            },
            sin_zero: [0; 8],
        };

        syscall_los!(unsafe {
            sys::connect(
                fd.as_raw_fd(),
                &remote as *const _ as *const _,
                core::mem::size_of::<sys::sockaddr_in>() as _,
            )
        })?;

        Ok(Self { fd })
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn send(&self, data: &[u8]) -> io::Result<()> {
        syscall_los!(unsafe {
            sys::send(
                self.fd.as_raw_fd(),
                data.as_ptr() as *const _,
                data.len(),
                sys::MSG_NOSIGNAL,
            )
        })?;

        Ok(())
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match syscall_los!(unsafe {
            sys::recv(self.fd.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len(), 0)
        }) {
            Ok(len) => Ok(Some(len as usize)),
            Err(err) if drained(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

fn bind_to_device(fd: RawFd, ifindex: u32) -> io::Result<()> {
    let mut name = [0 as sys::c_char; sys::IF_NAMESIZE];

    if unsafe { sys::if_indextoname(ifindex, name.as_mut_ptr()) }.is_null() {
        return Err(io::Error::last_os_error());
    }

    let len = name.iter().position(|byte| *byte == 0).unwrap_or(0);

    syscall_los!(unsafe {
        sys::setsockopt(
            fd,
            sys::SOL_SOCKET,
            sys::SO_BINDTODEVICE,
            name.as_ptr() as *const _,
            len as _,
        )
    })?;

    Ok(())
}

/// Nothing queued right now
fn drained(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(sys::EAGAIN) | Some(sys::EWOULDBLOCK) | Some(sys::EINTR)
    )
}

/// Socket-level conditions the state machine rides out via its timers;
/// everything else is fatal for the client
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(sys::ENETDOWN)
            | Some(sys::ENOBUFS)
            | Some(sys::EAGAIN)
            | Some(sys::EWOULDBLOCK)
            | Some(sys::EINTR)
    )
}
