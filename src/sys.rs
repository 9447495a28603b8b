//! Thin veneer over libc: everything kernel-facing goes through here.

#![allow(non_camel_case_types)]

pub use libc::*;

// Classic BPF opcode building blocks, as u16 so they compose directly into
// `sock_filter::code`
pub const BPF_LD: u16 = 0x00;
pub const BPF_LDX: u16 = 0x01;
pub const BPF_ALU: u16 = 0x04;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_RET: u16 = 0x06;

pub const BPF_W: u16 = 0x00;
pub const BPF_H: u16 = 0x08;
pub const BPF_B: u16 = 0x10;

pub const BPF_ABS: u16 = 0x20;
pub const BPF_IND: u16 = 0x40;
pub const BPF_MSH: u16 = 0xa0;
pub const BPF_LEN: u16 = 0x80;

pub const BPF_SUB: u16 = 0x10;

pub const BPF_JEQ: u16 = 0x10;
pub const BPF_JGE: u16 = 0x30;
pub const BPF_JSET: u16 = 0x40;

pub const BPF_K: u16 = 0x00;
pub const BPF_X: u16 = 0x08;

// Packet-socket auxdata status bits (linux/if_packet.h)
pub const TP_STATUS_CSUMNOTREADY: u32 = 1 << 3;
pub const TP_STATUS_CSUM_VALID: u32 = 1 << 7;

/// `sockaddr_ll` with room for link-layer addresses longer than the 8
/// octets libc declares; Infiniband addresses are 20 octets and the kernel
/// reads `sll_halen` of them
#[repr(C)]
#[derive(Copy, Clone)]
pub struct sockaddr_ll_ext {
    pub sll_family: c_ushort,
    pub sll_protocol: c_ushort,
    pub sll_ifindex: c_int,
    pub sll_hatype: c_ushort,
    pub sll_pkttype: c_uchar,
    pub sll_halen: c_uchar,
    pub sll_addr: [c_uchar; 24],
}

#[macro_export]
macro_rules! syscall_los {
    ($ret:expr) => {{
        let result = $ret;

        if result == -1 {
            Err(::std::io::Error::last_os_error())
        } else {
            Ok(result)
        }
    }};
}
