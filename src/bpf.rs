//! The classic BPF program attached to the raw-mode packet socket.
//!
//! The normative admission predicate lives in `dhcplink_raw::filter`; this
//! program is its kernel-side mirror, parameterized by the probe's xid.
//! Changing the xid means detaching the socket and installing a program
//! built for the new one.

use std::io;
use std::os::fd::RawFd;

use crate::sys;
use crate::syscall_los;

/// UDP header (8) + BOOTP fixed header (236) + magic cookie (4)
const MIN_UDP_PAYLOAD: u32 = 8 + 236 + 4;

const ACCEPT: u32 = u32::MAX;
const DROP: u32 = 0;

const fn stmt(code: u16, k: u32) -> sys::sock_filter {
    sys::sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> sys::sock_filter {
    sys::sock_filter { code, jt, jf, k }
}

/// Admit iff: IPv4 UDP, unfragmented, at least a full BOOTP reply behind
/// the IP header, destined to port 68, op BOOTREPLY, the probe's xid, the
/// DHCP magic cookie. The socket sees the frame from the IP header on
/// (`SOCK_DGRAM` packet socket).
pub fn admission_program(xid: u32) -> [sys::sock_filter; 18] {
    [
        // IP protocol == UDP
        stmt(sys::BPF_LD | sys::BPF_B | sys::BPF_ABS, 9),
        jump(sys::BPF_JMP | sys::BPF_JEQ | sys::BPF_K, 17, 0, 15),
        // No fragment flags, no fragment offset
        stmt(sys::BPF_LD | sys::BPF_H | sys::BPF_ABS, 6),
        jump(sys::BPF_JMP | sys::BPF_JSET | sys::BPF_K, 0x3fff, 13, 0),
        // X := IP header length
        stmt(sys::BPF_LDX | sys::BPF_B | sys::BPF_MSH, 0),
        // Frame length minus the IP header covers UDP + BOOTP + cookie
        stmt(sys::BPF_LD | sys::BPF_W | sys::BPF_LEN, 0),
        stmt(sys::BPF_ALU | sys::BPF_SUB | sys::BPF_X, 0),
        jump(sys::BPF_JMP | sys::BPF_JGE | sys::BPF_K, MIN_UDP_PAYLOAD, 0, 9),
        // UDP destination port == 68
        stmt(sys::BPF_LD | sys::BPF_H | sys::BPF_IND, 2),
        jump(sys::BPF_JMP | sys::BPF_JEQ | sys::BPF_K, 68, 0, 7),
        // BOOTP op == BOOTREPLY
        stmt(sys::BPF_LD | sys::BPF_B | sys::BPF_IND, 8),
        jump(sys::BPF_JMP | sys::BPF_JEQ | sys::BPF_K, 2, 0, 5),
        // xid == ours
        stmt(sys::BPF_LD | sys::BPF_W | sys::BPF_IND, 8 + 4),
        jump(sys::BPF_JMP | sys::BPF_JEQ | sys::BPF_K, xid, 0, 3),
        // Magic cookie
        stmt(sys::BPF_LD | sys::BPF_W | sys::BPF_IND, 8 + 236),
        jump(sys::BPF_JMP | sys::BPF_JEQ | sys::BPF_K, 0x6382_5363, 0, 1),
        stmt(sys::BPF_RET | sys::BPF_K, ACCEPT),
        stmt(sys::BPF_RET | sys::BPF_K, DROP),
    ]
}

pub fn attach(fd: RawFd, xid: u32) -> io::Result<()> {
    let program = admission_program(xid);

    let fprog = sys::sock_fprog {
        len: program.len() as u16,
        filter: program.as_ptr() as *mut _,
    };

    syscall_los!(unsafe {
        sys::setsockopt(
            fd,
            sys::SOL_SOCKET,
            sys::SO_ATTACH_FILTER,
            &fprog as *const _ as *const _,
            core::mem::size_of::<sys::sock_fprog>() as _,
        )
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_is_parameterized_by_xid() {
        let program = admission_program(0xDEADBEEF);

        assert_eq!(program.len(), 18);

        // The xid comparison and the terminal verdicts
        assert_eq!(program[13].k, 0xDEADBEEF);
        assert_eq!(program[16].k, u32::MAX);
        assert_eq!(program[17].k, 0);

        // Every conditional jump lands inside the program
        for (index, insn) in program.iter().enumerate() {
            if insn.code & 0x07 == sys::BPF_JMP {
                assert!(index + 1 + (insn.jt as usize) < program.len());
                assert!(index + 1 + (insn.jf as usize) < program.len());
            }
        }
    }
}
