use core::net::Ipv4Addr;

/// BOOTP fixed header plus the magic cookie
pub const BOOTP_MIN_LEN: usize = 236 + 4;

const IP_MIN_HDR: usize = 20;
const UDP_HDR: usize = 8;

const PROTO_UDP: u8 = 17;
const BOOT_REPLY: u8 = 2;
const COOKIE: [u8; 4] = [99, 130, 83, 99];

/// The admission predicate for raw-mode reception, over one IPv4 frame.
///
/// This is the single source of truth the kernel-attached filter program
/// mirrors: a frame is admitted iff it is an unfragmented UDP datagram to
/// `client_port`, long enough for a BOOTP reply, with op BOOTREPLY, the
/// probe's xid and the DHCP magic cookie. Like the kernel filter it does
/// not touch checksums; those are dealt with after admission.
///
/// `required_dst` optionally tightens the permissive default by also
/// requiring the IP destination to be the limited broadcast or the given
/// unicast address.
pub fn admits(frame: &[u8], xid: u32, client_port: u16, required_dst: Option<Ipv4Addr>) -> bool {
    if frame.len() < IP_MIN_HDR {
        return false;
    }

    if frame[9] != PROTO_UDP {
        return false;
    }

    // MF flag or a nonzero fragment offset
    if u16::from_be_bytes([frame[6], frame[7]]) & 0x3fff != 0 {
        return false;
    }

    let ihl = (frame[0] & 0x0f) as usize * 4;
    if ihl < IP_MIN_HDR || frame.len() < ihl + UDP_HDR + BOOTP_MIN_LEN {
        return false;
    }

    let udp = &frame[ihl..];
    if u16::from_be_bytes([udp[2], udp[3]]) != client_port {
        return false;
    }

    let bootp = &udp[UDP_HDR..];
    if bootp[0] != BOOT_REPLY {
        return false;
    }

    if bootp[4..8] != xid.to_be_bytes() {
        return false;
    }

    if bootp[236..240] != COOKIE {
        return false;
    }

    if let Some(required) = required_dst {
        let dst = Ipv4Addr::from(<[u8; 4]>::try_from(&frame[16..20]).unwrap_or([0; 4]));

        if !dst.is_broadcast() && dst != required {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use core::net::SocketAddrV4;

    use super::*;
    use crate::encode_frame;

    const XID: u32 = 0xDEADBEEF;

    fn bootp_reply() -> [u8; BOOTP_MIN_LEN + 1] {
        let mut payload = [0; BOOTP_MIN_LEN + 1];

        payload[0] = BOOT_REPLY;
        payload[4..8].copy_from_slice(&XID.to_be_bytes());
        payload[236..240].copy_from_slice(&COOKIE);
        payload[240] = 255; // END

        payload
    }

    fn frame() -> std::vec::Vec<u8> {
        let payload = bootp_reply();
        let mut buf = [0; 1500];

        encode_frame(
            &mut buf,
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 67),
            SocketAddrV4::new(Ipv4Addr::BROADCAST, 68),
            |buf| {
                buf[..payload.len()].copy_from_slice(&payload);

                Ok(payload.len())
            },
        )
        .unwrap()
        .to_vec()
    }

    #[test]
    fn admits_a_well_formed_reply() {
        assert!(admits(&frame(), XID, 68, None));
    }

    #[test]
    fn rejects_every_fragment() {
        // MF flag
        let mut data = frame();
        data[6] |= 0x20;
        assert!(!admits(&data, XID, 68, None));

        // Nonzero offset
        let mut data = frame();
        data[7] = 1;
        assert!(!admits(&data, XID, 68, None));
    }

    #[test]
    fn rejects_a_foreign_xid() {
        assert!(!admits(&frame(), XID ^ 1, 68, None));
    }

    #[test]
    fn rejects_non_reply_ops_and_foreign_ports() {
        let mut data = frame();
        let ihl = (data[0] & 0x0f) as usize * 4;
        data[ihl + UDP_HDR] = 1; // BOOTREQUEST
        assert!(!admits(&data, XID, 68, None));

        assert!(!admits(&frame(), XID, 67, None));
    }

    #[test]
    fn rejects_a_bad_cookie() {
        let mut data = frame();
        let ihl = (data[0] & 0x0f) as usize * 4;
        data[ihl + UDP_HDR + 236..ihl + UDP_HDR + 240].copy_from_slice(&[0; 4]);
        assert!(!admits(&data, XID, 68, None));
    }

    #[test]
    fn rejects_short_replies() {
        let data = frame();
        assert!(!admits(&data[..data.len() - 8], XID, 68, None));
    }

    #[test]
    fn strict_destination_matching() {
        let unicast = Ipv4Addr::new(10, 0, 0, 42);

        // Broadcast destination always passes
        assert!(admits(&frame(), XID, 68, Some(unicast)));

        // Unicast destination must match
        let mut data = frame();
        data[16..20].copy_from_slice(&unicast.octets());
        assert!(admits(&data, XID, 68, Some(unicast)));

        data[16..20].copy_from_slice(&[10, 0, 0, 7]);
        assert!(!admits(&data, XID, 68, Some(unicast)));
    }
}
