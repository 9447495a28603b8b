use std::net::Ipv4Addr;
use std::time::Duration;

use dhcplink_proto::options;
use dhcplink_proto::packet::Packet;
use dhcplink_proto::probe::LeaseInfo;

/// An immutable snapshot of a server-granted configuration.
///
/// Leases are handed to the host inside `Arc`s: the host may retain one
/// past the probe that produced it, and immutability keeps the sharing
/// free of synchronization. Raw options are preserved verbatim, unknown
/// codes included, with RFC 3396 fragments already concatenated.
#[derive(Clone, Debug)]
pub struct Lease {
    info: LeaseInfo,
    address: Ipv4Addr,
    server_id: Ipv4Addr,
    subnet_mask: Option<Ipv4Addr>,
    routers: Vec<Ipv4Addr>,
    dns: Vec<Ipv4Addr>,
    domain: Option<String>,
    lifetimes: Option<Lifetimes>,
    acquired_millis: u64,
    options: Vec<(u8, Vec<u8>)>,
}

/// Lease lifetime triple; always 0 < T1 <= T2 <= lease
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Lifetimes {
    pub lease: Duration,
    pub t1: Duration,
    pub t2: Duration,
}

impl Lease {
    pub(crate) fn from_reply(info: LeaseInfo, packet: &Packet, acquired_millis: u64) -> Self {
        let mut raw: Vec<(u8, Vec<u8>)> = Vec::new();

        for (code, value) in packet.options.raw_iter() {
            match raw.iter_mut().find(|(seen, _)| *seen == code) {
                Some((_, bytes)) => bytes.extend_from_slice(value),
                None => raw.push((code, value.to_vec())),
            }
        }

        let mut lease = Self::from_info(info, acquired_millis);

        lease.routers = addr_list(&raw, options::OPT_ROUTER);
        lease.dns = addr_list(&raw, options::OPT_DOMAIN_NAME_SERVER);
        lease.domain = raw
            .iter()
            .find(|(code, _)| *code == options::OPT_DOMAIN_NAME)
            .and_then(|(_, value)| {
                let trimmed = value.strip_suffix(&[0]).unwrap_or(value);

                core::str::from_utf8(trimmed).ok().map(str::to_owned)
            });
        lease.options = raw;

        lease
    }

    pub(crate) fn from_info(info: LeaseInfo, acquired_millis: u64) -> Self {
        Self {
            info,
            address: info.yiaddr,
            server_id: info.server_id,
            subnet_mask: info.subnet_mask,
            routers: info.router.into_iter().collect(),
            dns: Vec::new(),
            domain: None,
            lifetimes: info.times.map(|times| Lifetimes {
                lease: Duration::from_secs(times.lease.as_secs()),
                t1: Duration::from_secs(times.t1.as_secs()),
                t2: Duration::from_secs(times.t2.as_secs()),
            }),
            acquired_millis,
            options: Vec::new(),
        }
    }

    pub(crate) fn info(&self) -> &LeaseInfo {
        &self.info
    }

    /// The assigned (or, for INFORM, externally configured) address
    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn server_id(&self) -> Ipv4Addr {
        self.server_id
    }

    pub fn subnet_mask(&self) -> Option<Ipv4Addr> {
        self.subnet_mask
    }

    pub fn routers(&self) -> &[Ipv4Addr] {
        &self.routers
    }

    pub fn dns(&self) -> &[Ipv4Addr] {
        &self.dns
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// Lifetimes of the lease; `None` for INFORM-acquired configuration
    pub fn lifetimes(&self) -> Option<Lifetimes> {
        self.lifetimes
    }

    /// Monotonic timestamp of the acquiring ACK, in the client clock's
    /// milliseconds
    pub fn acquired_millis(&self) -> u64 {
        self.acquired_millis
    }

    /// The raw value of an option, as carried by the granting reply, with
    /// same-code fragments concatenated. Unknown codes are preserved.
    pub fn query(&self, code: u8) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|(seen, _)| *seen == code)
            .map(|(_, value)| value.as_slice())
    }

    #[cfg(test)]
    pub(crate) fn for_tests(n: u8) -> Self {
        let info = LeaseInfo {
            yiaddr: Ipv4Addr::new(10, 0, 0, n),
            server_id: Ipv4Addr::new(10, 0, 0, 1),
            subnet_mask: None,
            router: None,
            times: None,
        };

        Self::from_info(info, 0)
    }
}

fn addr_list(raw: &[(u8, Vec<u8>)], code: u8) -> Vec<Ipv4Addr> {
    raw.iter()
        .find(|(seen, _)| *seen == code)
        .map(|(_, value)| {
            value
                .chunks_exact(4)
                .map(|octets| Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    use dhcplink_proto::options::{DhcpOption, MessageType, Options};

    fn ack_packet<'a>(options: &'a [DhcpOption<'a>], buf: &'a mut [u8]) -> Packet<'a> {
        let mut chaddr = [0; 16];
        chaddr[..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);

        let packet = Packet {
            reply: true,
            htype: 1,
            hlen: 6,
            hops: 0,
            xid: 0xDEADBEEF,
            secs: 0,
            broadcast: false,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::new(10, 0, 0, 42),
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: &[],
            file: &[],
            options: Options::new(options),
        };

        // Round-trip through the wire format so the lease sees raw TLVs
        let len = packet.encode(buf, 1472).unwrap().len();

        Packet::decode(&buf[..len]).unwrap()
    }

    #[test]
    fn query_returns_raw_option_values() {
        let dns = [Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)];
        let ack_options = [
            DhcpOption::MessageType(MessageType::Ack),
            DhcpOption::ServerIdentifier(Ipv4Addr::new(10, 0, 0, 1)),
            DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0)),
            DhcpOption::IpAddressLeaseTime(3600),
            DhcpOption::DomainNameServer(dhcplink_proto::options::Ipv4Addrs::new(&dns)),
            DhcpOption::DomainName("lan.example"),
            DhcpOption::Unrecognized(224, &[0xAB, 0xCD]),
        ];

        let mut buf = [0; 1500];
        let packet = ack_packet(&ack_options, &mut buf);

        let info = LeaseInfo::from_address_reply(&packet, false).unwrap();
        let lease = Lease::from_reply(info, &packet, 1234);

        assert_eq!(lease.address(), Ipv4Addr::new(10, 0, 0, 42));
        assert_eq!(lease.server_id(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(lease.dns(), &dns);
        assert_eq!(lease.domain(), Some("lan.example"));
        assert_eq!(lease.acquired_millis(), 1234);

        // Scenario: query(51) on a 3600s lease
        assert_eq!(lease.query(51), Some(&[0, 0, 14, 16][..]));
        assert_eq!(lease.query(224), Some(&[0xAB, 0xCD][..]));
        assert_eq!(lease.query(99), None);

        let lifetimes = lease.lifetimes().unwrap();
        assert_eq!(lifetimes.lease, Duration::from_secs(3600));
        assert!(lifetimes.t1 <= lifetimes.t2 && lifetimes.t2 <= lifetimes.lease);
    }
}
