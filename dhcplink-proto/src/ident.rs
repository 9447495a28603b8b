use crate::packet::Packet;

/// ARP hardware type for 10Mb Ethernet
pub const ARPHRD_ETHER: u8 = 1;
/// ARP hardware type for Infiniband (RFC 4390)
pub const ARPHRD_INFINIBAND: u8 = 32;

pub const ETHERNET_ADDR_LEN: usize = 6;
pub const INFINIBAND_ADDR_LEN: usize = 20;

/// Link-layer transport the client runs on
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TransportKind {
    Ethernet,
    Infiniband,
}

impl TransportKind {
    pub const fn htype(&self) -> u8 {
        match self {
            Self::Ethernet => ARPHRD_ETHER,
            Self::Infiniband => ARPHRD_INFINIBAND,
        }
    }

    /// Length of a link-layer address of this transport
    pub const fn addr_len(&self) -> usize {
        match self {
            Self::Ethernet => ETHERNET_ADDR_LEN,
            Self::Infiniband => INFINIBAND_ADDR_LEN,
        }
    }

    /// The `hlen` header field value.
    ///
    /// An Infiniband address does not fit the 16-byte `chaddr` field; per
    /// RFC 4390 such clients send `hlen` 0, an all-zero `chaddr`, and
    /// identify themselves via the client identifier option instead.
    pub const fn hlen(&self) -> u8 {
        match self {
            Self::Ethernet => ETHERNET_ADDR_LEN as u8,
            Self::Infiniband => 0,
        }
    }
}

/// A link-layer address of up to 20 octets
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct HardwareAddr {
    octets: [u8; INFINIBAND_ADDR_LEN],
    len: u8,
}

impl HardwareAddr {
    /// The Ethernet broadcast address
    pub const BROADCAST_ETHERNET: Self = {
        let mut octets = [0; INFINIBAND_ADDR_LEN];
        let mut index = 0;
        while index < ETHERNET_ADDR_LEN {
            octets[index] = 0xFF;
            index += 1;
        }

        Self {
            octets,
            len: ETHERNET_ADDR_LEN as u8,
        }
    };

    pub fn from_slice(addr: &[u8]) -> Option<Self> {
        if addr.is_empty() || addr.len() > INFINIBAND_ADDR_LEN {
            return None;
        }

        let mut octets = [0; INFINIBAND_ADDR_LEN];
        octets[..addr.len()].copy_from_slice(addr);

        Some(Self {
            octets,
            len: addr.len() as u8,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.octets[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// The fixed identity of one client instance: the interface it runs on and
/// how it presents itself on the wire. Immutable for the client's lifetime.
#[derive(Clone, Debug)]
pub struct ClientIdent {
    pub ifindex: u32,
    pub transport: TransportKind,
    pub addr: HardwareAddr,
    pub broadcast_addr: HardwareAddr,
    /// Client identifier option payload; empty when the option is not sent
    pub client_id: heapless::Vec<u8, 64>,
}

impl ClientIdent {
    /// The default client identifier for transports whose address does not
    /// fit `chaddr`: the hardware type followed by the trailing 8 address
    /// octets (the interface identifier part, RFC 4390)
    pub fn default_infiniband_client_id(addr: &HardwareAddr) -> heapless::Vec<u8, 64> {
        let mut id = heapless::Vec::new();

        let octets = addr.as_slice();
        let tail = &octets[octets.len().saturating_sub(8)..];

        // Capacity is 64, the pushes cannot fail
        let _ = id.push(ARPHRD_INFINIBAND);
        let _ = id.extend_from_slice(tail);

        id
    }

    pub fn chaddr(&self) -> [u8; 16] {
        let mut chaddr = [0; 16];

        if matches!(self.transport, TransportKind::Ethernet) {
            chaddr[..ETHERNET_ADDR_LEN].copy_from_slice(self.addr.as_slice());
        }

        chaddr
    }

    /// Whether a BOOTP reply is addressed to this client
    pub fn matches_chaddr(&self, packet: &Packet) -> bool {
        match self.transport {
            TransportKind::Ethernet => {
                packet.hlen as usize == ETHERNET_ADDR_LEN && packet.chaddr == self.chaddr()
            }
            // RFC 4390 replies carry hlen 0 and a zeroed chaddr; the xid and
            // the client identifier do the matching
            TransportKind::Infiniband => packet.hlen == 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infiniband_client_id() {
        let addr = HardwareAddr::from_slice(&[
            0x80, 0x00, 0x00, 0x48, 0xFE, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xF4, 0x52,
            0x14, 0x03, 0x00, 0x7B, 0xCB, 0xA1,
        ])
        .unwrap();

        let id = ClientIdent::default_infiniband_client_id(&addr);
        assert_eq!(
            id.as_slice(),
            &[32, 0xF4, 0x52, 0x14, 0x03, 0x00, 0x7B, 0xCB, 0xA1]
        );
    }

    #[test]
    fn chaddr_layout() {
        let ident = ClientIdent {
            ifindex: 2,
            transport: TransportKind::Ethernet,
            addr: HardwareAddr::from_slice(&[0x02, 0, 0, 0, 0, 0x01]).unwrap(),
            broadcast_addr: HardwareAddr::BROADCAST_ETHERNET,
            client_id: heapless::Vec::new(),
        };

        let chaddr = ident.chaddr();
        assert_eq!(&chaddr[..6], &[0x02, 0, 0, 0, 0, 0x01]);
        assert_eq!(&chaddr[6..], &[0; 10]);
    }
}
