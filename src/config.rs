use std::net::Ipv4Addr;
use std::time::Duration;

use dhcplink_proto::ident::{ClientIdent, HardwareAddr, TransportKind};
use dhcplink_proto::probe::ProbeOptions;

use crate::clock::Clock;
use crate::Error;

/// Per-client configuration: the interface identity plus reception and
/// selection policy. Built once and validated by [`crate::Client::new`].
#[derive(Debug)]
pub struct ClientConfig {
    pub(crate) ifindex: u32,
    pub(crate) transport: TransportKind,
    pub(crate) hw_addr: Vec<u8>,
    pub(crate) broadcast_addr: Option<Vec<u8>>,
    pub(crate) client_id: Option<Vec<u8>>,
    pub(crate) mtu: u16,
    pub(crate) accept_first_offer: bool,
    pub(crate) reply_directly: bool,
    pub(crate) strict_destination: bool,
    pub(crate) allow_link_local: bool,
    pub(crate) event_capacity: usize,
    pub(crate) clock: Option<Box<dyn Clock>>,
}

impl ClientConfig {
    pub fn new(ifindex: u32) -> Self {
        Self {
            ifindex,
            transport: TransportKind::Ethernet,
            hw_addr: Vec::new(),
            broadcast_addr: None,
            client_id: None,
            mtu: 1500,
            accept_first_offer: false,
            reply_directly: false,
            strict_destination: false,
            allow_link_local: false,
            event_capacity: 64,
            clock: None,
        }
    }

    pub fn with_ethernet(mut self, mac: [u8; 6]) -> Self {
        self.transport = TransportKind::Ethernet;
        self.hw_addr = mac.to_vec();
        self
    }

    pub fn with_infiniband(mut self, addr: [u8; 20], broadcast: [u8; 20]) -> Self {
        self.transport = TransportKind::Infiniband;
        self.hw_addr = addr.to_vec();
        self.broadcast_addr = Some(broadcast.to_vec());
        self
    }

    pub fn with_broadcast_addr(mut self, addr: &[u8]) -> Self {
        self.broadcast_addr = Some(addr.to_vec());
        self
    }

    /// Client identifier option (61) payload; Infiniband clients get an
    /// RFC 4390 derived one when none is set
    pub fn with_client_id(mut self, client_id: &[u8]) -> Self {
        self.client_id = Some(client_id.to_vec());
        self
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    /// Take the first well-formed OFFER instead of collecting offers for
    /// the host to pick from
    pub fn with_accept_first_offer(mut self, accept: bool) -> Self {
        self.accept_first_offer = accept;
        self
    }

    /// Tell servers they may unicast replies to the offered address
    /// (clears the BROADCAST flag). Ethernet only; Infiniband replies must
    /// always be broadcast.
    pub fn with_reply_directly(mut self, direct: bool) -> Self {
        self.reply_directly = direct;
        self
    }

    /// Tighten the permissive reception default: also require the IP
    /// destination of a raw-mode reply to be the limited broadcast or the
    /// address under negotiation
    pub fn with_strict_destination_match(mut self, strict: bool) -> Self {
        self.strict_destination = strict;
        self
    }

    /// Accept 169.254/16 assignments instead of treating them as bogus
    pub fn with_allow_link_local(mut self, allow: bool) -> Self {
        self.allow_link_local = allow;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Substitute the monotonic time source (for testing)
    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub(crate) fn validate(&self) -> Result<ClientIdent, Error> {
        if self.ifindex == 0 {
            return Err(Error::InvalidConfig("ifindex must be positive"));
        }

        if self.hw_addr.len() != self.transport.addr_len() {
            return Err(Error::InvalidConfig(
                "hardware address length does not match the transport",
            ));
        }

        let addr = HardwareAddr::from_slice(&self.hw_addr)
            .ok_or(Error::InvalidConfig("invalid hardware address"))?;

        let broadcast_addr = match &self.broadcast_addr {
            Some(broadcast) => {
                if broadcast.len() != self.transport.addr_len() {
                    return Err(Error::InvalidConfig(
                        "broadcast address length does not match the transport",
                    ));
                }

                HardwareAddr::from_slice(broadcast)
                    .ok_or(Error::InvalidConfig("invalid broadcast address"))?
            }
            None => match self.transport {
                TransportKind::Ethernet => HardwareAddr::BROADCAST_ETHERNET,
                TransportKind::Infiniband => {
                    return Err(Error::InvalidConfig(
                        "Infiniband requires an explicit broadcast address",
                    ))
                }
            },
        };

        let mut client_id = heapless::Vec::new();

        match &self.client_id {
            Some(id) => client_id
                .extend_from_slice(id)
                .map_err(|_| Error::InvalidConfig("client identifier too long"))?,
            None => {
                if matches!(self.transport, TransportKind::Infiniband) {
                    client_id = ClientIdent::default_infiniband_client_id(&addr);
                }
            }
        }

        Ok(ClientIdent {
            ifindex: self.ifindex,
            transport: self.transport,
            addr,
            broadcast_addr,
            client_id,
        })
    }

    /// The DHCP message size cap the configured MTU leaves after the IP
    /// and UDP headers
    pub(crate) fn max_message_size(&self) -> u16 {
        self.mtu.max(576) - 28
    }
}

/// Per-acquisition configuration, consumed by [`crate::Client::probe`]
#[derive(Clone, Debug, Default)]
pub struct ProbeConfig {
    requested_ip: Option<Ipv4Addr>,
    inform_address: Option<Ipv4Addr>,
    offer_window: Option<Duration>,
    requested_options: Option<Vec<u8>>,
}

impl ProbeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// INIT-REBOOT: ask the network to confirm a previously held address
    /// before falling back to discovery
    pub fn with_init_reboot(mut self, prior: Ipv4Addr) -> Self {
        self.requested_ip = Some(prior);
        self
    }

    /// INFORM: the address is configured externally; only fetch the rest
    /// of the configuration
    pub fn with_inform(mut self, addr: Ipv4Addr) -> Self {
        self.inform_address = Some(addr);
        self
    }

    /// How long offers are collected after the first one (default 3s)
    pub fn with_offer_window(mut self, window: Duration) -> Self {
        self.offer_window = Some(window);
        self
    }

    /// Option codes for the parameter request list (option 55)
    pub fn with_requested_options(mut self, codes: &[u8]) -> Self {
        self.requested_options = Some(codes.to_vec());
        self
    }

    pub(crate) fn to_probe_options(&self, client: &ClientConfig) -> Result<ProbeOptions, Error> {
        if self.requested_ip.is_some() && self.inform_address.is_some() {
            return Err(Error::InvalidConfig(
                "a probe is either init-reboot or inform-only, not both",
            ));
        }

        let mut opts = ProbeOptions {
            requested_ip: self.requested_ip,
            inform_address: self.inform_address,
            accept_first_offer: client.accept_first_offer,
            request_broadcast: matches!(client.transport, TransportKind::Infiniband)
                || !client.reply_directly,
            allow_link_local: client.allow_link_local,
            max_message_size: client.max_message_size(),
            ..Default::default()
        };

        if let Some(window) = self.offer_window {
            opts.offer_window = embassy_time::Duration::from_millis(window.as_millis() as u64);
        }

        if let Some(codes) = &self.requested_options {
            opts.parameter_request_list.clear();
            opts.parameter_request_list
                .extend_from_slice(codes)
                .map_err(|_| Error::InvalidConfig("parameter request list too long"))?;
        }

        Ok(opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: [u8; 6] = [0x02, 0, 0, 0, 0, 0x01];

    #[test]
    fn validation() {
        assert!(matches!(
            ClientConfig::new(0).with_ethernet(MAC).validate(),
            Err(Error::InvalidConfig(_))
        ));

        // Hardware address length must match the transport
        let mut config = ClientConfig::new(2).with_ethernet(MAC);
        config.hw_addr.push(0xFF);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let ident = ClientConfig::new(2).with_ethernet(MAC).validate().unwrap();
        assert_eq!(ident.ifindex, 2);
        assert_eq!(ident.addr.as_slice(), &MAC);
        assert_eq!(
            ident.broadcast_addr.as_slice(),
            &[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        assert!(ident.client_id.is_empty());
    }

    #[test]
    fn infiniband_defaults() {
        let addr = [0x11; 20];
        let broadcast = [0xFF; 20];

        let ident = ClientConfig::new(3)
            .with_infiniband(addr, broadcast)
            .validate()
            .unwrap();

        assert_eq!(ident.transport, TransportKind::Infiniband);
        // RFC 4390 client id: htype plus the trailing 8 address octets
        assert_eq!(ident.client_id[0], 32);
        assert_eq!(&ident.client_id[1..], &[0x11; 8]);
    }

    #[test]
    fn probe_config_mapping() {
        let client = ClientConfig::new(2).with_ethernet(MAC).with_mtu(1500);

        let opts = ProbeConfig::new()
            .with_offer_window(Duration::from_secs(5))
            .with_requested_options(&[1, 3, 6])
            .to_probe_options(&client)
            .unwrap();

        assert_eq!(opts.max_message_size, 1472);
        assert_eq!(opts.offer_window, embassy_time::Duration::from_secs(5));
        assert_eq!(opts.parameter_request_list.as_slice(), &[1, 3, 6]);
        assert!(opts.request_broadcast);

        let both = ProbeConfig::new()
            .with_init_reboot(Ipv4Addr::new(10, 0, 0, 42))
            .with_inform(Ipv4Addr::new(10, 0, 0, 42));
        assert!(both.to_probe_options(&client).is_err());
    }
}
