use core::net::Ipv4Addr;

use num_enum::TryFromPrimitive;

use crate::bytes::BytesIn;
use crate::Error;

// BOOTP vendor extensions (RFC 2132)
pub const OPT_PAD: u8 = 0;
pub const OPT_SUBNET_MASK: u8 = 1;
pub const OPT_ROUTER: u8 = 3;
pub const OPT_DOMAIN_NAME_SERVER: u8 = 6;
pub const OPT_HOST_NAME: u8 = 12;
pub const OPT_DOMAIN_NAME: u8 = 15;
pub const OPT_BROADCAST_ADDRESS: u8 = 28;

// DHCP extensions
pub const OPT_REQUESTED_IP_ADDRESS: u8 = 50;
pub const OPT_IP_ADDRESS_LEASE_TIME: u8 = 51;
pub const OPT_OVERLOAD: u8 = 52;
pub const OPT_MESSAGE_TYPE: u8 = 53;
pub const OPT_SERVER_IDENTIFIER: u8 = 54;
pub const OPT_PARAMETER_REQUEST_LIST: u8 = 55;
pub const OPT_MESSAGE: u8 = 56;
pub const OPT_MAX_MESSAGE_SIZE: u8 = 57;
pub const OPT_RENEWAL_TIME: u8 = 58;
pub const OPT_REBINDING_TIME: u8 = 59;
pub const OPT_CLIENT_IDENTIFIER: u8 = 61;
pub const OPT_END: u8 = 255;

/// Largest value a single TLV can carry; longer option values are split into
/// successive TLVs with the same code (RFC 3396)
pub const MAX_TLV_LEN: usize = 255;

///
/// DHCP Message Type.
///
/// The semantics of the various DHCP message types are described in RFC 2131
/// (see Table 2). Their numeric values are described in Section 9.6 of RFC 2132.
///
#[derive(Copy, Clone, PartialEq, Eq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    /// Client broadcast to locate available servers.
    Discover = 1,

    /// Server to client in response to DHCPDISCOVER with offer of configuration parameters.
    Offer = 2,

    /// Client message to servers either (a) requesting offered parameters from one server and
    /// implicitly declining offers from all others, (b) confirming correctness of previously
    /// allocated address after, e.g., system reboot, or (c) extending the lease on a particular
    /// network address.
    Request = 3,

    /// Client to server indicating network address is already in use.
    Decline = 4,

    /// Server to client with configuration parameters, including committed network address.
    Ack = 5,

    /// Server to client indicating client's notion of network address is incorrect (e.g., client
    /// has moved to new subnet) or client's lease as expired.
    Nak = 6,

    /// Client to server relinquishing network address and cancelling remaining lease.
    Release = 7,

    /// Client to server, asking only for local configuration parameters; client already has
    /// externally configured network address.
    Inform = 8,
}

impl core::fmt::Display for MessageType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let str = match self {
            Self::Discover => "DISCOVER",
            Self::Offer => "OFFER",
            Self::Request => "REQUEST",
            Self::Decline => "DECLINE",
            Self::Ack => "ACK",
            Self::Nak => "NAK",
            Self::Release => "RELEASE",
            Self::Inform => "INFORM",
        };

        write!(f, "{}", str)
    }
}

/// A single option TLV, either one the client interprets or an opaque
/// `Unrecognized` one, preserved verbatim.
///
/// Note that for options carrying values longer than 255 bytes, one
/// `DhcpOption` corresponds to one TLV *fragment*; reassembly across
/// fragments (RFC 3396) is left to the caller, via [`Options::raw_iter`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DhcpOption<'a> {
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    RequestedIpAddress(Ipv4Addr),
    IpAddressLeaseTime(u32),
    RenewalTime(u32),
    RebindingTime(u32),
    SubnetMask(Ipv4Addr),
    BroadcastAddress(Ipv4Addr),
    Router(Ipv4Addrs<'a>),
    DomainNameServer(Ipv4Addrs<'a>),
    HostName(&'a str),
    DomainName(&'a str),
    Message(&'a str),
    ParameterRequestList(&'a [u8]),
    MaxMessageSize(u16),
    ClientIdentifier(&'a [u8]),
    Unrecognized(u8, &'a [u8]),
}

impl<'a> DhcpOption<'a> {
    /// Interprets a raw TLV value.
    ///
    /// Values that do not have the length their code mandates are preserved
    /// as `Unrecognized` rather than rejected; the state machine treats the
    /// option as absent in that case.
    pub fn interpret(code: u8, value: &'a [u8]) -> Self {
        match code {
            OPT_MESSAGE_TYPE => match value {
                [mt] => match MessageType::try_from_primitive(*mt) {
                    Ok(mt) => Self::MessageType(mt),
                    Err(_) => Self::Unrecognized(code, value),
                },
                _ => Self::Unrecognized(code, value),
            },
            OPT_SERVER_IDENTIFIER => Self::addr(code, value, Self::ServerIdentifier),
            OPT_REQUESTED_IP_ADDRESS => Self::addr(code, value, Self::RequestedIpAddress),
            OPT_IP_ADDRESS_LEASE_TIME => Self::secs(code, value, Self::IpAddressLeaseTime),
            OPT_RENEWAL_TIME => Self::secs(code, value, Self::RenewalTime),
            OPT_REBINDING_TIME => Self::secs(code, value, Self::RebindingTime),
            OPT_SUBNET_MASK => Self::addr(code, value, Self::SubnetMask),
            OPT_BROADCAST_ADDRESS => Self::addr(code, value, Self::BroadcastAddress),
            OPT_ROUTER if !value.is_empty() && value.len() % 4 == 0 => {
                Self::Router(Ipv4Addrs(Ipv4AddrsInner::ByteSlice(value)))
            }
            OPT_DOMAIN_NAME_SERVER if !value.is_empty() && value.len() % 4 == 0 => {
                Self::DomainNameServer(Ipv4Addrs(Ipv4AddrsInner::ByteSlice(value)))
            }
            OPT_HOST_NAME => Self::str(code, value, Self::HostName),
            OPT_DOMAIN_NAME => Self::str(code, value, Self::DomainName),
            OPT_MESSAGE => Self::str(code, value, Self::Message),
            OPT_PARAMETER_REQUEST_LIST => Self::ParameterRequestList(value),
            OPT_MAX_MESSAGE_SIZE => match value {
                [hi, lo] => Self::MaxMessageSize(u16::from_be_bytes([*hi, *lo])),
                _ => Self::Unrecognized(code, value),
            },
            OPT_CLIENT_IDENTIFIER => Self::ClientIdentifier(value),
            _ => Self::Unrecognized(code, value),
        }
    }

    fn addr(code: u8, value: &'a [u8], f: fn(Ipv4Addr) -> Self) -> Self {
        match <[u8; 4]>::try_from(value) {
            Ok(octets) => f(octets.into()),
            Err(_) => Self::Unrecognized(code, value),
        }
    }

    fn secs(code: u8, value: &'a [u8], f: fn(u32) -> Self) -> Self {
        match <[u8; 4]>::try_from(value) {
            Ok(octets) => f(u32::from_be_bytes(octets)),
            Err(_) => Self::Unrecognized(code, value),
        }
    }

    fn str(code: u8, value: &'a [u8], f: fn(&'a str) -> Self) -> Self {
        match core::str::from_utf8(value) {
            Ok(str) => f(str),
            Err(_) => Self::Unrecognized(code, value),
        }
    }

    pub const fn code(&self) -> u8 {
        match self {
            Self::MessageType(_) => OPT_MESSAGE_TYPE,
            Self::ServerIdentifier(_) => OPT_SERVER_IDENTIFIER,
            Self::RequestedIpAddress(_) => OPT_REQUESTED_IP_ADDRESS,
            Self::IpAddressLeaseTime(_) => OPT_IP_ADDRESS_LEASE_TIME,
            Self::RenewalTime(_) => OPT_RENEWAL_TIME,
            Self::RebindingTime(_) => OPT_REBINDING_TIME,
            Self::SubnetMask(_) => OPT_SUBNET_MASK,
            Self::BroadcastAddress(_) => OPT_BROADCAST_ADDRESS,
            Self::Router(_) => OPT_ROUTER,
            Self::DomainNameServer(_) => OPT_DOMAIN_NAME_SERVER,
            Self::HostName(_) => OPT_HOST_NAME,
            Self::DomainName(_) => OPT_DOMAIN_NAME,
            Self::Message(_) => OPT_MESSAGE,
            Self::ParameterRequestList(_) => OPT_PARAMETER_REQUEST_LIST,
            Self::MaxMessageSize(_) => OPT_MAX_MESSAGE_SIZE,
            Self::ClientIdentifier(_) => OPT_CLIENT_IDENTIFIER,
            Self::Unrecognized(code, _) => *code,
        }
    }

    /// Total length of the option value, before any splitting into TLVs
    pub fn value_len(&self) -> usize {
        match self {
            Self::MessageType(_) => 1,
            Self::ServerIdentifier(_)
            | Self::RequestedIpAddress(_)
            | Self::IpAddressLeaseTime(_)
            | Self::RenewalTime(_)
            | Self::RebindingTime(_)
            | Self::SubnetMask(_)
            | Self::BroadcastAddress(_) => 4,
            Self::Router(addrs) | Self::DomainNameServer(addrs) => addrs.byte_len(),
            Self::HostName(str) | Self::DomainName(str) | Self::Message(str) => str.len(),
            Self::ParameterRequestList(data)
            | Self::ClientIdentifier(data)
            | Self::Unrecognized(_, data) => data.len(),
            Self::MaxMessageSize(_) => 2,
        }
    }

    /// Feeds the option value to `f`, piece by piece
    pub fn value<F, E>(&self, mut f: F) -> Result<(), E>
    where
        F: FnMut(&[u8]) -> Result<(), E>,
    {
        match self {
            Self::MessageType(mt) => f(&[*mt as u8]),
            Self::ServerIdentifier(addr)
            | Self::RequestedIpAddress(addr)
            | Self::SubnetMask(addr)
            | Self::BroadcastAddress(addr) => f(&addr.octets()),
            Self::IpAddressLeaseTime(secs) | Self::RenewalTime(secs) | Self::RebindingTime(secs) => {
                f(&secs.to_be_bytes())
            }
            Self::Router(addrs) | Self::DomainNameServer(addrs) => {
                for addr in addrs.iter() {
                    f(&addr.octets())?;
                }

                Ok(())
            }
            Self::HostName(str) | Self::DomainName(str) | Self::Message(str) => f(str.as_bytes()),
            Self::ParameterRequestList(data)
            | Self::ClientIdentifier(data)
            | Self::Unrecognized(_, data) => f(data),
            Self::MaxMessageSize(size) => f(&size.to_be_bytes()),
        }
    }
}

/// The option stream of a [`crate::packet::Packet`].
///
/// For decoded packets this holds the raw option bytes of the options field
/// and - when the overload option is present - of the `file` and `sname`
/// header fields, in that interpretation order. For packets under
/// construction, it holds a caller-provided slice of typed options.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Options<'a>(OptionsInner<'a>);

impl<'a> Options<'a> {
    pub const fn new(options: &'a [DhcpOption<'a>]) -> Self {
        Self(OptionsInner::DataSlice(options))
    }

    pub(crate) const fn regions(opts: &'a [u8], file: &'a [u8], sname: &'a [u8]) -> Self {
        Self(OptionsInner::Regions([opts, file, sname]))
    }

    /// An empty buffer, to be filled in and passed to [`Options::new`]
    #[inline(always)]
    pub const fn buf() -> [DhcpOption<'a>; 8] {
        [DhcpOption::Message(""); 8]
    }

    pub fn discover(
        requested_ip: Option<core::net::Ipv4Addr>,
        max_size: u16,
        params: &'a [u8],
        client_id: &'a [u8],
        buf: &'a mut [DhcpOption<'a>],
    ) -> Self {
        buf[0] = DhcpOption::MessageType(MessageType::Discover);

        let mut offset = 1;

        if let Some(ip) = requested_ip {
            buf[offset] = DhcpOption::RequestedIpAddress(ip);
            offset += 1;
        }

        Self::finish_request(max_size, params, client_id, buf, offset)
    }

    pub fn request(
        server_id: Option<core::net::Ipv4Addr>,
        requested_ip: Option<core::net::Ipv4Addr>,
        max_size: u16,
        params: &'a [u8],
        client_id: &'a [u8],
        buf: &'a mut [DhcpOption<'a>],
    ) -> Self {
        buf[0] = DhcpOption::MessageType(MessageType::Request);

        let mut offset = 1;

        if let Some(ip) = server_id {
            buf[offset] = DhcpOption::ServerIdentifier(ip);
            offset += 1;
        }

        if let Some(ip) = requested_ip {
            buf[offset] = DhcpOption::RequestedIpAddress(ip);
            offset += 1;
        }

        Self::finish_request(max_size, params, client_id, buf, offset)
    }

    pub fn inform(
        max_size: u16,
        params: &'a [u8],
        client_id: &'a [u8],
        buf: &'a mut [DhcpOption<'a>],
    ) -> Self {
        buf[0] = DhcpOption::MessageType(MessageType::Inform);

        Self::finish_request(max_size, params, client_id, buf, 1)
    }

    pub fn decline(
        server_id: core::net::Ipv4Addr,
        declined_ip: core::net::Ipv4Addr,
        client_id: &'a [u8],
        buf: &'a mut [DhcpOption<'a>],
    ) -> Self {
        buf[0] = DhcpOption::MessageType(MessageType::Decline);
        buf[1] = DhcpOption::ServerIdentifier(server_id);
        buf[2] = DhcpOption::RequestedIpAddress(declined_ip);

        let mut offset = 3;

        if !client_id.is_empty() {
            buf[offset] = DhcpOption::ClientIdentifier(client_id);
            offset += 1;
        }

        Self::new(&buf[..offset])
    }

    pub fn release(
        server_id: core::net::Ipv4Addr,
        client_id: &'a [u8],
        buf: &'a mut [DhcpOption<'a>],
    ) -> Self {
        buf[0] = DhcpOption::MessageType(MessageType::Release);
        buf[1] = DhcpOption::ServerIdentifier(server_id);

        let mut offset = 2;

        if !client_id.is_empty() {
            buf[offset] = DhcpOption::ClientIdentifier(client_id);
            offset += 1;
        }

        Self::new(&buf[..offset])
    }

    fn finish_request(
        max_size: u16,
        params: &'a [u8],
        client_id: &'a [u8],
        buf: &'a mut [DhcpOption<'a>],
        mut offset: usize,
    ) -> Self {
        buf[offset] = DhcpOption::MaxMessageSize(max_size);
        offset += 1;

        if !params.is_empty() {
            buf[offset] = DhcpOption::ParameterRequestList(params);
            offset += 1;
        }

        if !client_id.is_empty() {
            buf[offset] = DhcpOption::ClientIdentifier(client_id);
            offset += 1;
        }

        Self::new(&buf[..offset])
    }

    /// Iterates over the interpreted options, fragment by fragment.
    ///
    /// PAD, END and the overload option itself are never yielded.
    pub fn iter(&self) -> impl Iterator<Item = DhcpOption<'a>> + 'a {
        match &self.0 {
            OptionsInner::Regions(regions) => EitherIterator::First(
                RawOptionsIter::new(*regions).map(|(code, value)| DhcpOption::interpret(code, value)),
            ),
            OptionsInner::DataSlice(options) => EitherIterator::Second(options.iter().cloned()),
        }
    }

    /// Iterates over the raw `(code, value)` TLV fragments of a decoded
    /// packet, preserving unknown codes verbatim. Callers reassembling long
    /// options (RFC 3396) concatenate the values of equal codes in iteration
    /// order.
    pub fn raw_iter(&self) -> impl Iterator<Item = (u8, &'a [u8])> + 'a {
        let regions = match &self.0 {
            OptionsInner::Regions(regions) => *regions,
            // Only decoded packets carry raw TLVs
            OptionsInner::DataSlice(_) => [&[] as &[u8]; 3],
        };

        RawOptionsIter::new(regions)
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.iter().find_map(|option| {
            if let DhcpOption::MessageType(mt) = option {
                Some(mt)
            } else {
                None
            }
        })
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.iter().find_map(|option| {
            if let DhcpOption::ServerIdentifier(addr) = option {
                Some(addr)
            } else {
                None
            }
        })
    }

    pub fn lease_time(&self) -> Option<u32> {
        self.iter().find_map(|option| {
            if let DhcpOption::IpAddressLeaseTime(secs) = option {
                Some(secs)
            } else {
                None
            }
        })
    }

    pub fn renewal_time(&self) -> Option<u32> {
        self.iter().find_map(|option| {
            if let DhcpOption::RenewalTime(secs) = option {
                Some(secs)
            } else {
                None
            }
        })
    }

    pub fn rebinding_time(&self) -> Option<u32> {
        self.iter().find_map(|option| {
            if let DhcpOption::RebindingTime(secs) = option {
                Some(secs)
            } else {
                None
            }
        })
    }

    pub fn subnet_mask(&self) -> Option<Ipv4Addr> {
        self.iter().find_map(|option| {
            if let DhcpOption::SubnetMask(mask) = option {
                Some(mask)
            } else {
                None
            }
        })
    }

    pub fn router(&self) -> Option<Ipv4Addr> {
        self.iter().find_map(|option| {
            if let DhcpOption::Router(addrs) = option {
                addrs.iter().next()
            } else {
                None
            }
        })
    }

    pub(crate) fn as_data_slice(&self) -> Option<&'a [DhcpOption<'a>]> {
        match &self.0 {
            OptionsInner::DataSlice(options) => Some(options),
            OptionsInner::Regions(_) => None,
        }
    }

    /// Walks one option region, validating TLV framing.
    ///
    /// Returns the overload option value, when present and `main` is set
    /// (the overload option is only honored in the options field proper).
    pub(crate) fn validate_region(region: &[u8], main: bool) -> Result<Option<u8>, Error> {
        let mut bytes = BytesIn::new(region);
        let mut overload = None;

        loop {
            let code = match bytes.byte() {
                Ok(code) => code,
                Err(_) => return Err(Error::MissingEnd),
            };

            match code {
                OPT_PAD => continue,
                OPT_END => break,
                _ => {
                    let len = bytes.byte().map_err(|_| Error::OptionOverrun)? as usize;
                    let value = bytes.slice(len).map_err(|_| Error::OptionOverrun)?;

                    if code == OPT_OVERLOAD && main {
                        match value {
                            [v @ 1..=3] => overload = Some(*v),
                            _ => return Err(Error::InvalidOverload),
                        }
                    }
                }
            }
        }

        Ok(overload)
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
enum OptionsInner<'a> {
    /// Raw option bytes: options field, overloaded `file`, overloaded `sname`
    Regions([&'a [u8]; 3]),
    DataSlice(&'a [DhcpOption<'a>]),
}

struct RawOptionsIter<'a> {
    regions: [&'a [u8]; 3],
    region: usize,
    bytes: BytesIn<'a>,
}

impl<'a> RawOptionsIter<'a> {
    fn new(regions: [&'a [u8]; 3]) -> Self {
        Self {
            regions,
            region: 0,
            bytes: BytesIn::new(regions[0]),
        }
    }
}

impl<'a> Iterator for RawOptionsIter<'a> {
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let code = match self.bytes.byte() {
                Ok(OPT_PAD) => continue,
                Ok(OPT_END) | Err(_) => {
                    // Next region, if any
                    self.region += 1;
                    if self.region >= self.regions.len() {
                        return None;
                    }

                    self.bytes = BytesIn::new(self.regions[self.region]);
                    continue;
                }
                Ok(code) => code,
            };

            let len = self.bytes.byte().ok()? as usize;
            let value = self.bytes.slice(len).ok()?;

            if code == OPT_OVERLOAD {
                continue;
            }

            return Some((code, value));
        }
    }
}

/// A list of IPv4 addresses, either borrowed from the wire or from the caller
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Ipv4Addrs<'a>(Ipv4AddrsInner<'a>);

impl<'a> Ipv4Addrs<'a> {
    pub const fn new(addrs: &'a [Ipv4Addr]) -> Self {
        Self(Ipv4AddrsInner::DataSlice(addrs))
    }

    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> + 'a {
        self.0.iter()
    }

    fn byte_len(&self) -> usize {
        match &self.0 {
            Ipv4AddrsInner::ByteSlice(data) => data.len() / 4 * 4,
            Ipv4AddrsInner::DataSlice(data) => data.len() * 4,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum Ipv4AddrsInner<'a> {
    ByteSlice(&'a [u8]),
    DataSlice(&'a [Ipv4Addr]),
}

impl<'a> Ipv4AddrsInner<'a> {
    fn iter(&self) -> impl Iterator<Item = Ipv4Addr> + 'a {
        match self {
            Self::ByteSlice(data) => {
                EitherIterator::First((0..data.len() / 4).map(|index| {
                    let octets: [u8; 4] = data[index * 4..index * 4 + 4].try_into().unwrap();

                    octets.into()
                }))
            }
            Self::DataSlice(data) => EitherIterator::Second(data.iter().cloned()),
        }
    }
}

enum EitherIterator<F, S> {
    First(F),
    Second(S),
}

impl<F, S> Iterator for EitherIterator<F, S>
where
    F: Iterator,
    S: Iterator<Item = F::Item>,
{
    type Item = F::Item;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::First(iter) => iter.next(),
            Self::Second(iter) => iter.next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpret_tolerates_bad_lengths() {
        assert_eq!(
            DhcpOption::interpret(OPT_IP_ADDRESS_LEASE_TIME, &[0, 0, 14, 16]),
            DhcpOption::IpAddressLeaseTime(3600)
        );

        // A three-byte lease time is preserved, not rejected
        assert_eq!(
            DhcpOption::interpret(OPT_IP_ADDRESS_LEASE_TIME, &[0, 14, 16]),
            DhcpOption::Unrecognized(OPT_IP_ADDRESS_LEASE_TIME, &[0, 14, 16])
        );

        assert_eq!(
            DhcpOption::interpret(OPT_MESSAGE_TYPE, &[42]),
            DhcpOption::Unrecognized(OPT_MESSAGE_TYPE, &[42])
        );
    }

    #[test]
    fn raw_iter_spans_regions_and_skips_noise() {
        let opts: &[u8] = &[
            OPT_PAD,
            OPT_MESSAGE_TYPE,
            1,
            5,
            OPT_OVERLOAD,
            1,
            3,
            OPT_END,
            0xAA, // trailing garbage after END is ignored
        ];
        let file: &[u8] = &[200, 2, 1, 2, OPT_END];
        let sname: &[u8] = &[200, 1, 3, OPT_END];

        let options = Options::regions(opts, file, sname);

        let raw: std::vec::Vec<_> = options.raw_iter().collect();
        assert_eq!(
            raw,
            &[
                (OPT_MESSAGE_TYPE, &[5u8] as &[u8]),
                (200, &[1, 2]),
                (200, &[3]),
            ]
        );

        assert_eq!(options.message_type(), Some(MessageType::Ack));
    }

    #[test]
    fn region_validation() {
        assert_eq!(Options::validate_region(&[OPT_END], true), Ok(None));
        assert_eq!(
            Options::validate_region(&[OPT_OVERLOAD, 1, 2, OPT_END], true),
            Ok(Some(2))
        );
        assert_eq!(
            Options::validate_region(&[OPT_OVERLOAD, 1, 7, OPT_END], true),
            Err(Error::InvalidOverload)
        );
        assert_eq!(
            Options::validate_region(&[53, 1, 1], true),
            Err(Error::MissingEnd)
        );
        assert_eq!(
            Options::validate_region(&[53, 200, 1, OPT_END], true),
            Err(Error::OptionOverrun)
        );
    }
}
