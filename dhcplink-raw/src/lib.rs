#![cfg_attr(not(feature = "std"), no_std)]
#![allow(clippy::uninlined_format_args)]

//! IPv4 and UDP header synthesis and parsing for the link-layer leg of a
//! DHCP exchange, where datagrams are assembled by hand because the
//! interface has no address yet.

use core::net::SocketAddrV4;

use self::udp::UdpPacketHeader;

#[cfg(test)]
extern crate std;

pub mod bytes;
pub mod filter;
pub mod ip;
pub mod udp;

use bytes::BytesIn;

/// An error type for decoding and encoding IP and UDP packets
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Error {
    DataUnderflow,
    BufferOverflow,
    InvalidFormat,
    InvalidChecksum,
}

impl From<bytes::Error> for Error {
    fn from(value: bytes::Error) -> Self {
        match value {
            bytes::Error::BufferOverflow => Self::BufferOverflow,
            bytes::Error::DataUnderflow => Self::DataUnderflow,
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let str = match self {
            Self::DataUnderflow => "Data underflow",
            Self::BufferOverflow => "Buffer overflow",
            Self::InvalidFormat => "Invalid format",
            Self::InvalidChecksum => "Invalid checksum",
        };

        write!(f, "{}", str)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Unwraps a raw IPv4 frame down to a DHCP payload destined to
/// `client_port`.
///
/// Returns `Ok(None)` for traffic the client must silently ignore:
/// fragments, non-UDP protocols, foreign ports. `verify_udp_checksum` is
/// passed as `false` only when the kernel already validated the checksum;
/// a zero checksum field means the sender computed none and is accepted
/// either way (RFC 768).
pub fn decode_frame(
    frame: &[u8],
    client_port: u16,
    verify_udp_checksum: bool,
) -> Result<Option<(SocketAddrV4, SocketAddrV4, &[u8])>, Error> {
    let Some((ip_hdr, ip_payload)) = ip::Ipv4PacketHeader::decode_with_payload(frame)? else {
        return Ok(None);
    };

    if ip_hdr.p != UdpPacketHeader::PROTO {
        return Ok(None);
    }

    let Some((udp_hdr, udp_payload)) = UdpPacketHeader::decode_with_payload(
        ip_payload,
        ip_hdr.src,
        ip_hdr.dst,
        Some(client_port),
        verify_udp_checksum,
    )?
    else {
        return Ok(None);
    };

    Ok(Some((
        SocketAddrV4::new(ip_hdr.src, udp_hdr.src),
        SocketAddrV4::new(ip_hdr.dst, udp_hdr.dst),
        udp_payload,
    )))
}

/// Wraps the DHCP payload produced by `encoder` in UDP and IPv4 headers
pub fn encode_frame<F>(
    buf: &mut [u8],
    src: SocketAddrV4,
    dst: SocketAddrV4,
    encoder: F,
) -> Result<&[u8], Error>
where
    F: FnOnce(&mut [u8]) -> Result<usize, Error>,
{
    let mut ip_hdr = ip::Ipv4PacketHeader::new(*src.ip(), *dst.ip(), UdpPacketHeader::PROTO);

    ip_hdr.encode_with_payload(buf, |buf, ip_hdr| {
        let mut udp_hdr = UdpPacketHeader::new(src.port(), dst.port());

        let len = udp_hdr.encode_with_payload(buf, ip_hdr.src, ip_hdr.dst, encoder)?.len();

        Ok(len)
    })
}

pub fn checksum_accumulate(bytes: &[u8], checksum_word: usize) -> u32 {
    let mut bytes = BytesIn::new(bytes);

    let mut sum: u32 = 0;
    while !bytes.is_empty() {
        let skip = (bytes.offset() >> 1) == checksum_word;
        let arr = bytes
            .arr()
            .ok()
            .unwrap_or_else(|| [bytes.byte().unwrap_or(0), 0]);

        let word = if skip { 0 } else { u16::from_be_bytes(arr) };

        sum += word as u32;
    }

    sum
}

pub fn checksum_finish(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum >> 16) + (sum & 0xffff);
    }

    !sum as u16
}

#[cfg(test)]
mod tests {
    use core::net::Ipv4Addr;

    use super::*;

    fn frame(payload: &[u8]) -> std::vec::Vec<u8> {
        let mut buf = [0; 1500];

        let data = encode_frame(
            &mut buf,
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 67),
            SocketAddrV4::new(Ipv4Addr::BROADCAST, 68),
            |buf| {
                buf[..payload.len()].copy_from_slice(payload);

                Ok(payload.len())
            },
        )
        .unwrap();

        data.to_vec()
    }

    #[test]
    fn round_trip_with_checksums() {
        let data = frame(b"dhcp payload");

        let (src, dst, payload) = decode_frame(&data, 68, true).unwrap().unwrap();

        assert_eq!(src, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 67));
        assert_eq!(dst, SocketAddrV4::new(Ipv4Addr::BROADCAST, 68));
        assert_eq!(payload, b"dhcp payload");
    }

    #[test]
    fn foreign_port_is_ignored() {
        let data = frame(b"dhcp payload");

        assert_eq!(decode_frame(&data, 69, true), Ok(None));
    }

    #[test]
    fn corrupted_udp_checksum() {
        let mut data = frame(b"dhcp payload");

        let last = data.len() - 1;
        data[last] ^= 0xFF;

        // Kernel did not verify: reject in user space
        assert_eq!(decode_frame(&data, 68, true), Err(Error::InvalidChecksum));

        // Kernel verified: trust it
        assert!(decode_frame(&data, 68, false).unwrap().is_some());
    }

    #[test]
    fn zero_udp_checksum_is_accepted() {
        let mut data = frame(b"dhcp payload");

        let ihl = (data[0] & 0x0f) as usize * 4;
        data[ihl + 6] = 0;
        data[ihl + 7] = 0;

        assert!(decode_frame(&data, 68, true).unwrap().is_some());
    }

    #[test]
    fn fragments_are_ignored() {
        let mut data = frame(b"dhcp payload");

        // More-fragments flag; the IP checksum is patched to keep the
        // header itself valid
        data[6] |= 0x20;
        let checksum = ip::Ipv4PacketHeader::checksum(&data);
        ip::Ipv4PacketHeader::inject_checksum(&mut data, checksum);

        assert_eq!(decode_frame(&data, 68, true), Ok(None));
    }

    #[test]
    fn corrupted_ip_checksum_is_rejected() {
        let mut data = frame(b"dhcp payload");

        data[10] ^= 0xFF;

        assert_eq!(decode_frame(&data, 68, true), Err(Error::InvalidChecksum));
    }
}
