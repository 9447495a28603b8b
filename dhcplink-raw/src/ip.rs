use core::net::Ipv4Addr;

use log::trace;

use super::bytes::{BytesIn, BytesOut};
use super::{checksum_accumulate, checksum_finish, Error};

/// An IPv4 header
#[derive(Clone, Debug)]
pub struct Ipv4PacketHeader {
    /// Version
    pub version: u8,
    /// Header length, bytes
    pub hlen: u8,
    /// Type of service
    pub tos: u8,
    /// Total length
    pub len: u16,
    /// Identification
    pub id: u16,
    /// Flags and fragment offset
    pub off: u16,
    /// Time to live
    pub ttl: u8,
    /// Protocol
    pub p: u8,
    /// Header checksum
    pub sum: u16,
    /// Source address
    pub src: Ipv4Addr,
    /// Destination address
    pub dst: Ipv4Addr,
}

impl Ipv4PacketHeader {
    pub const MIN_SIZE: usize = 20;
    pub const CHECKSUM_WORD: usize = 5;

    /// Don't-fragment flag
    pub const IP_DF: u16 = 0x4000;
    /// More-fragments flag
    pub const IP_MF: u16 = 0x2000;
    /// Fragment offset mask
    pub const IP_OFFMASK: u16 = 0x1fff;

    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, proto: u8) -> Self {
        Self {
            version: 4,
            hlen: Self::MIN_SIZE as _,
            tos: 0,
            len: Self::MIN_SIZE as _,
            id: 0,
            off: 0,
            ttl: 64,
            p: proto,
            sum: 0,
            src,
            dst,
        }
    }

    /// Whether this header describes anything but a whole, unfragmented
    /// datagram. DHCP never legitimately fragments; fragments are dropped
    /// the same way the kernel-side filter drops them.
    pub fn is_fragment(&self) -> bool {
        self.off & (Self::IP_MF | Self::IP_OFFMASK) != 0
    }

    /// Decodes the header from a byte slice
    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(data);

        let vhl = bytes.byte()?;

        Ok(Self {
            version: vhl >> 4,
            hlen: (vhl & 0x0f) * 4,
            tos: bytes.byte()?,
            len: u16::from_be_bytes(bytes.arr()?),
            id: u16::from_be_bytes(bytes.arr()?),
            off: u16::from_be_bytes(bytes.arr()?),
            ttl: bytes.byte()?,
            p: bytes.byte()?,
            sum: u16::from_be_bytes(bytes.arr()?),
            src: u32::from_be_bytes(bytes.arr()?).into(),
            dst: u32::from_be_bytes(bytes.arr()?).into(),
        })
    }

    /// Encodes the header into the provided buf slice
    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], Error> {
        let mut bytes = BytesOut::new(buf);

        bytes
            .byte((self.version << 4) | (self.hlen / 4))?
            .byte(self.tos)?
            .push(&u16::to_be_bytes(self.len))?
            .push(&u16::to_be_bytes(self.id))?
            .push(&u16::to_be_bytes(self.off))?
            .byte(self.ttl)?
            .byte(self.p)?
            .push(&u16::to_be_bytes(self.sum))?
            .push(&u32::to_be_bytes(self.src.into()))?
            .push(&u32::to_be_bytes(self.dst.into()))?;

        let len = bytes.len();

        Ok(&buf[..len])
    }

    /// Encodes the header and the provided payload into the provided buf
    /// slice, computing the header checksum last
    pub fn encode_with_payload<'o, F>(
        &mut self,
        buf: &'o mut [u8],
        encoder: F,
    ) -> Result<&'o [u8], Error>
    where
        F: FnOnce(&mut [u8], &Self) -> Result<usize, Error>,
    {
        let hdr_len = self.hlen as usize;
        if hdr_len < Self::MIN_SIZE || buf.len() < hdr_len {
            Err(Error::BufferOverflow)?;
        }

        let (hdr_buf, payload_buf) = buf.split_at_mut(hdr_len);

        let payload_len = encoder(payload_buf, self)?;

        let len = hdr_len + payload_len;
        self.len = len as _;

        self.encode(hdr_buf)?;
        hdr_buf[Self::MIN_SIZE..hdr_len].fill(0);

        let checksum = Self::checksum(hdr_buf);
        self.sum = checksum;

        Self::inject_checksum(hdr_buf, checksum);

        Ok(&buf[..len])
    }

    /// Decodes and verifies the header, returning it along with the payload.
    ///
    /// Fragments yield `Ok(None)`; a checksum mismatch is an error.
    pub fn decode_with_payload(packet: &[u8]) -> Result<Option<(Self, &[u8])>, Error> {
        let hdr = Self::decode(packet)?;

        if hdr.version != 4 {
            Err(Error::InvalidFormat)?;
        }

        if hdr.is_fragment() {
            trace!("Dropping IP fragment from {}", hdr.src);
            return Ok(None);
        }

        let len = hdr.len as usize;
        let hdr_len = hdr.hlen as usize;
        if hdr_len < Self::MIN_SIZE || len < hdr_len || packet.len() < len {
            Err(Error::DataUnderflow)?;
        }

        let checksum = Self::checksum(packet);

        trace!(
            "IP header decoded, src={}, dst={}, hlen={}, len={}, checksum={}, ours={}",
            hdr.src,
            hdr.dst,
            hdr.hlen,
            hdr.len,
            hdr.sum,
            checksum
        );

        if checksum != hdr.sum {
            Err(Error::InvalidChecksum)?;
        }

        Ok(Some((hdr, &packet[hdr_len..len])))
    }

    /// Injects the checksum into an already encoded header
    pub fn inject_checksum(packet: &mut [u8], checksum: u16) {
        let checksum = checksum.to_be_bytes();

        let offset = Self::CHECKSUM_WORD << 1;
        packet[offset] = checksum[0];
        packet[offset + 1] = checksum[1];
    }

    /// Computes the checksum over an already encoded header
    pub fn checksum(packet: &[u8]) -> u16 {
        let hlen = (packet[0] & 0x0f) as usize * 4;

        let sum = checksum_accumulate(&packet[..hlen], Self::CHECKSUM_WORD);

        checksum_finish(sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_detection() {
        let mut hdr = Ipv4PacketHeader::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::BROADCAST,
            super::super::udp::UdpPacketHeader::PROTO,
        );

        assert!(!hdr.is_fragment());

        hdr.off = Ipv4PacketHeader::IP_DF;
        assert!(!hdr.is_fragment());

        hdr.off = Ipv4PacketHeader::IP_MF;
        assert!(hdr.is_fragment());

        hdr.off = 3; // nonzero offset, flags clear
        assert!(hdr.is_fragment());
    }

    #[test]
    fn header_round_trip() {
        let mut buf = [0; 64];

        let mut hdr = Ipv4PacketHeader::new(
            Ipv4Addr::new(192, 168, 0, 2),
            Ipv4Addr::new(192, 168, 0, 1),
            17,
        );

        let data = hdr
            .encode_with_payload(&mut buf, |payload, _| {
                payload[..4].copy_from_slice(&[1, 2, 3, 4]);

                Ok(4)
            })
            .unwrap()
            .to_vec();

        let (decoded, payload) = Ipv4PacketHeader::decode_with_payload(&data).unwrap().unwrap();

        assert_eq!(decoded.src, hdr.src);
        assert_eq!(decoded.dst, hdr.dst);
        assert_eq!(decoded.len as usize, data.len());
        assert_eq!(payload, &[1, 2, 3, 4]);
    }
}
