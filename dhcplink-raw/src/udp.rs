use core::net::Ipv4Addr;

use log::trace;

use super::bytes::{BytesIn, BytesOut};
use super::{checksum_accumulate, checksum_finish, Error};

/// A UDP header
#[derive(Clone, Debug)]
pub struct UdpPacketHeader {
    /// Source port
    pub src: u16,
    /// Destination port
    pub dst: u16,
    /// UDP length
    pub len: u16,
    /// UDP checksum
    pub sum: u16,
}

impl UdpPacketHeader {
    pub const PROTO: u8 = 17;

    pub const SIZE: usize = 8;
    pub const CHECKSUM_WORD: usize = 3;

    pub fn new(src: u16, dst: u16) -> Self {
        Self {
            src,
            dst,
            len: 0,
            sum: 0,
        }
    }

    /// Decodes the header from a byte slice
    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(data);

        Ok(Self {
            src: u16::from_be_bytes(bytes.arr()?),
            dst: u16::from_be_bytes(bytes.arr()?),
            len: u16::from_be_bytes(bytes.arr()?),
            sum: u16::from_be_bytes(bytes.arr()?),
        })
    }

    /// Encodes the header into the provided buf slice
    pub fn encode<'o>(&self, buf: &'o mut [u8]) -> Result<&'o [u8], Error> {
        let mut bytes = BytesOut::new(buf);

        bytes
            .push(&u16::to_be_bytes(self.src))?
            .push(&u16::to_be_bytes(self.dst))?
            .push(&u16::to_be_bytes(self.len))?
            .push(&u16::to_be_bytes(self.sum))?;

        let len = bytes.len();

        Ok(&buf[..len])
    }

    /// Encodes the header and the provided payload into the provided buf
    /// slice, computing the pseudo-header checksum last
    pub fn encode_with_payload<'o, F>(
        &mut self,
        buf: &'o mut [u8],
        src: Ipv4Addr,
        dst: Ipv4Addr,
        encoder: F,
    ) -> Result<&'o [u8], Error>
    where
        F: FnOnce(&mut [u8]) -> Result<usize, Error>,
    {
        if buf.len() < Self::SIZE {
            Err(Error::BufferOverflow)?;
        }

        let (hdr_buf, payload_buf) = buf.split_at_mut(Self::SIZE);

        let payload_len = encoder(payload_buf)?;

        let len = Self::SIZE + payload_len;
        self.len = len as _;

        self.encode(hdr_buf)?;

        let packet = &mut buf[..len];

        // A transmitted zero means "no checksum"; an actual zero result is
        // sent as its ones'-complement equivalent (RFC 768)
        let checksum = match Self::checksum(packet, src, dst) {
            0 => 0xFFFF,
            sum => sum,
        };
        self.sum = checksum;

        Self::inject_checksum(packet, checksum);

        Ok(packet)
    }

    /// Decodes the header, vets the destination port and optionally the
    /// checksum, and returns the header along with the payload.
    ///
    /// A zero checksum field means the sender computed none, and passes
    /// regardless of `verify_checksum`.
    pub fn decode_with_payload<'o>(
        packet: &'o [u8],
        src: Ipv4Addr,
        dst: Ipv4Addr,
        filter_dst: Option<u16>,
        verify_checksum: bool,
    ) -> Result<Option<(Self, &'o [u8])>, Error> {
        let hdr = Self::decode(packet)?;

        if let Some(filter_dst) = filter_dst {
            if filter_dst != hdr.dst {
                return Ok(None);
            }
        }

        let len = hdr.len as usize;
        if len < Self::SIZE || packet.len() < len {
            Err(Error::DataUnderflow)?;
        }

        if hdr.sum == 0 {
            trace!("UDP datagram from {} carries no checksum", src);
        } else if verify_checksum {
            let checksum = Self::checksum(&packet[..len], src, dst);

            trace!(
                "UDP header decoded, src={}, dst={}, len={}, checksum={}, ours={}",
                hdr.src,
                hdr.dst,
                hdr.len,
                hdr.sum,
                checksum
            );

            // The on-wire 0xFFFF stands for a computed zero
            if checksum != hdr.sum && !(checksum == 0 && hdr.sum == 0xFFFF) {
                Err(Error::InvalidChecksum)?;
            }
        }

        Ok(Some((hdr, &packet[Self::SIZE..len])))
    }

    /// Injects the checksum into an already encoded packet
    pub fn inject_checksum(packet: &mut [u8], checksum: u16) {
        let checksum = checksum.to_be_bytes();

        let offset = Self::CHECKSUM_WORD << 1;
        packet[offset] = checksum[0];
        packet[offset + 1] = checksum[1];
    }

    /// Computes the pseudo-header checksum over an already encoded packet
    pub fn checksum(packet: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> u16 {
        let mut pseudo = [0; 12];

        pseudo[..4].copy_from_slice(&src.octets());
        pseudo[4..8].copy_from_slice(&dst.octets());
        pseudo[9] = Self::PROTO;
        pseudo[10..].copy_from_slice(&u16::to_be_bytes(packet.len() as u16));

        let sum =
            checksum_accumulate(&pseudo, usize::MAX) + checksum_accumulate(packet, Self::CHECKSUM_WORD);

        checksum_finish(sum)
    }
}
