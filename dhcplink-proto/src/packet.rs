use core::net::Ipv4Addr;

use crate::bytes::{BytesIn, BytesOut};
use crate::options::{DhcpOption, Options, MAX_TLV_LEN, OPT_END, OPT_OVERLOAD};
use crate::Error;

/// A BOOTP/DHCP message
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Packet<'a> {
    pub reply: bool,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub broadcast: bool,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    /// Raw `sname` header field; consumed by `options` when overloaded
    pub sname: &'a [u8],
    /// Raw `file` header field; consumed by `options` when overloaded
    pub file: &'a [u8],
    pub options: Options<'a>,
}

impl<'a> Packet<'a> {
    pub const COOKIE: [u8; 4] = [99, 130, 83, 99];

    pub const BOOT_REQUEST: u8 = 1; // From Client
    pub const BOOT_REPLY: u8 = 2; // From Server

    /// Offset of the fixed header fields up to and including `chaddr`
    const CHADDR_END: usize = 44;
    const SNAME_SIZE: usize = 64;
    const FILE_SIZE: usize = 128;
    /// Fixed header plus the magic cookie
    pub const MIN_SIZE: usize = Self::CHADDR_END + Self::SNAME_SIZE + Self::FILE_SIZE + 4;

    /// Minimum BOOTP message size on the wire (RFC 1542); shorter encodings
    /// are padded up to this
    pub const MIN_WIRE_SIZE: usize = 300;

    const FLAG_BROADCAST: u16 = 0x8000;

    /// Creates a client-to-server message
    #[allow(clippy::too_many_arguments)]
    pub fn new_request(
        htype: u8,
        hlen: u8,
        chaddr: [u8; 16],
        xid: u32,
        secs: u16,
        broadcast: bool,
        ciaddr: Ipv4Addr,
        options: Options<'a>,
    ) -> Self {
        Self {
            reply: false,
            htype,
            hlen,
            hops: 0,
            xid,
            secs,
            broadcast,
            ciaddr,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: &[],
            file: &[],
            options,
        }
    }

    /// Parses the packet from a byte slice
    pub fn decode(data: &'a [u8]) -> Result<Self, Error> {
        let mut bytes = BytesIn::new(data);

        let op = bytes.byte()?;
        let htype = bytes.byte()?;
        let hlen = bytes.byte()?;

        if hlen as usize > 16 {
            Err(Error::InvalidHlen)?;
        }

        let hops = bytes.byte()?;
        let xid = u32::from_be_bytes(bytes.arr()?);
        let secs = u16::from_be_bytes(bytes.arr()?);
        let flags = u16::from_be_bytes(bytes.arr()?);
        let ciaddr = bytes.arr()?.into();
        let yiaddr = bytes.arr()?.into();
        let siaddr = bytes.arr()?.into();
        let giaddr = bytes.arr()?.into();
        let chaddr = bytes.arr()?;
        let sname = bytes.slice(Self::SNAME_SIZE)?;
        let file = bytes.slice(Self::FILE_SIZE)?;

        if bytes.arr::<4>()? != Self::COOKIE {
            Err(Error::MissingCookie)?;
        }

        let opts = bytes.remaining();

        let overload = Options::validate_region(opts, true)?;
        let file_used = matches!(overload, Some(1) | Some(3));
        let sname_used = matches!(overload, Some(2) | Some(3));

        if file_used {
            Options::validate_region(file, false)?;
        }

        if sname_used {
            Options::validate_region(sname, false)?;
        }

        Ok(Self {
            reply: op == Self::BOOT_REPLY,
            htype,
            hlen,
            hops,
            xid,
            secs,
            broadcast: flags & Self::FLAG_BROADCAST != 0,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            sname,
            file,
            options: Options::regions(
                opts,
                if file_used { file } else { &[] },
                if sname_used { sname } else { &[] },
            ),
        })
    }

    /// Encodes the packet into the provided buf slice.
    ///
    /// `max_size` caps the total message size. When the options do not fit
    /// the options field within that cap, they spill over into the `file`
    /// and then the `sname` header fields, announced with the overload
    /// option (RFC 2132 section 9.3). Option values longer than 255 bytes
    /// are split into successive TLVs with the same code (RFC 3396).
    pub fn encode<'o>(&self, buf: &'o mut [u8], max_size: usize) -> Result<&'o [u8], Error> {
        let effective = buf.len().min(max_size);
        if effective < Self::MIN_WIRE_SIZE {
            Err(Error::BufferOverflow)?;
        }

        {
            let mut bytes = BytesOut::new(buf);

            bytes
                .byte(if self.reply {
                    Self::BOOT_REPLY
                } else {
                    Self::BOOT_REQUEST
                })?
                .byte(self.htype)?
                .byte(self.hlen)?
                .byte(self.hops)?
                .push(&u32::to_be_bytes(self.xid))?
                .push(&u16::to_be_bytes(self.secs))?
                .push(&u16::to_be_bytes(if self.broadcast {
                    Self::FLAG_BROADCAST
                } else {
                    0
                }))?
                .push(&self.ciaddr.octets())?
                .push(&self.yiaddr.octets())?
                .push(&self.siaddr.octets())?
                .push(&self.giaddr.octets())?
                .push(&self.chaddr)?
                .fill(Self::SNAME_SIZE + Self::FILE_SIZE, 0)?
                .push(&Self::COOKIE)?;
        }

        let total: usize = self.options.iter().map(|option| encoded_len(&option)).sum();

        // One byte reserved for END in every region the options land in
        let plain_capacity = effective - Self::MIN_SIZE - 1;

        let sname_start = Self::CHADDR_END;
        let file_start = sname_start + Self::SNAME_SIZE;

        let mut writer = if total <= plain_capacity {
            OptionWriter::new(buf, &[(Self::MIN_SIZE, effective)])
        } else {
            let main_capacity = plain_capacity - encoded_len(&DhcpOption::Unrecognized(OPT_OVERLOAD, &[0]));

            // Conservative slack for the extra TLV headers introduced by
            // region-boundary splits
            let overload = if total + 4 <= main_capacity + Self::FILE_SIZE - 1 {
                1
            } else {
                3
            };

            let mut writer = if overload == 1 {
                OptionWriter::new(
                    buf,
                    &[
                        (Self::MIN_SIZE, effective),
                        (file_start, file_start + Self::FILE_SIZE),
                    ],
                )
            } else {
                OptionWriter::new(
                    buf,
                    &[
                        (Self::MIN_SIZE, effective),
                        (file_start, file_start + Self::FILE_SIZE),
                        (sname_start, sname_start + Self::SNAME_SIZE),
                    ],
                )
            };

            writer.write_option(&DhcpOption::Unrecognized(OPT_OVERLOAD, &[overload]))?;

            writer
        };

        for option in self.options.iter() {
            writer.write_option(&option)?;
        }

        let main_used = writer.finish();

        let mut len = Self::MIN_SIZE + main_used;
        if len < Self::MIN_WIRE_SIZE {
            buf[len..Self::MIN_WIRE_SIZE].fill(0);
            len = Self::MIN_WIRE_SIZE;
        }

        Ok(&buf[..len])
    }
}

fn encoded_len(option: &DhcpOption) -> usize {
    let value = option.value_len();

    if value == 0 {
        2
    } else {
        value + 2 * value.div_ceil(MAX_TLV_LEN)
    }
}

/// Serializes TLVs across up to three disjoint regions of one buffer,
/// starting new same-code TLVs at the 255-byte mark and at region boundaries,
/// and terminating every touched region with END
struct OptionWriter<'b> {
    buf: &'b mut [u8],
    regions: [(usize, usize); 3],
    count: usize,
    region: usize,
    pos: usize,
    main_used: usize,
    chunk_remaining: usize,
}

impl<'b> OptionWriter<'b> {
    fn new(buf: &'b mut [u8], regions: &[(usize, usize)]) -> Self {
        let mut fixed = [(0, 0); 3];
        fixed[..regions.len()].copy_from_slice(regions);

        Self {
            buf,
            regions: fixed,
            count: regions.len(),
            region: 0,
            pos: regions[0].0,
            main_used: 0,
            chunk_remaining: 0,
        }
    }

    /// Space left in the current region, with the END byte reserved
    fn space(&self) -> usize {
        self.regions[self.region].1 - 1 - self.pos
    }

    fn advance_region(&mut self) -> Result<(), Error> {
        self.buf[self.pos] = OPT_END;

        if self.region == 0 {
            self.main_used = self.pos + 1 - self.regions[0].0;
        }

        self.region += 1;
        if self.region >= self.count {
            Err(Error::BufferOverflow)?;
        }

        self.pos = self.regions[self.region].0;

        Ok(())
    }

    fn write_option(&mut self, option: &DhcpOption) -> Result<(), Error> {
        let mut remaining = option.value_len();
        let code = option.code();

        if remaining == 0 {
            while self.space() < 2 {
                self.advance_region()?;
            }

            self.buf[self.pos] = code;
            self.buf[self.pos + 1] = 0;
            self.pos += 2;

            return Ok(());
        }

        self.chunk_remaining = 0;

        option.value(|piece| self.push_value(code, piece, &mut remaining))?;

        debug_assert_eq!(remaining, 0);

        Ok(())
    }

    fn push_value(&mut self, code: u8, mut piece: &[u8], remaining: &mut usize) -> Result<(), Error> {
        while !piece.is_empty() {
            if self.chunk_remaining == 0 {
                // Start a new TLV: code, length, at least one value byte
                while self.space() < 3 {
                    self.advance_region()?;
                }

                let chunk = (self.space() - 2).min(MAX_TLV_LEN).min(*remaining);

                self.buf[self.pos] = code;
                self.buf[self.pos + 1] = chunk as u8;
                self.pos += 2;
                self.chunk_remaining = chunk;
            }

            let len = piece.len().min(self.chunk_remaining);
            self.buf[self.pos..self.pos + len].copy_from_slice(&piece[..len]);
            self.pos += len;
            self.chunk_remaining -= len;
            *remaining -= len;
            piece = &piece[len..];
        }

        Ok(())
    }

    /// Terminates the current region and reports the bytes used in the
    /// options field proper, END included
    fn finish(mut self) -> usize {
        self.buf[self.pos] = OPT_END;

        if self.region == 0 {
            self.main_used = self.pos + 1 - self.regions[0].0;
        }

        // Declared regions the options never reached still need terminating
        for region in self.region + 1..self.count {
            self.buf[self.regions[region].0] = OPT_END;
        }

        self.main_used
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{MessageType, OPT_IP_ADDRESS_LEASE_TIME, OPT_MESSAGE_TYPE};

    fn request<'a>(options: &'a [DhcpOption<'a>]) -> Packet<'a> {
        let mut chaddr = [0; 16];
        chaddr[..6].copy_from_slice(&[0x02, 0, 0, 0, 0, 0x01]);

        Packet::new_request(
            1,
            6,
            chaddr,
            0xDEADBEEF,
            0,
            true,
            Ipv4Addr::UNSPECIFIED,
            Options::new(options),
        )
    }

    #[test]
    fn round_trip() {
        let options = [
            DhcpOption::MessageType(MessageType::Discover),
            DhcpOption::MaxMessageSize(1472),
            DhcpOption::ParameterRequestList(&[1, 3, 6, 15]),
            DhcpOption::Unrecognized(224, &[0xCA, 0xFE]),
        ];

        let packet = request(&options);

        let mut buf = [0; 1500];
        let data = packet.encode(&mut buf, 1472).unwrap();
        assert_eq!(data.len(), Packet::MIN_WIRE_SIZE);

        let decoded = Packet::decode(data).unwrap();
        assert!(!decoded.reply);
        assert_eq!(decoded.xid, 0xDEADBEEF);
        assert!(decoded.broadcast);
        assert_eq!(decoded.chaddr, packet.chaddr);
        assert_eq!(decoded.hlen, 6);

        let round: std::vec::Vec<_> = decoded.options.iter().collect();
        assert_eq!(&round, &options);
    }

    #[test]
    fn long_options_are_split_and_reassembled() {
        let long = [0x5A; 400];
        let options = [
            DhcpOption::MessageType(MessageType::Discover),
            DhcpOption::Unrecognized(224, &long),
        ];

        let packet = request(&options);

        let mut buf = [0; 1500];
        let data = packet.encode(&mut buf, 1472).unwrap();

        let decoded = Packet::decode(data).unwrap();

        let mut reassembled = std::vec::Vec::new();
        for (code, value) in decoded.options.raw_iter() {
            if code == 224 {
                assert!(value.len() <= MAX_TLV_LEN);
                reassembled.extend_from_slice(value);
            }
        }

        assert_eq!(&reassembled, &long);
    }

    #[test]
    fn overload_spills_into_file_and_sname() {
        let filler_a = [0x11; 100];
        let filler_b = [0x12; 80];
        let options = [
            DhcpOption::MessageType(MessageType::Discover),
            DhcpOption::Unrecognized(128, &filler_a),
            DhcpOption::Unrecognized(129, &filler_b),
            DhcpOption::Unrecognized(130, &[0x22; 30]),
        ];

        let packet = request(&options);

        // Tight cap: the options field offers 300 - 240 - 1 = 59 bytes, so
        // the stream has to spill into the overloaded header fields
        let mut buf = [0; 1500];
        let data = packet.encode(&mut buf, 300).unwrap();
        assert_eq!(data.len(), 300);

        let decoded = Packet::decode(data).unwrap();

        let mut seen: std::vec::Vec<(u8, std::vec::Vec<u8>)> = std::vec::Vec::new();
        for (code, value) in decoded.options.raw_iter() {
            match seen.iter_mut().find(|entry| entry.0 == code) {
                Some(entry) => entry.1.extend_from_slice(value),
                None => seen.push((code, value.to_vec())),
            }
        }

        assert_eq!(seen[0], (OPT_MESSAGE_TYPE, std::vec![1]));
        assert_eq!(seen[1], (128, filler_a.to_vec()));
        assert_eq!(seen[2], (129, filler_b.to_vec()));
        assert_eq!(seen[3], (130, std::vec![0x22; 30]));
    }

    #[test]
    fn encode_rejects_options_that_do_not_fit() {
        let filler = [0x11; 250];
        let options = [
            DhcpOption::Unrecognized(128, &filler),
            DhcpOption::Unrecognized(129, &filler),
        ];

        let packet = request(&options);

        let mut buf = [0; 1500];
        assert_eq!(packet.encode(&mut buf, 300), Err(Error::BufferOverflow));
    }

    #[test]
    fn decode_rejects_malformed() {
        let mut buf = [0; 1500];
        let options = [DhcpOption::MessageType(MessageType::Offer)];
        let packet = request(&options);
        let len = packet.encode(&mut buf, 576).unwrap().len();

        // Truncated fixed header
        assert_eq!(Packet::decode(&buf[..200]), Err(Error::DataUnderflow));

        // Corrupted cookie
        let mut bad = buf;
        bad[236] = 0;
        assert_eq!(Packet::decode(&bad[..len]), Err(Error::MissingCookie));

        // Option length overruns the buffer
        let mut bad = buf;
        bad[241] = 200;
        assert_eq!(Packet::decode(&bad[..len]), Err(Error::OptionOverrun));

        // No END marker
        let mut bad = buf;
        for byte in &mut bad[240..len] {
            if *byte == OPT_END {
                *byte = 0;
            }
        }
        assert_eq!(Packet::decode(&bad[..len]), Err(Error::MissingEnd));

        // Overload value outside {1, 2, 3}
        let mut bad = buf;
        bad[240] = OPT_OVERLOAD;
        bad[241] = 1;
        bad[242] = 5;
        bad[243] = OPT_END;
        assert_eq!(Packet::decode(&bad[..len]), Err(Error::InvalidOverload));

        // Oversized hlen
        let mut bad = buf;
        bad[2] = 17;
        assert_eq!(Packet::decode(&bad[..len]), Err(Error::InvalidHlen));
    }

    #[test]
    fn pad_bytes_are_skipped() {
        let mut buf = [0; 1500];
        let options = [DhcpOption::IpAddressLeaseTime(3600)];
        let len = request(&options).encode(&mut buf, 576).unwrap().len();

        // Shift the single option TLV right, behind a run of PADs
        let mut padded = [0u8; 1500];
        padded[..240].copy_from_slice(&buf[..240]);
        padded[248..254].copy_from_slice(&[OPT_IP_ADDRESS_LEASE_TIME, 4, 0, 0, 14, 16]);
        padded[254] = OPT_END;

        let decoded = Packet::decode(&padded[..len]).unwrap();
        assert_eq!(decoded.options.lease_time(), Some(3600));
    }
}
