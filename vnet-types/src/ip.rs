//! IPv4 header framing and CIDR arithmetic.

use bytepack::{BytestreamReader, BytestreamWriter, FromBytestream, ReadBytesExt, ToBytestream, WriteBytesExt, BE};
use std::{
    fmt::Display,
    io::{self, Read, Write},
    net::Ipv4Addr,
    str::FromStr,
};

use crate::checksum::internet_checksum;

/// A network prefix: `addr` holds the (masked) network address and `prefix`
/// the number of significant bits, `0..=32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl Cidr {
    #[must_use]
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Self {
        assert!(prefix <= 32, "prefix out of range");
        Self { addr, prefix }
    }

    #[must_use]
    pub fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix)
        }
    }

    /// `prefix=0` is defined to match every address (the spec's "always
    /// matches" special case for the link-local subnet check and for a
    /// default route).
    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        if self.prefix == 0 {
            return true;
        }
        let mask = self.mask();
        u32::from(ip) & mask == u32::from(self.addr) & mask
    }

    #[must_use]
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & self.mask())
    }

    #[must_use]
    pub fn broadcast(&self) -> Ipv4Addr {
        if self.prefix == 0 {
            return Ipv4Addr::BROADCAST;
        }
        Ipv4Addr::from(u32::from(self.addr) | !self.mask())
    }
}

impl Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = io::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "missing /prefix"))?;
        let addr = addr
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad ipv4 address"))?;
        let prefix = prefix
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad prefix length"))?;
        if prefix > 32 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "prefix > 32"));
        }
        Ok(Cidr { addr, prefix })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Flags {
    pub df: bool,
    pub mf: bool,
}

/// An IPv4 packet (header + payload), the unit the router pipeline operates
/// on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ipv4Packet {
    pub dscp: u8,
    pub ecn: u8,
    pub identification: u16,
    pub flags: Ipv4Flags,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub proto: u8,
    pub src: Ipv4Addr,
    pub dest: Ipv4Addr,
    pub content: Vec<u8>,
}

pub const PROTO_ICMPV4: u8 = 1;

impl Ipv4Packet {
    #[must_use]
    pub fn is_first_fragment(&self) -> bool {
        self.fragment_offset == 0
    }

    /// Builds the header-swapped skeleton of a reply packet (TTL reset, no
    /// payload, fragmentation state cleared) — used when synthesizing ICMP
    /// errors and echo replies.
    #[must_use]
    pub fn reply_skeleton(&self) -> Ipv4Packet {
        Ipv4Packet {
            dscp: self.dscp,
            ecn: self.ecn,
            identification: self.identification,
            flags: Ipv4Flags {
                df: self.flags.df,
                mf: false,
            },
            fragment_offset: 0,
            ttl: 64,
            proto: self.proto,
            src: self.dest,
            dest: self.src,
            content: Vec::new(),
        }
    }
}

impl ToBytestream for Ipv4Packet {
    type Error = io::Error;
    fn to_bytestream(&self, stream: &mut BytestreamWriter) -> Result<(), Self::Error> {
        // version=4, ihl=5 (no options)
        stream.write_u8(0x45)?;
        stream.write_u8((self.dscp << 2) | self.ecn)?;
        let total_len = 20 + self.content.len() as u16;
        stream.write_u16::<BE>(total_len)?;
        stream.write_u16::<BE>(self.identification)?;

        let mut flags_and_frag = self.fragment_offset & 0x1fff;
        if self.flags.df {
            flags_and_frag |= 0b010 << 13;
        }
        if self.flags.mf {
            flags_and_frag |= 0b100 << 13;
        }
        stream.write_u16::<BE>(flags_and_frag)?;

        stream.write_u8(self.ttl)?;
        stream.write_u8(self.proto)?;

        let checksum_marker = stream.create_typed_marker::<u16>()?;
        stream.write_all(&self.src.octets())?;
        stream.write_all(&self.dest.octets())?;
        stream.write_all(&self.content)?;

        // Checksum is computed over the 20-byte header only, with the
        // checksum field itself zeroed.
        let mut header = Vec::with_capacity(20);
        header.push(0x45);
        header.push((self.dscp << 2) | self.ecn);
        header.extend_from_slice(&total_len.to_be_bytes());
        header.extend_from_slice(&self.identification.to_be_bytes());
        header.extend_from_slice(&flags_and_frag.to_be_bytes());
        header.push(self.ttl);
        header.push(self.proto);
        header.extend_from_slice(&[0, 0]);
        header.extend_from_slice(&self.src.octets());
        header.extend_from_slice(&self.dest.octets());
        let checksum = internet_checksum(&header);
        stream
            .update_marker(&checksum_marker)
            .copy_from_slice(&checksum.to_be_bytes());

        Ok(())
    }
}

impl FromBytestream for Ipv4Packet {
    type Error = io::Error;
    fn from_bytestream(stream: &mut BytestreamReader) -> Result<Self, Self::Error> {
        let byte0 = stream.read_u8()?;
        if byte0 >> 4 != 4 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "not an ipv4 packet"));
        }
        let byte1 = stream.read_u8()?;
        let dscp = byte1 >> 2;
        let ecn = byte1 & 0x03;

        let total_len = stream.read_u16::<BE>()?;
        let identification = stream.read_u16::<BE>()?;

        let fword = stream.read_u16::<BE>()?;
        let fbyte = fword >> 13;
        let flags = Ipv4Flags {
            df: fbyte & 0b010 != 0,
            mf: fbyte & 0b100 != 0,
        };
        let fragment_offset = fword & 0x1fff;

        let ttl = stream.read_u8()?;
        let proto = stream.read_u8()?;
        let _checksum = stream.read_u16::<BE>()?;

        let mut src = [0u8; 4];
        stream.read_exact(&mut src)?;
        let mut dest = [0u8; 4];
        stream.read_exact(&mut dest)?;

        let content_len = total_len.saturating_sub(20) as usize;
        let mut content = vec![0u8; content_len];
        stream.read_exact(&mut content)?;

        Ok(Ipv4Packet {
            dscp,
            ecn,
            identification,
            flags,
            fragment_offset,
            ttl,
            proto,
            src: Ipv4Addr::from(src),
            dest: Ipv4Addr::from(dest),
            content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_contains_and_zero_prefix_matches_all() {
        let cidr = Cidr::new(Ipv4Addr::new(10, 0, 0, 0), 24);
        assert!(cidr.contains(Ipv4Addr::new(10, 0, 0, 42)));
        assert!(!cidr.contains(Ipv4Addr::new(10, 0, 1, 42)));

        let default_route = Cidr::new(Ipv4Addr::UNSPECIFIED, 0);
        assert!(default_route.contains(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn cidr_broadcast_address() {
        let cidr = Cidr::new(Ipv4Addr::new(192, 168, 1, 0), 24);
        assert_eq!(cidr.broadcast(), Ipv4Addr::new(192, 168, 1, 255));
    }

    #[test]
    fn ipv4_header_roundtrip_has_zero_checksum() {
        let pkt = Ipv4Packet {
            dscp: 0,
            ecn: 0,
            identification: 7,
            flags: Ipv4Flags { df: true, mf: false },
            fragment_offset: 0,
            ttl: 64,
            proto: PROTO_ICMPV4,
            src: Ipv4Addr::new(10, 0, 0, 1),
            dest: Ipv4Addr::new(10, 0, 0, 2),
            content: vec![1, 2, 3, 4],
        };
        let bytes = pkt.to_vec().unwrap();
        // checksum field is bytes 10..12 of the header
        let header = &bytes[0..20];
        assert_eq!(internet_checksum(header), 0);

        let back = Ipv4Packet::from_slice(&bytes).unwrap();
        assert_eq!(back, pkt);
    }
}
