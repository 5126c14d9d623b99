//! Wire-format types for the router/ARP pipeline: Ethernet framing, ARP,
//! IPv4 and ICMPv4.
//!
//! Every type here round-trips through [`bytepack::ToBytestream`] /
//! [`bytepack::FromBytestream`], the same pattern the wider workspace uses
//! for its other protocol packets.

pub mod checksum;
pub mod ethernet;
pub mod icmpv4;
pub mod ip;
pub mod mac;

pub use ethernet::{EthernetFrame, ETHERTYPE_ARP, ETHERTYPE_IPV4};
pub use ip::{Cidr, Ipv4Packet};
pub use mac::MacAddress;

pub mod arp {
    //! Address Resolution Protocol packet framing.
    use bytepack::{
        BytestreamReader, BytestreamWriter, FromBytestream, ReadBytesExt, ToBytestream,
        WriteBytesExt, BE,
    };
    use std::{
        io::{self, Read, Write},
        net::Ipv4Addr,
    };

    use crate::mac::MacAddress;

    /// ARP hardware type for Ethernet (the only one this agent speaks).
    pub const HTYPE_ETHERNET: u16 = 1;
    /// ARP protocol type for IPv4.
    pub const PTYPE_IPV4: u16 = 0x0800;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum ArpOperation {
        Request,
        Reply,
    }

    impl ArpOperation {
        fn to_raw(self) -> u16 {
            match self {
                ArpOperation::Request => 1,
                ArpOperation::Reply => 2,
            }
        }

        fn from_raw(raw: u16) -> io::Result<Self> {
            match raw {
                1 => Ok(ArpOperation::Request),
                2 => Ok(ArpOperation::Reply),
                other => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown arp operation {other}"),
                )),
            }
        }
    }

    /// An IPv4-over-Ethernet ARP packet.
    ///
    /// Unlike a general-purpose ARP implementation, this only ever carries
    /// 6-byte hardware addresses and 4-byte protocol addresses, matching the
    /// `htype=1, ptype=0x0800` case the router actually needs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ArpPacket {
        pub operation: ArpOperation,
        /// Sender hardware address.
        pub sha: MacAddress,
        /// Sender protocol address.
        pub spa: Ipv4Addr,
        /// Target hardware address. Unspecified on a request.
        pub tha: MacAddress,
        /// Target protocol address.
        pub tpa: Ipv4Addr,
    }

    impl ArpPacket {
        #[must_use]
        pub fn new_request(sha: MacAddress, spa: Ipv4Addr, tpa: Ipv4Addr) -> Self {
            Self {
                operation: ArpOperation::Request,
                sha,
                spa,
                tha: MacAddress::NULL,
                tpa,
            }
        }

        /// Builds the reply a host at `(mac, ip)` would send in answer to this
        /// packet, iff this packet is itself a request.
        #[must_use]
        pub fn into_reply(self, responder_mac: MacAddress) -> Self {
            Self {
                operation: ArpOperation::Reply,
                sha: responder_mac,
                spa: self.tpa,
                tha: self.sha,
                tpa: self.spa,
            }
        }

        #[must_use]
        pub fn is_request(&self) -> bool {
            self.operation == ArpOperation::Request
        }
    }

    impl ToBytestream for ArpPacket {
        type Error = io::Error;
        fn to_bytestream(&self, stream: &mut BytestreamWriter) -> Result<(), Self::Error> {
            stream.write_u16::<BE>(HTYPE_ETHERNET)?;
            stream.write_u16::<BE>(PTYPE_IPV4)?;
            stream.write_u8(6)?;
            stream.write_u8(4)?;
            stream.write_u16::<BE>(self.operation.to_raw())?;
            stream.write_all(self.sha.as_slice())?;
            stream.write_all(&self.spa.octets())?;
            stream.write_all(self.tha.as_slice())?;
            stream.write_all(&self.tpa.octets())?;
            Ok(())
        }
    }

    impl FromBytestream for ArpPacket {
        type Error = io::Error;
        fn from_bytestream(stream: &mut BytestreamReader) -> Result<Self, Self::Error> {
            let htype = stream.read_u16::<BE>()?;
            let ptype = stream.read_u16::<BE>()?;
            let haddrlen = stream.read_u8()?;
            let paddrlen = stream.read_u8()?;
            if htype != HTYPE_ETHERNET || ptype != PTYPE_IPV4 || haddrlen != 6 || paddrlen != 4 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "unsupported arp address family",
                ));
            }
            let operation = ArpOperation::from_raw(stream.read_u16::<BE>()?)?;

            let mut sha = [0u8; 6];
            stream.read_exact(&mut sha)?;
            let mut spa = [0u8; 4];
            stream.read_exact(&mut spa)?;
            let mut tha = [0u8; 6];
            stream.read_exact(&mut tha)?;
            let mut tpa = [0u8; 4];
            stream.read_exact(&mut tpa)?;

            Ok(ArpPacket {
                operation,
                sha: MacAddress::from(sha),
                spa: Ipv4Addr::from(spa),
                tha: MacAddress::from(tha),
                tpa: Ipv4Addr::from(tpa),
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn request_reply_roundtrip() {
            let req = ArpPacket::new_request(
                MacAddress::from([0xaa, 0xaa, 0xaa, 0, 0, 1]),
                Ipv4Addr::new(10, 0, 0, 1),
                Ipv4Addr::new(10, 0, 0, 2),
            );
            let bytes = req.to_vec().unwrap();
            let back = ArpPacket::from_slice(&bytes).unwrap();
            assert_eq!(req, back);
            assert!(back.is_request());

            let reply = req.into_reply(MacAddress::from([0xbb, 0xbb, 0xbb, 0, 0, 2]));
            assert_eq!(reply.operation, ArpOperation::Reply);
            assert_eq!(reply.spa, Ipv4Addr::new(10, 0, 0, 2));
            assert_eq!(reply.tpa, Ipv4Addr::new(10, 0, 0, 1));
            assert_eq!(reply.tha, req.sha);
        }
    }
}
