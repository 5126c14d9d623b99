//! Ethernet II framing.

use bytepack::{BytestreamReader, BytestreamWriter, FromBytestream, ReadBytesExt, ToBytestream, WriteBytesExt, BE};
use std::io::{self, Read, Write};

use crate::mac::MacAddress;

pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IPV4: u16 = 0x0800;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetFrame {
    pub dst: MacAddress,
    pub src: MacAddress,
    pub ethertype: u16,
    pub payload: Vec<u8>,
}

impl EthernetFrame {
    #[must_use]
    pub fn is_arp(&self) -> bool {
        self.ethertype == ETHERTYPE_ARP
    }

    #[must_use]
    pub fn is_ipv4(&self) -> bool {
        self.ethertype == ETHERTYPE_IPV4
    }
}

impl ToBytestream for EthernetFrame {
    type Error = io::Error;
    fn to_bytestream(&self, stream: &mut BytestreamWriter) -> Result<(), Self::Error> {
        self.dst.to_bytestream(stream)?;
        self.src.to_bytestream(stream)?;
        stream.write_u16::<BE>(self.ethertype)?;
        stream.write_all(&self.payload)
    }
}

impl FromBytestream for EthernetFrame {
    type Error = io::Error;
    fn from_bytestream(stream: &mut BytestreamReader) -> Result<Self, Self::Error> {
        let dst = MacAddress::from_bytestream(stream)?;
        let src = MacAddress::from_bytestream(stream)?;
        let ethertype = stream.read_u16::<BE>()?;
        let mut payload = Vec::new();
        stream.read_to_end(&mut payload)?;
        Ok(EthernetFrame {
            dst,
            src,
            ethertype,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let frame = EthernetFrame {
            dst: MacAddress::BROADCAST,
            src: MacAddress::from([1, 2, 3, 4, 5, 6]),
            ethertype: ETHERTYPE_ARP,
            payload: vec![1, 2, 3],
        };
        let bytes = frame.to_vec().unwrap();
        let back = EthernetFrame::from_slice(&bytes).unwrap();
        assert_eq!(frame, back);
        assert!(back.is_arp());
    }
}
