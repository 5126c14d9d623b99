//! Ethernet (MAC) addresses.

use bytepack::{BytestreamReader, BytestreamWriter, FromBytestream, ToBytestream};
use std::{
    fmt::Display,
    io::{self, Read, Write},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const NULL: MacAddress = MacAddress([0; 6]);
    pub const BROADCAST: MacAddress = MacAddress([0xff; 6]);

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Generates a locally-administered, unicast MAC address.
    #[must_use]
    pub fn gen() -> MacAddress {
        let mut mac: [u8; 6] = rand::random();
        mac[0] &= 0b1111_1110; // clear multicast bit
        mac[0] |= 0b0000_0010; // set locally-administered bit
        MacAddress(mac)
    }

    #[must_use]
    pub fn is_unspecified(&self) -> bool {
        *self == MacAddress::NULL
    }

    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        *self == MacAddress::BROADCAST
    }

    /// The Ethernet "group" bit (LSB of the first octet) marks broadcast and
    /// multicast destinations alike; RFC 1812 §4.3.2.7 treats both as
    /// ineligible destinations for a generated ICMP error.
    #[must_use]
    pub fn is_multicast(&self) -> bool {
        !self.is_broadcast() && self.0[0] & 0x01 != 0
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(value: [u8; 6]) -> Self {
        MacAddress(value)
    }
}

impl From<MacAddress> for [u8; 6] {
    fn from(value: MacAddress) -> Self {
        value.0
    }
}

impl ToBytestream for MacAddress {
    type Error = io::Error;
    fn to_bytestream(&self, stream: &mut BytestreamWriter) -> Result<(), Self::Error> {
        stream.write_all(&self.0)
    }
}

impl FromBytestream for MacAddress {
    type Error = io::Error;
    fn from_bytestream(stream: &mut BytestreamReader) -> Result<Self, Self::Error> {
        let mut bytes = [0u8; 6];
        stream.read_exact(&mut bytes)?;
        Ok(MacAddress(bytes))
    }
}

impl Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}
