//! ICMPv4 messages: only the echo and error cases the router needs (per the
//! spec's stated Non-goal of "generic ICMP reply generation").

use bytepack::{BytestreamReader, BytestreamWriter, FromBytestream, ReadBytesExt, ToBytestream, WriteBytesExt, BE};
use std::io::{self, Write};

use crate::checksum::internet_checksum;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestUnreachCode {
    NetUnreachable,
    HostUnreachable,
    AdminProhibited,
}

impl DestUnreachCode {
    fn to_raw(self) -> u8 {
        match self {
            DestUnreachCode::NetUnreachable => 0,
            DestUnreachCode::HostUnreachable => 1,
            DestUnreachCode::AdminProhibited => 13,
        }
    }

    fn from_raw(raw: u8) -> io::Result<Self> {
        match raw {
            0 => Ok(DestUnreachCode::NetUnreachable),
            1 => Ok(DestUnreachCode::HostUnreachable),
            13 => Ok(DestUnreachCode::AdminProhibited),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown dest-unreach code {other}"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpV4Type {
    EchoRequest { identifier: u16, sequence: u16 },
    EchoReply { identifier: u16, sequence: u16 },
    TimeExceeded,
    DestinationUnreachable(DestUnreachCode),
}

impl IcmpV4Type {
    #[must_use]
    pub fn is_error(&self) -> bool {
        !matches!(self, IcmpV4Type::EchoRequest { .. } | IcmpV4Type::EchoReply { .. })
    }

    fn type_code(&self) -> (u8, u8) {
        match self {
            IcmpV4Type::EchoReply { .. } => (0, 0),
            IcmpV4Type::DestinationUnreachable(code) => (3, code.to_raw()),
            IcmpV4Type::TimeExceeded => (11, 0),
            IcmpV4Type::EchoRequest { .. } => (8, 0),
        }
    }
}

/// An ICMPv4 message. `rest_of_header` holds the identifier/sequence for
/// echo messages and is zero for error messages; `payload` is the echoed
/// data (for echo) or "IP header + 8 bytes" (for error messages, per RFC
/// 792).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpV4Packet {
    pub typ: IcmpV4Type,
    pub payload: Vec<u8>,
}

impl IcmpV4Packet {
    #[must_use]
    pub fn echo_reply_to(request_id: u16, request_seq: u16, payload: Vec<u8>) -> Self {
        Self {
            typ: IcmpV4Type::EchoReply {
                identifier: request_id,
                sequence: request_seq,
            },
            payload,
        }
    }

    #[must_use]
    pub fn time_exceeded(offending_header_and_octets: Vec<u8>) -> Self {
        Self {
            typ: IcmpV4Type::TimeExceeded,
            payload: offending_header_and_octets,
        }
    }

    #[must_use]
    pub fn destination_unreachable(code: DestUnreachCode, offending_header_and_octets: Vec<u8>) -> Self {
        Self {
            typ: IcmpV4Type::DestinationUnreachable(code),
            payload: offending_header_and_octets,
        }
    }
}

impl ToBytestream for IcmpV4Packet {
    type Error = io::Error;
    fn to_bytestream(&self, stream: &mut BytestreamWriter) -> Result<(), Self::Error> {
        let (typ, code) = self.typ.type_code();
        let mut body = Vec::with_capacity(8 + self.payload.len());
        body.push(typ);
        body.push(code);
        body.extend_from_slice(&[0, 0]); // checksum placeholder

        match self.typ {
            IcmpV4Type::EchoRequest { identifier, sequence }
            | IcmpV4Type::EchoReply { identifier, sequence } => {
                body.extend_from_slice(&identifier.to_be_bytes());
                body.extend_from_slice(&sequence.to_be_bytes());
            }
            IcmpV4Type::TimeExceeded | IcmpV4Type::DestinationUnreachable(_) => {
                body.extend_from_slice(&[0, 0, 0, 0]);
            }
        }
        body.extend_from_slice(&self.payload);

        let checksum = internet_checksum(&body);
        body[2..4].copy_from_slice(&checksum.to_be_bytes());

        stream.write_all(&body)
    }
}

impl FromBytestream for IcmpV4Packet {
    type Error = io::Error;
    fn from_bytestream(stream: &mut BytestreamReader) -> Result<Self, Self::Error> {
        let typ = stream.read_u8()?;
        let code = stream.read_u8()?;
        let _checksum = stream.read_u16::<BE>()?;
        let word = stream.read_u16::<BE>()?;
        let word2 = stream.read_u16::<BE>()?;

        let mut payload = Vec::new();
        std::io::Read::read_to_end(stream, &mut payload)?;

        let typ = match typ {
            8 => IcmpV4Type::EchoRequest {
                identifier: word,
                sequence: word2,
            },
            0 => IcmpV4Type::EchoReply {
                identifier: word,
                sequence: word2,
            },
            11 => IcmpV4Type::TimeExceeded,
            3 => IcmpV4Type::DestinationUnreachable(DestUnreachCode::from_raw(code)?),
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unsupported icmpv4 type {other}"),
                ))
            }
        };

        Ok(IcmpV4Packet { typ, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_roundtrip() {
        let pkt = IcmpV4Packet::echo_reply_to(7, 1, vec![1, 2, 3, 4]);
        let bytes = pkt.to_vec().unwrap();
        assert_eq!(internet_checksum(&bytes), 0);
        let back = IcmpV4Packet::from_slice(&bytes).unwrap();
        assert_eq!(back, pkt);
        assert!(!back.typ.is_error());
    }

    #[test]
    fn time_exceeded_is_an_error() {
        let pkt = IcmpV4Packet::time_exceeded(vec![0; 28]);
        assert!(pkt.typ.is_error());
        let bytes = pkt.to_vec().unwrap();
        let back = IcmpV4Packet::from_slice(&bytes).unwrap();
        assert_eq!(back, pkt);
    }
}
