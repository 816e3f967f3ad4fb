//! Resource records.
//!
//! The record model is deliberately narrow: addresses and names are
//! decoded because the resolvers synthesize and rewrite them; everything
//! else (TXT, MX, SOA, OPT, ...) is carried as opaque rdata and forwarded
//! byte-for-byte.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::name::{decode_name, encode_name};
use crate::WireError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A,
    NS,
    CNAME,
    SOA,
    PTR,
    MX,
    TXT,
    AAAA,
    OPT,
    Unknown(u16),
}

impl RecordType {
    pub fn from_u16(val: u16) -> Self {
        match val {
            1 => Self::A,
            2 => Self::NS,
            5 => Self::CNAME,
            6 => Self::SOA,
            12 => Self::PTR,
            15 => Self::MX,
            16 => Self::TXT,
            28 => Self::AAAA,
            41 => Self::OPT,
            other => Self::Unknown(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::A => 1,
            Self::NS => 2,
            Self::CNAME => 5,
            Self::SOA => 6,
            Self::PTR => 12,
            Self::MX => 15,
            Self::TXT => 16,
            Self::AAAA => 28,
            Self::OPT => 41,
            Self::Unknown(v) => v,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::NS => write!(f, "NS"),
            Self::CNAME => write!(f, "CNAME"),
            Self::SOA => write!(f, "SOA"),
            Self::PTR => write!(f, "PTR"),
            Self::MX => write!(f, "MX"),
            Self::TXT => write!(f, "TXT"),
            Self::AAAA => write!(f, "AAAA"),
            Self::OPT => write!(f, "OPT"),
            Self::Unknown(v) => write!(f, "TYPE{}", v),
        }
    }
}

/// Record payload. Addresses and names are structured; the rest is opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Name(String),
    Opaque(Vec<u8>),
}

/// A resource record. For OPT pseudo-records `class` carries the sender's
/// UDP payload size and `ttl` packs EDNS flags, not a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub rtype: RecordType,
    pub class: u16,
    pub ttl: u32,
    pub rdata: RData,
}

impl Record {
    pub fn a(name: &str, addr: Ipv4Addr, ttl: u32) -> Self {
        Self {
            name: name.to_string(),
            rtype: RecordType::A,
            class: crate::question::CLASS_IN,
            ttl,
            rdata: RData::Ipv4(addr),
        }
    }

    pub fn aaaa(name: &str, addr: Ipv6Addr, ttl: u32) -> Self {
        Self {
            name: name.to_string(),
            rtype: RecordType::AAAA,
            class: crate::question::CLASS_IN,
            ttl,
            rdata: RData::Ipv6(addr),
        }
    }

    pub fn cname(name: &str, target: &str, ttl: u32) -> Self {
        Self {
            name: name.to_string(),
            rtype: RecordType::CNAME,
            class: crate::question::CLASS_IN,
            ttl,
            rdata: RData::Name(target.to_string()),
        }
    }

    pub fn parse(msg: &[u8], offset: &mut usize) -> Result<Self, WireError> {
        let name = decode_name(msg, offset)?;
        if *offset + 10 > msg.len() {
            return Err(WireError::Truncated(*offset));
        }
        let rtype = RecordType::from_u16(u16::from_be_bytes([msg[*offset], msg[*offset + 1]]));
        let class = u16::from_be_bytes([msg[*offset + 2], msg[*offset + 3]]);
        let ttl = u32::from_be_bytes([
            msg[*offset + 4],
            msg[*offset + 5],
            msg[*offset + 6],
            msg[*offset + 7],
        ]);
        let rdlength = u16::from_be_bytes([msg[*offset + 8], msg[*offset + 9]]) as usize;
        *offset += 10;

        let rdata_start = *offset;
        if rdata_start + rdlength > msg.len() {
            return Err(WireError::Truncated(rdata_start));
        }

        let rdata = match rtype {
            RecordType::A if rdlength == 4 => RData::Ipv4(Ipv4Addr::new(
                msg[rdata_start],
                msg[rdata_start + 1],
                msg[rdata_start + 2],
                msg[rdata_start + 3],
            )),
            RecordType::AAAA if rdlength == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&msg[rdata_start..rdata_start + 16]);
                RData::Ipv6(Ipv6Addr::from(octets))
            }
            RecordType::CNAME | RecordType::NS | RecordType::PTR => {
                let mut pos = rdata_start;
                let target = decode_name(msg, &mut pos)?;
                if pos != rdata_start + rdlength {
                    return Err(WireError::RdataLengthMismatch);
                }
                RData::Name(target)
            }
            _ => RData::Opaque(msg[rdata_start..rdata_start + rdlength].to_vec()),
        };

        *offset = rdata_start + rdlength;
        Ok(Self {
            name,
            rtype,
            class,
            ttl,
            rdata,
        })
    }

    pub fn marshal(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        // OPT owners are always the root domain.
        if self.rtype == RecordType::OPT {
            buf.push(0);
        } else {
            buf.extend_from_slice(&encode_name(&self.name)?);
        }
        buf.extend_from_slice(&self.rtype.to_u16().to_be_bytes());
        buf.extend_from_slice(&self.class.to_be_bytes());
        buf.extend_from_slice(&self.ttl.to_be_bytes());

        match &self.rdata {
            RData::Ipv4(addr) => {
                buf.extend_from_slice(&4u16.to_be_bytes());
                buf.extend_from_slice(&addr.octets());
            }
            RData::Ipv6(addr) => {
                buf.extend_from_slice(&16u16.to_be_bytes());
                buf.extend_from_slice(&addr.octets());
            }
            RData::Name(target) => {
                let encoded = encode_name(target)?;
                buf.extend_from_slice(&(encoded.len() as u16).to_be_bytes());
                buf.extend_from_slice(&encoded);
            }
            RData::Opaque(data) => {
                if data.len() > u16::MAX as usize {
                    return Err(WireError::RdataLengthMismatch);
                }
                buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
                buf.extend_from_slice(data);
            }
        }
        Ok(())
    }
}
