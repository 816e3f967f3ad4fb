//! Question section entries.

use crate::name::{decode_name, encode_name};
use crate::record::RecordType;
use crate::WireError;

/// DNS CLASS IN. The only class this server answers authoritatively.
pub const CLASS_IN: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: RecordType,
    pub qclass: u16,
}

impl Question {
    pub fn new(name: &str, qtype: RecordType) -> Self {
        Self {
            name: name.to_string(),
            qtype,
            qclass: CLASS_IN,
        }
    }

    pub fn parse(msg: &[u8], offset: &mut usize) -> Result<Self, WireError> {
        let name = decode_name(msg, offset)?;
        if *offset + 4 > msg.len() {
            return Err(WireError::Truncated(*offset));
        }
        let qtype = RecordType::from_u16(u16::from_be_bytes([msg[*offset], msg[*offset + 1]]));
        let qclass = u16::from_be_bytes([msg[*offset + 2], msg[*offset + 3]]);
        *offset += 4;
        Ok(Self { name, qtype, qclass })
    }

    pub fn marshal(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        buf.extend_from_slice(&encode_name(&self.name)?);
        buf.extend_from_slice(&self.qtype.to_u16().to_be_bytes());
        buf.extend_from_slice(&self.qclass.to_be_bytes());
        Ok(())
    }
}
