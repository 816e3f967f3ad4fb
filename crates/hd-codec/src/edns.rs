//! EDNS(0) OPT pseudo-record handling (RFC 6891).
//!
//! The OPT record abuses the fixed RR fields: CLASS carries the sender's
//! UDP payload size and TTL packs extended RCODE, version and the DO flag.

use crate::header::HEADER_LEN;
use crate::record::{RData, Record, RecordType};
use crate::Packet;

/// Floor every advertised UDP payload size is clamped to (RFC 1035 base).
pub const MIN_UDP_SIZE: u16 = 512;

/// EDNS option codes we retain; everything else is dropped on parse.
pub const OPTION_COOKIE: u16 = 10;
pub const OPTION_PADDING: u16 = 12;

/// Individual options larger than this are discarded outright.
const MAX_OPTION_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdnsOption {
    pub code: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptRecord {
    pub udp_size: u16,
    pub ext_rcode: u8,
    pub version: u8,
    pub dnssec_ok: bool,
    pub options: Vec<EdnsOption>,
}

impl OptRecord {
    /// Plain OPT advertising a payload size, clamped to [512, 65535].
    pub fn new(udp_size: u16) -> Self {
        Self {
            udp_size: udp_size.max(MIN_UDP_SIZE),
            ext_rcode: 0,
            version: 0,
            dnssec_ok: false,
            options: Vec::new(),
        }
    }

    /// Reinterpret a parsed OPT record. Returns None for other types.
    pub fn from_record(record: &Record) -> Option<Self> {
        if record.rtype != RecordType::OPT {
            return None;
        }
        let rdata = match &record.rdata {
            RData::Opaque(bytes) => bytes.as_slice(),
            _ => &[],
        };
        Some(Self {
            udp_size: record.class,
            ext_rcode: (record.ttl >> 24) as u8,
            version: (record.ttl >> 16) as u8,
            dnssec_ok: record.ttl & 0x8000 != 0,
            options: parse_edns_options(rdata),
        })
    }

    pub fn to_record(&self) -> Record {
        let ttl = ((self.ext_rcode as u32) << 24)
            | ((self.version as u32) << 16)
            | if self.dnssec_ok { 0x8000 } else { 0 };
        let mut rdata = Vec::new();
        for option in &self.options {
            rdata.extend_from_slice(&option.code.to_be_bytes());
            rdata.extend_from_slice(&(option.data.len() as u16).to_be_bytes());
            rdata.extend_from_slice(&option.data);
        }
        Record {
            name: String::new(),
            rtype: RecordType::OPT,
            class: self.udp_size,
            ttl,
            rdata: RData::Opaque(rdata),
        }
    }
}

/// Find the OPT pseudo-record in an additionals section.
pub fn extract_opt(additionals: &[Record]) -> Option<OptRecord> {
    additionals.iter().find_map(OptRecord::from_record)
}

/// UDP payload budget a client advertised, clamped to at least 512.
/// Clients without EDNS get the RFC 1035 default.
pub fn client_max_udp_size(request: &Packet) -> usize {
    match extract_opt(&request.additionals) {
        Some(opt) => opt.udp_size.max(MIN_UDP_SIZE) as usize,
        None => MIN_UDP_SIZE as usize,
    }
}

/// Ensure raw request bytes advertise EDNS toward upstream. A client OPT
/// with DO set passes through untouched; any other client OPT is replaced
/// by one advertising `udp_size`; a request without an OPT gets one
/// appended, with ARCOUNT bumped in the raw bytes.
pub fn add_edns_to_request_bytes(request: &Packet, bytes: &[u8], udp_size: u16) -> Vec<u8> {
    match extract_opt(&request.additionals) {
        Some(opt) if opt.dnssec_ok => bytes.to_vec(),
        Some(_) => {
            let mut packet = request.clone();
            packet
                .additionals
                .retain(|record| record.rtype != RecordType::OPT);
            packet.additionals.push(OptRecord::new(udp_size).to_record());
            match packet.marshal() {
                Ok(mut out) => {
                    // Keep the transaction id the raw bytes carry; it may
                    // differ from the parsed packet's.
                    if bytes.len() >= 2 && out.len() >= 2 {
                        out[0..2].copy_from_slice(&bytes[0..2]);
                    }
                    out
                }
                Err(_) => bytes.to_vec(),
            }
        }
        None => {
            let mut out = bytes.to_vec();
            if out.len() < HEADER_LEN {
                return out;
            }
            // OPT marshal on a root-owner record cannot fail.
            if OptRecord::new(udp_size).to_record().marshal(&mut out).is_ok() {
                let ar_count = u16::from_be_bytes([out[10], out[11]]).saturating_add(1);
                out[10..12].copy_from_slice(&ar_count.to_be_bytes());
            }
            out
        }
    }
}

/// Parse OPT rdata into the options we keep (COOKIE, PADDING). Truncated
/// trailers and oversized options are dropped; this never fails.
pub fn parse_edns_options(rdata: &[u8]) -> Vec<EdnsOption> {
    let mut options = Vec::new();
    let mut pos = 0;
    while pos + 4 <= rdata.len() {
        let code = u16::from_be_bytes([rdata[pos], rdata[pos + 1]]);
        let len = u16::from_be_bytes([rdata[pos + 2], rdata[pos + 3]]) as usize;
        pos += 4;
        if pos + len > rdata.len() {
            break;
        }
        if len <= MAX_OPTION_LEN && matches!(code, OPTION_COOKIE | OPTION_PADDING) {
            options.push(EdnsOption {
                code,
                data: rdata[pos..pos + len].to_vec(),
            });
        }
        pos += len;
    }
    options
}
