//! Whole-message parse/marshal plus the raw-byte operations the serving
//! path performs without a full reparse (txid patching, TTL aging, UDP
//! truncation).

use crate::header::{Header, HEADER_LEN};
use crate::name::skip_name;
use crate::question::Question;
use crate::record::{Record, RecordType};
use crate::{WireError, MAX_REQUEST_SIZE, MAX_RR_PER_SECTION, MAX_RR_TOTAL};

/// Allocation cap applied per section before parsing, so a forged header
/// count cannot reserve unbounded memory.
const MAX_SECTION_PREALLOC: usize = 256;

#[derive(Debug, Clone, Default)]
pub struct Packet {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authorities: Vec<Record>,
    pub additionals: Vec<Record>,
}

impl Packet {
    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        let header = Header::parse(buf)?;
        let mut offset = HEADER_LEN;

        let mut questions =
            Vec::with_capacity((header.qd_count as usize).min(MAX_SECTION_PREALLOC));
        for _ in 0..header.qd_count {
            questions.push(Question::parse(buf, &mut offset)?);
        }

        let mut sections = [
            (header.an_count as usize, Vec::new()),
            (header.ns_count as usize, Vec::new()),
            (header.ar_count as usize, Vec::new()),
        ];
        for (count, records) in &mut sections {
            records.reserve((*count).min(MAX_SECTION_PREALLOC));
            for _ in 0..*count {
                records.push(Record::parse(buf, &mut offset)?);
            }
        }
        let [(_, answers), (_, authorities), (_, additionals)] = sections;

        Ok(Self {
            header,
            questions,
            answers,
            authorities,
            additionals,
        })
    }

    /// Serialize the message. Section counts always reflect the actual
    /// collection lengths, clamped to 16 bits; no name compression is
    /// emitted.
    pub fn marshal(&self) -> Result<Vec<u8>, WireError> {
        let mut header = self.header;
        header.qd_count = self.questions.len().min(u16::MAX as usize) as u16;
        header.an_count = self.answers.len().min(u16::MAX as usize) as u16;
        header.ns_count = self.authorities.len().min(u16::MAX as usize) as u16;
        header.ar_count = self.additionals.len().min(u16::MAX as usize) as u16;

        let mut buf = Vec::with_capacity(512);
        buf.extend_from_slice(&header.marshal());
        for question in &self.questions {
            question.marshal(&mut buf)?;
        }
        for record in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
        {
            record.marshal(&mut buf)?;
        }
        Ok(buf)
    }

    pub fn first_question(&self) -> Option<&Question> {
        self.questions.first()
    }
}

/// Server-side request gate: size-capped, exactly one question, standard
/// query opcode, sane section counts.
pub fn parse_request_bounded(buf: &[u8]) -> Result<Packet, WireError> {
    if buf.len() > MAX_REQUEST_SIZE {
        return Err(WireError::TooLarge {
            len: buf.len(),
            max: MAX_REQUEST_SIZE,
        });
    }
    let header = Header::parse(buf)?;
    if header.is_response() {
        return Err(WireError::NotAQuery);
    }
    if header.opcode() != 0 {
        return Err(WireError::UnsupportedOpcode(header.opcode()));
    }
    if header.qd_count != 1 {
        return Err(WireError::BadQuestionCount(header.qd_count));
    }
    let counts = [
        header.an_count as usize,
        header.ns_count as usize,
        header.ar_count as usize,
    ];
    for count in counts {
        if count > MAX_RR_PER_SECTION {
            return Err(WireError::TooManyRecords {
                count,
                limit: MAX_RR_PER_SECTION,
            });
        }
    }
    let total = 1 + counts.iter().sum::<usize>();
    if total > MAX_RR_TOTAL {
        return Err(WireError::TooManyRecords {
            count: total,
            limit: MAX_RR_TOTAL,
        });
    }
    Packet::parse(buf)
}

/// Copy `bytes` with its transaction id overwritten.
pub fn patch_transaction_id(bytes: &[u8], id: u16) -> Vec<u8> {
    let mut out = bytes.to_vec();
    set_transaction_id(&mut out, id);
    out
}

/// Overwrite the transaction id in place.
pub fn set_transaction_id(bytes: &mut [u8], id: u16) {
    if bytes.len() >= 2 {
        bytes[0..2].copy_from_slice(&id.to_be_bytes());
    }
}

/// TC bit check on raw response bytes.
pub fn is_truncated(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[2] & 0x02 != 0
}

/// Walk a response in place and subtract `age_secs` from every record TTL,
/// clamping at 1 so entries a client re-caches still expire. OPT records
/// are skipped: their TTL field packs EDNS flags, not a time.
pub fn age_response_ttls(bytes: &mut [u8], age_secs: u32) -> Result<(), WireError> {
    if age_secs == 0 {
        return Ok(());
    }
    let header = Header::parse(bytes)?;
    let mut offset = HEADER_LEN;

    for _ in 0..header.qd_count {
        skip_name(bytes, &mut offset)?;
        if offset + 4 > bytes.len() {
            return Err(WireError::Truncated(offset));
        }
        offset += 4;
    }

    let total = header.an_count as usize + header.ns_count as usize + header.ar_count as usize;
    for _ in 0..total {
        skip_name(bytes, &mut offset)?;
        if offset + 10 > bytes.len() {
            return Err(WireError::Truncated(offset));
        }
        let rtype = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
        if RecordType::from_u16(rtype) != RecordType::OPT {
            let ttl = u32::from_be_bytes([
                bytes[offset + 4],
                bytes[offset + 5],
                bytes[offset + 6],
                bytes[offset + 7],
            ]);
            let aged = ttl.saturating_sub(age_secs).max(1);
            bytes[offset + 4..offset + 8].copy_from_slice(&aged.to_be_bytes());
        }
        let rdlength = u16::from_be_bytes([bytes[offset + 8], bytes[offset + 9]]) as usize;
        offset += 10;
        if offset + rdlength > bytes.len() {
            return Err(WireError::Truncated(offset));
        }
        offset += rdlength;
    }
    Ok(())
}

/// Shrink a response to fit a UDP payload budget: keep the header (TC set,
/// QDCOUNT preserved, other counts zeroed) and the question section, drop
/// everything else.
pub fn truncate_udp_response(bytes: &[u8], max_size: usize) -> Vec<u8> {
    if bytes.len() <= max_size {
        return bytes.to_vec();
    }

    match rebuild_truncated(bytes) {
        Ok(out) => out,
        // A response we cannot re-walk gets the blunt treatment: chop at
        // the limit, zero the record counts, set TC.
        Err(_) => {
            let mut out = bytes[..max_size.min(bytes.len())].to_vec();
            if out.len() >= HEADER_LEN {
                out[2] |= 0x02;
                for byte in &mut out[6..12] {
                    *byte = 0;
                }
            }
            out
        }
    }
}

fn rebuild_truncated(bytes: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut header = Header::parse(bytes)?;
    let mut offset = HEADER_LEN;
    for _ in 0..header.qd_count {
        skip_name(bytes, &mut offset)?;
        if offset + 4 > bytes.len() {
            return Err(WireError::Truncated(offset));
        }
        offset += 4;
    }

    header.set_truncated();
    header.an_count = 0;
    header.ns_count = 0;
    header.ar_count = 0;

    let mut out = Vec::with_capacity(offset);
    out.extend_from_slice(&header.marshal());
    out.extend_from_slice(&bytes[HEADER_LEN..offset]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{FLAG_QR, FLAG_RD, RCODE_NOERROR};
    use std::net::Ipv4Addr;

    fn simple_query(id: u16, name: &str, rtype: RecordType) -> Packet {
        Packet {
            header: Header {
                id,
                flags: FLAG_RD,
                ..Default::default()
            },
            questions: vec![Question::new(name, rtype)],
            ..Default::default()
        }
    }

    #[test]
    fn a_query_roundtrip() {
        let packet = simple_query(0x1234, "example.com", RecordType::A);
        let bytes = packet.marshal().unwrap();

        assert!(bytes.len() >= 29);
        assert_eq!(&bytes[0..2], &[0x12, 0x34]);

        let parsed = Packet::parse(&bytes).unwrap();
        assert_eq!(parsed.header.id, 0x1234);
        assert!(parsed.header.recursion_desired());
        assert_eq!(parsed.questions.len(), 1);
        assert_eq!(parsed.questions[0].name.to_lowercase(), "example.com");
        assert_eq!(parsed.questions[0].qtype, RecordType::A);
        assert_eq!(parsed.header.rcode(), RCODE_NOERROR);
    }

    #[test]
    fn full_response_roundtrip() {
        let mut packet = simple_query(7, "example.com", RecordType::A);
        packet.header.flags |= FLAG_QR;
        packet.answers = vec![
            Record::a("example.com", Ipv4Addr::new(1, 2, 3, 4), 300),
            Record::a("example.com", Ipv4Addr::new(5, 6, 7, 8), 300),
        ];
        packet.authorities = vec![Record::cname("alias.example.com", "example.com", 60)];

        let bytes = packet.marshal().unwrap();
        let parsed = Packet::parse(&bytes).unwrap();

        assert_eq!(parsed.header.id, packet.header.id);
        assert_eq!(parsed.header.flags, packet.header.flags);
        assert_eq!(parsed.questions, packet.questions);
        assert_eq!(parsed.answers.len(), 2);
        assert_eq!(parsed.authorities.len(), 1);
        assert!(parsed.additionals.is_empty());
    }

    #[test]
    fn marshal_counts_follow_collections() {
        let mut packet = simple_query(1, "a.com", RecordType::A);
        // Lie in the header; marshal must correct it.
        packet.header.qd_count = 9;
        packet.header.an_count = 9;

        let bytes = packet.marshal().unwrap();
        let header = Header::parse(&bytes).unwrap();
        assert_eq!(header.qd_count, 1);
        assert_eq!(header.an_count, 0);
    }

    #[test]
    fn bounded_parse_accepts_simple_query() {
        let bytes = simple_query(2, "example.org", RecordType::AAAA)
            .marshal()
            .unwrap();
        assert!(parse_request_bounded(&bytes).is_ok());
    }

    #[test]
    fn bounded_parse_rejects_response_flag() {
        let mut packet = simple_query(2, "example.org", RecordType::A);
        packet.header.flags |= FLAG_QR;
        let bytes = packet.marshal().unwrap();
        assert!(matches!(
            parse_request_bounded(&bytes),
            Err(WireError::NotAQuery)
        ));
    }

    #[test]
    fn bounded_parse_rejects_bad_opcode() {
        let mut packet = simple_query(2, "example.org", RecordType::A);
        packet.header.set_opcode(4);
        let bytes = packet.marshal().unwrap();
        assert!(matches!(
            parse_request_bounded(&bytes),
            Err(WireError::UnsupportedOpcode(4))
        ));
    }

    #[test]
    fn bounded_parse_rejects_multi_question() {
        let mut packet = simple_query(2, "example.org", RecordType::A);
        packet
            .questions
            .push(Question::new("example.net", RecordType::A));
        let bytes = packet.marshal().unwrap();
        assert!(matches!(
            parse_request_bounded(&bytes),
            Err(WireError::BadQuestionCount(2))
        ));
    }

    #[test]
    fn bounded_parse_rejects_oversized_message() {
        let mut bytes = simple_query(2, "example.org", RecordType::A)
            .marshal()
            .unwrap();
        bytes.resize(MAX_REQUEST_SIZE + 1, 0);
        assert!(matches!(
            parse_request_bounded(&bytes),
            Err(WireError::TooLarge { .. })
        ));
    }

    #[test]
    fn bounded_parse_rejects_forged_counts() {
        let mut bytes = simple_query(2, "example.org", RecordType::A)
            .marshal()
            .unwrap();
        // Forge ARCOUNT = 101.
        bytes[10..12].copy_from_slice(&101u16.to_be_bytes());
        assert!(matches!(
            parse_request_bounded(&bytes),
            Err(WireError::TooManyRecords { .. })
        ));
    }

    #[test]
    fn patch_txid_leaves_rest_untouched() {
        let bytes = simple_query(0x1111, "example.com", RecordType::A)
            .marshal()
            .unwrap();
        let patched = patch_transaction_id(&bytes, 0xBEEF);
        assert_eq!(&patched[0..2], &[0xBE, 0xEF]);
        assert_eq!(&patched[2..], &bytes[2..]);
        // Original input is untouched.
        assert_eq!(&bytes[0..2], &[0x11, 0x11]);
    }

    #[test]
    fn aging_decrements_ttls_and_skips_opt() {
        let mut packet = simple_query(3, "example.com", RecordType::A);
        packet.header.flags |= FLAG_QR;
        packet.answers = vec![
            Record::a("example.com", Ipv4Addr::new(1, 1, 1, 1), 300),
            Record::a("example.com", Ipv4Addr::new(2, 2, 2, 2), 10),
        ];
        packet.additionals = vec![Record {
            name: String::new(),
            rtype: RecordType::OPT,
            class: 1232,
            ttl: 0x8000_0000, // DO bit lives in the TTL field
            rdata: crate::record::RData::Opaque(Vec::new()),
        }];
        let mut bytes = packet.marshal().unwrap();

        age_response_ttls(&mut bytes, 50).unwrap();

        let parsed = Packet::parse(&bytes).unwrap();
        assert_eq!(parsed.answers[0].ttl, 250);
        assert_eq!(parsed.answers[1].ttl, 1); // clamped, never zero
        assert_eq!(parsed.additionals[0].ttl, 0x8000_0000); // untouched
    }

    #[test]
    fn truncation_keeps_header_and_question() {
        let mut packet = simple_query(4, "example.com", RecordType::A);
        packet.header.flags |= FLAG_QR;
        for i in 0..60u8 {
            packet
                .answers
                .push(Record::a("example.com", Ipv4Addr::new(10, 0, 0, i), 300));
        }
        let bytes = packet.marshal().unwrap();
        assert!(bytes.len() > 512);

        let truncated = truncate_udp_response(&bytes, 512);
        assert!(truncated.len() <= 512);

        let parsed = Packet::parse(&truncated).unwrap();
        assert!(parsed.header.is_truncated());
        assert_eq!(parsed.header.qd_count, 1);
        assert_eq!(parsed.questions.len(), 1);
        assert_eq!(parsed.header.an_count, 0);
        assert_eq!(parsed.header.ns_count, 0);
        assert_eq!(parsed.header.ar_count, 0);
        assert_eq!(parsed.questions[0].name, "example.com");
    }

    #[test]
    fn truncation_noop_when_fits() {
        let bytes = simple_query(5, "example.com", RecordType::A)
            .marshal()
            .unwrap();
        assert_eq!(truncate_udp_response(&bytes, 512), bytes);
        assert!(!is_truncated(&bytes));
    }

    #[test]
    fn tc_bit_detection() {
        let mut packet = simple_query(6, "example.com", RecordType::A);
        packet.header.set_truncated();
        let bytes = packet.marshal().unwrap();
        assert!(is_truncated(&bytes));
    }
}
