//! DNS wire format encoder/decoder (RFC 1035, RFC 3596, RFC 6891).
//!
//! Parses from `&[u8]` buffers with bounds checks on every read; name
//! compression is accepted on decode and never emitted on encode.

pub mod edns;
pub mod header;
pub mod name;
pub mod packet;
pub mod question;
pub mod record;

pub use edns::{EdnsOption, OptRecord};
pub use header::{Header, HEADER_LEN};
pub use packet::Packet;
pub use question::Question;
pub use record::{RData, Record, RecordType};

use thiserror::Error;

/// Largest request we accept from a client, UDP or TCP.
pub const MAX_REQUEST_SIZE: usize = 4096;

/// Per-section record cap for client requests.
pub const MAX_RR_PER_SECTION: usize = 100;

/// Total record cap across all sections for client requests.
pub const MAX_RR_TOTAL: usize = 200;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("message truncated at offset {0}")]
    Truncated(usize),
    #[error("message too short: {0} bytes")]
    TooShort(usize),
    #[error("message exceeds {max} bytes: {len}")]
    TooLarge { len: usize, max: usize },
    #[error("empty domain name")]
    EmptyName,
    #[error("empty label in name")]
    EmptyLabel,
    #[error("label too long: {0} bytes (max 63)")]
    LabelTooLong(usize),
    #[error("name too long (encoded form exceeds 255 bytes)")]
    NameTooLong,
    #[error("non-ASCII byte in name")]
    NonAsciiName,
    #[error("reserved label length bits at offset {0}")]
    ReservedLabelBits(usize),
    #[error("name compression loop detected")]
    CompressionLoop,
    #[error("record data length mismatch")]
    RdataLengthMismatch,
    #[error("QR flag set on a request")]
    NotAQuery,
    #[error("unsupported opcode {0}")]
    UnsupportedOpcode(u8),
    #[error("request must carry exactly one question, got {0}")]
    BadQuestionCount(u16),
    #[error("section count {count} exceeds limit {limit}")]
    TooManyRecords { count: usize, limit: usize },
}
