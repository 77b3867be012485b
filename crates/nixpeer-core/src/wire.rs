//! Discovery wire format: the two UDP datagrams peers exchange.
//!
//! ```text
//! Query:  0x00 | index: u32 | hash (rest of datagram)
//! Answer: 0x01 | index: u32 | port: u32 | path (rest of datagram)
//! ```
//!
//! Integers are big-endian, strings are UTF-8 and run to the end of the
//! datagram. The fixed headers are zerocopy structs built from network-endian
//! integer types, so they have alignment 1 and no padding.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::network_endian::U32;
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

// ── Headers ──────────────────────────────────────────────────────────────────

/// Fixed prefix of a query datagram.
///
/// Wire size: 5 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct QueryHeader {
    /// Always `KIND_QUERY`.
    pub kind: u8,
    /// Correlation index chosen by the asker. Echoed verbatim in the answer.
    pub index: U32,
}

assert_eq_size!(QueryHeader, [u8; 5]);

/// Fixed prefix of an answer datagram.
///
/// Wire size: 9 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct AnswerHeader {
    /// Always `KIND_ANSWER`.
    pub kind: u8,
    /// Index copied from the query being answered.
    pub index: U32,
    /// HTTP port on which the responder serves the answer path.
    pub port: U32,
}

assert_eq_size!(AnswerHeader, [u8; 9]);

pub const KIND_QUERY: u8 = 0x00;
pub const KIND_ANSWER: u8 = 0x01;

/// Default UDP port shared by every cooperating instance.
pub const DISCOVERY_PORT: u16 = 12304;

/// Largest datagram the receive loop accepts.
pub const MAX_DATAGRAM: usize = 2048;

// ── Packets ──────────────────────────────────────────────────────────────────

/// A decoded discovery datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// "Does anyone have `hash`?"
    Query { index: u32, hash: String },
    /// "I do; fetch `path` from me on `port`."
    Answer { index: u32, port: u16, path: String },
}

impl Packet {
    /// Build the answer path a responder advertises for `hash`.
    pub fn answer_path(prefix: &str, hash: &str) -> String {
        format!("{prefix}/{hash}.narinfo")
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::Query { index, hash } => {
                let header = QueryHeader {
                    kind: KIND_QUERY,
                    index: U32::new(*index),
                };
                [header.as_bytes(), hash.as_bytes()].concat()
            }
            Packet::Answer { index, port, path } => {
                let header = AnswerHeader {
                    kind: KIND_ANSWER,
                    index: U32::new(*index),
                    port: U32::new(u32::from(*port)),
                };
                [header.as_bytes(), path.as_bytes()].concat()
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        match bytes.first() {
            None => Err(WireError::Truncated(0)),
            Some(&KIND_QUERY) => {
                let header =
                    QueryHeader::read_from_prefix(bytes).ok_or(WireError::Truncated(bytes.len()))?;
                let hash = tail(bytes, std::mem::size_of::<QueryHeader>())?;
                if hash.is_empty() {
                    return Err(WireError::EmptyPayload);
                }
                Ok(Packet::Query {
                    index: header.index.get(),
                    hash,
                })
            }
            Some(&KIND_ANSWER) => {
                let header = AnswerHeader::read_from_prefix(bytes)
                    .ok_or(WireError::Truncated(bytes.len()))?;
                let port = header.port.get();
                let port = u16::try_from(port).map_err(|_| WireError::PortOutOfRange(port))?;
                let path = tail(bytes, std::mem::size_of::<AnswerHeader>())?;
                if path.is_empty() {
                    return Err(WireError::EmptyPayload);
                }
                Ok(Packet::Answer {
                    index: header.index.get(),
                    port,
                    path,
                })
            }
            Some(&other) => Err(WireError::UnknownKind(other)),
        }
    }
}

fn tail(bytes: &[u8], offset: usize) -> Result<String, WireError> {
    std::str::from_utf8(&bytes[offset..])
        .map(str::to_string)
        .map_err(|_| WireError::InvalidUtf8)
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting a discovery datagram.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram of {0} bytes is shorter than its header")]
    Truncated(usize),

    #[error("unknown packet kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("payload is empty")]
    EmptyPayload,

    #[error("advertised port {0} does not fit in 16 bits")]
    PortOutOfRange(u32),
}

// ── Tests ────────────────────────────────────────────────────────────────────
