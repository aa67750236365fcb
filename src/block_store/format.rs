//! On-disk layout of hourly block files.
//!
//! ```text
//! +-----------------+
//! | header (32 B)   |  magic, version, codec, encoding, checksum flag,
//! +-----------------+  nominal block size, creation time
//! | meta | block    |  per-block metadata (JSON, length-prefixed) followed
//! | meta | block    |  by the compressed block payload
//! | ...             |
//! +-----------------+
//! | index (JSON)    |  file stats, final resource states, block meta list
//! +-----------------+
//! | footer (20 B)   |  index offset, index length, magic
//! +-----------------+
//! ```
//!
//! The index is written once, at file close. Everything before it is
//! append-only, so a crash can only ever cost the unsealed tail.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::event::{EventKind, ResourceStatus};

pub const HEADER_MAGIC: [u8; 4] = *b"SPCB";
pub const FOOTER_MAGIC: [u8; 4] = *b"SPCI";
pub const FORMAT_VERSION: u8 = 1;

pub const HEADER_LEN: usize = 32;
pub const FOOTER_LEN: usize = 20;

/// Compression codec applied to block payloads.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Codec {
    None,
    Gzip,
}

impl Codec {
    fn to_byte(self) -> u8 {
        match self {
            Codec::None => 0,
            Codec::Gzip => 1,
        }
    }

    fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(Codec::None),
            1 => Some(Codec::Gzip),
            _ => None,
        }
    }
}

/// Encoding of events within a decompressed block. Only newline-delimited
/// JSON exists today; the byte is carried so a future encoding can be
/// detected rather than misread.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Encoding {
    Ndjson,
}

impl Encoding {
    fn to_byte(self) -> u8 {
        0
    }

    fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(Encoding::Ndjson),
            _ => None,
        }
    }
}

#[derive(Debug, Snafu)]
pub enum FormatError {
    #[snafu(display("file header has bad magic"))]
    BadHeaderMagic,

    #[snafu(display("unsupported block file version: found {}, supported {}", found, FORMAT_VERSION))]
    UnsupportedVersion { found: u8 },

    #[snafu(display("unknown compression codec byte {}", found))]
    UnknownCodec { found: u8 },

    #[snafu(display("unknown encoding byte {}", found))]
    UnknownEncoding { found: u8 },

    #[snafu(display("file footer has bad magic"))]
    BadFooterMagic,

    #[snafu(display("file too short to hold a {} section", section))]
    Truncated { section: &'static str },

    #[snafu(display("failed to decode {} JSON: {}", section, source))]
    Decode {
        section: &'static str,
        source: serde_json::Error,
    },
}

/// Fixed-size file header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileHeader {
    pub version: u8,
    pub codec: Codec,
    pub encoding: Encoding,
    pub checksums: bool,
    pub nominal_block_size: u32,
    pub created_at_secs: i64,
}

impl FileHeader {
    pub fn new(codec: Codec, nominal_block_size: u32, created_at_secs: i64) -> Self {
        Self {
            version: FORMAT_VERSION,
            codec,
            encoding: Encoding::Ndjson,
            checksums: true,
            nominal_block_size,
            created_at_secs,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&HEADER_MAGIC);
        buf[4] = self.version;
        buf[5] = self.codec.to_byte();
        buf[6] = self.encoding.to_byte();
        buf[7] = u8::from(self.checksums);
        buf[8..12].copy_from_slice(&self.nominal_block_size.to_be_bytes());
        buf[12..20].copy_from_slice(&self.created_at_secs.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < HEADER_LEN {
            return Err(FormatError::Truncated { section: "header" });
        }
        if buf[0..4] != HEADER_MAGIC {
            return Err(FormatError::BadHeaderMagic);
        }
        let version = buf[4];
        if version != FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion { found: version });
        }
        let codec = Codec::from_byte(buf[5]).ok_or(FormatError::UnknownCodec { found: buf[5] })?;
        let encoding =
            Encoding::from_byte(buf[6]).ok_or(FormatError::UnknownEncoding { found: buf[6] })?;
        let checksums = buf[7] != 0;
        let nominal_block_size = u32::from_be_bytes(buf[8..12].try_into().expect("sized slice"));
        let created_at_secs = i64::from_be_bytes(buf[12..20].try_into().expect("sized slice"));
        Ok(Self {
            version,
            codec,
            encoding,
            checksums,
            nominal_block_size,
            created_at_secs,
        })
    }
}

/// Fixed-size trailer locating the index section.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileFooter {
    pub index_offset: u64,
    pub index_len: u64,
}

impl FileFooter {
    pub fn encode(&self) -> [u8; FOOTER_LEN] {
        let mut buf = [0u8; FOOTER_LEN];
        buf[0..8].copy_from_slice(&self.index_offset.to_be_bytes());
        buf[8..16].copy_from_slice(&self.index_len.to_be_bytes());
        buf[16..20].copy_from_slice(&FOOTER_MAGIC);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        if buf.len() < FOOTER_LEN {
            return Err(FormatError::Truncated { section: "footer" });
        }
        if buf[16..20] != FOOTER_MAGIC {
            return Err(FormatError::BadFooterMagic);
        }
        Ok(Self {
            index_offset: u64::from_be_bytes(buf[0..8].try_into().expect("sized slice")),
            index_len: u64::from_be_bytes(buf[8..16].try_into().expect("sized slice")),
        })
    }
}

/// Metadata describing one sealed block.
///
/// Written ahead of the block payload and repeated in the trailing index so
/// queries can skip blocks without touching their payload bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Byte offset of the payload within the file.
    pub offset: u64,
    pub compressed_len: u32,
    pub uncompressed_len: u32,
    pub event_count: u32,
    /// CRC32 over the compressed payload bytes.
    pub checksum: u32,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub groups: BTreeSet<String>,
    pub kinds: BTreeSet<String>,
    pub namespaces: BTreeSet<String>,
}

impl BlockMeta {
    /// Whether any event matching the given attribute predicates could live
    /// in this block. Conservative: `true` means "must scan".
    pub fn may_match(
        &self,
        from_ns: i64,
        to_ns: i64,
        group: Option<&str>,
        kind: Option<&str>,
        namespace: Option<&str>,
    ) -> bool {
        if self.max_timestamp < from_ns || self.min_timestamp > to_ns {
            return false;
        }
        if let Some(group) = group {
            if !self.groups.contains(group) {
                return false;
            }
        }
        if let Some(kind) = kind {
            if !self.kinds.contains(kind) {
                return false;
            }
        }
        if let Some(namespace) = namespace {
            if !self.namespaces.contains(namespace) {
                return false;
            }
        }
        true
    }

    pub fn encode_prefixed(&self) -> Result<Vec<u8>, serde_json::Error> {
        let body = serde_json::to_vec(self)?;
        let mut buf = Vec::with_capacity(4 + body.len());
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }
}

/// The last observed event for a uid at file close.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FinalState {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    pub event_kind: EventKind,
    pub status: ResourceStatus,
    pub timestamp: i64,
}

/// Aggregate statistics for one file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FileStats {
    pub event_count: u64,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    /// Event counts per resource kind.
    pub kinds: BTreeMap<String, u64>,
    /// Event counts per namespace.
    pub namespaces: BTreeMap<String, u64>,
}

/// Trailing index section.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FileIndex {
    pub stats: FileStats,
    /// Last event per uid at file close.
    pub final_states: BTreeMap<String, FinalState>,
    pub blocks: Vec<BlockMeta>,
}

impl FileIndex {
    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        serde_json::from_slice(buf).map_err(|source| FormatError::Decode {
            section: "index",
            source,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = FileHeader::new(Codec::Gzip, 10 * 1024 * 1024, 1_700_000_000);
        let decoded = FileHeader::decode(&header.encode()).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn header_rejects_unknown_version() {
        let mut buf = FileHeader::new(Codec::Gzip, 1024, 0).encode();
        buf[4] = 99;
        match FileHeader::decode(&buf) {
            Err(FormatError::UnsupportedVersion { found: 99 }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn footer_round_trip() {
        let footer = FileFooter {
            index_offset: 12345,
            index_len: 678,
        };
        let decoded = FileFooter::decode(&footer.encode()).unwrap();
        assert_eq!(footer, decoded);
    }

    #[test]
    fn block_meta_skip_logic() {
        let meta = BlockMeta {
            offset: 0,
            compressed_len: 10,
            uncompressed_len: 20,
            event_count: 1,
            checksum: 0,
            min_timestamp: 100,
            max_timestamp: 200,
            groups: ["apps".to_string()].into_iter().collect(),
            kinds: ["Deployment".to_string()].into_iter().collect(),
            namespaces: ["default".to_string()].into_iter().collect(),
        };

        assert!(meta.may_match(0, 1_000, None, None, None));
        assert!(meta.may_match(0, 1_000, None, Some("Deployment"), None));
        assert!(!meta.may_match(0, 1_000, None, Some("Pod"), None));
        assert!(!meta.may_match(201, 1_000, None, None, None));
        assert!(!meta.may_match(0, 99, None, None, None));
        assert!(!meta.may_match(0, 1_000, Some("batch"), None, None));
        assert!(!meta.may_match(0, 1_000, None, None, Some("kube-system")));
    }
}
