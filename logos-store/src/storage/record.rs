//! On-disk record layout shared by documents, raw keyspaces and archived
//! revision bodies.
//!
//! ```text
//! ┌──────────────────────────────────────────┬──────────────────────┐
//! │ header (bincode)                         │ body (raw bytes)     │
//! │ sequence · meta · body_compressed        │ LZ4 when compressed  │
//! └──────────────────────────────────────────┴──────────────────────┘
//! ```
//!
//! The header is decoded on its own, so metadata-only reads never copy or
//! decompress the body.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// How much of a stored document to materialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentOptions {
    /// Metadata plus the full revision tree.
    #[default]
    Full,
    /// Flags, current revision ID and sequence only.
    MetaOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RecordHeader {
    pub sequence: u64,
    pub meta: Vec<u8>,
    pub body_compressed: bool,
}

/// A decoded record. `body` is `None` when only the header was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Record {
    pub sequence: u64,
    pub meta: Vec<u8>,
    pub body: Option<Vec<u8>>,
}

impl Record {
    pub fn encode(sequence: u64, meta: &[u8], body: &[u8], compress: bool) -> Result<Vec<u8>> {
        let header = RecordHeader {
            sequence,
            meta: meta.to_vec(),
            body_compressed: compress,
        };
        let mut out = bincode::serde::encode_to_vec(&header, bincode::config::standard())
            .map_err(|e| StoreError::Internal(format!("record header encode: {e}")))?;
        if compress {
            out.extend_from_slice(&lz4_flex::compress_prepend_size(body));
        } else {
            out.extend_from_slice(body);
        }
        Ok(out)
    }

    pub fn decode_header(bytes: &[u8]) -> Result<(RecordHeader, usize)> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::corrupt("record header", e))
    }

    pub fn decode(bytes: &[u8], content: ContentOptions) -> Result<Self> {
        let (header, consumed) = Self::decode_header(bytes)?;
        let body = match content {
            ContentOptions::MetaOnly => None,
            ContentOptions::Full => {
                let raw = &bytes[consumed..];
                let body = if header.body_compressed {
                    lz4_flex::decompress_size_prepended(raw)
                        .map_err(|e| StoreError::corrupt("record body", e))?
                } else {
                    raw.to_vec()
                };
                Some(body)
            }
        };
        Ok(Self {
            sequence: header.sequence,
            meta: header.meta,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_only_skips_body() {
        let bytes = Record::encode(7, b"meta", b"a body that stays on disk", true).unwrap();
        let record = Record::decode(&bytes, ContentOptions::MetaOnly).unwrap();
        assert_eq!(record.sequence, 7);
        assert_eq!(record.meta, b"meta");
        assert!(record.body.is_none());
    }

    #[test]
    fn test_compressed_body_readback() {
        let body = "The quick brown fox jumps over the lazy dog. ".repeat(50);
        let compressed = Record::encode(1, b"", body.as_bytes(), true).unwrap();
        let plain = Record::encode(1, b"", body.as_bytes(), false).unwrap();
        assert!(compressed.len() < plain.len());

        let record = Record::decode(&compressed, ContentOptions::Full).unwrap();
        assert_eq!(record.body.as_deref(), Some(body.as_bytes()));
    }

    #[test]
    fn test_empty_body() {
        let bytes = Record::encode(0, b"m", b"", false).unwrap();
        let record = Record::decode(&bytes, ContentOptions::Full).unwrap();
        assert_eq!(record.body, Some(Vec::new()));
    }

    #[test]
    fn test_truncated_header_is_internal() {
        let err = Record::decode(&[], ContentOptions::Full).unwrap_err();
        assert!(matches!(err, StoreError::Internal(_)));
    }
}
