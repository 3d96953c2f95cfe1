//! Backend resource ids
//!
//! A row id is a base64 string (with `-` in place of `/`) over up to 20 bytes:
//!
//! 1. bytes 0..4: database id (u32, little endian)
//! 2. bytes 4..8: collection id (u32, little endian), flagged by bit 7 of byte 4
//! 3. bytes 8..16: document id (u64, little endian) when the high nibble of byte 15 is zero

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

const MAX_RID_BYTES: usize = 20;
const COLLECTION_FLAG: u8 = 0x80;
const DOCUMENT_CHILD_TYPE: u8 = 0x00;

/// Parsed row id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ResourceId {
    /// Owning database
    pub database: u32,
    /// Owning collection, zero if absent
    pub document_collection: u32,
    /// Document, zero if absent
    pub document: u64,
}

impl ResourceId {
    /// Parse a row id; `None` if it is not a well formed id
    pub fn parse(rid: &str) -> Option<Self> {
        if rid.is_empty() || rid.len() % 4 != 0 {
            return None;
        }
        let bytes = STANDARD.decode(rid.replace('-', "/")).ok()?;
        if bytes.len() > MAX_RID_BYTES || bytes.len() < 4 {
            return None;
        }

        let mut parsed = ResourceId {
            database: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            ..Default::default()
        };

        if bytes.len() >= 8 && bytes[4] & COLLECTION_FLAG != 0 {
            parsed.document_collection = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

            if bytes.len() >= 16 && bytes[15] >> 4 == DOCUMENT_CHILD_TYPE {
                let mut doc = [0u8; 8];
                doc.copy_from_slice(&bytes[8..16]);
                parsed.document = u64::from_le_bytes(doc);
            }
        }

        Some(parsed)
    }

    /// Build the row id of a document
    ///
    /// The collection id gets its flag bit forced on and the document id
    /// must leave the top nibble of its last byte clear.
    pub fn document_rid(database: u32, collection: u32, document: u64) -> String {
        let mut bytes = Vec::with_capacity(16);
        bytes.extend_from_slice(&database.to_le_bytes());
        bytes.extend_from_slice(&(collection | COLLECTION_FLAG as u32).to_le_bytes());
        bytes.extend_from_slice(&(document & 0x0FFF_FFFF_FFFF_FFFF).to_le_bytes());
        STANDARD.encode(bytes).replace('/', "-")
    }

    /// Build the rid of a collection
    pub fn collection_rid(database: u32, collection: u32) -> String {
        let mut bytes = Vec::with_capacity(8);
        bytes.extend_from_slice(&database.to_le_bytes());
        bytes.extend_from_slice(&(collection | COLLECTION_FLAG as u32).to_le_bytes());
        STANDARD.encode(bytes).replace('/', "-")
    }

    /// True if both ids belong to the same database and collection
    pub fn same_collection(&self, other: &ResourceId) -> bool {
        self.database == other.database && self.document_collection == other.document_collection
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_rid_parses_back() {
        let rid = ResourceId::document_rid(7, 3, 42);
        let parsed = ResourceId::parse(&rid).unwrap();
        assert_eq!(parsed.database, 7);
        assert_eq!(parsed.document_collection, 3 | 0x80);
        assert_eq!(parsed.document, 42);
    }

    #[test]
    fn test_rejects_bad_length() {
        assert!(ResourceId::parse("abc").is_none());
        assert!(ResourceId::parse("").is_none());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(ResourceId::parse("!!!!").is_none());
        // 24 decoded bytes
        assert!(ResourceId::parse(&"A".repeat(32)).is_none());
    }

    #[test]
    fn test_database_only() {
        let rid = STANDARD.encode(9u32.to_le_bytes());
        let parsed = ResourceId::parse(&rid).unwrap();
        assert_eq!(parsed.database, 9);
        assert_eq!(parsed.document_collection, 0);
    }

    #[test]
    fn test_dash_stands_for_slash() {
        // Document id chosen so the encoding contains '/'
        let rid = ResourceId::document_rid(0xFFFF_FFFF, 0xFFFF_FFFF, 0x0FFF_FFFF_FFFF_FFFF);
        assert!(!rid.contains('/'));
        assert!(ResourceId::parse(&rid).is_some());
    }

    #[test]
    fn test_collection_rid_has_no_document() {
        let parsed = ResourceId::parse(&ResourceId::collection_rid(4, 1)).unwrap();
        assert_eq!(parsed.database, 4);
        assert_eq!(parsed.document_collection, 0x81);
        assert_eq!(parsed.document, 0);
    }

    #[test]
    fn test_same_collection() {
        let a = ResourceId::parse(&ResourceId::document_rid(1, 2, 3)).unwrap();
        let b = ResourceId::parse(&ResourceId::document_rid(1, 2, 4)).unwrap();
        let c = ResourceId::parse(&ResourceId::document_rid(1, 5, 3)).unwrap();
        assert!(a.same_collection(&b));
        assert!(!a.same_collection(&c));
    }
}
