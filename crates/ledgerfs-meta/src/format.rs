//! Durable checkpoint formats
//!
//! Two records anchor a checkpoint:
//!
//! - The **checkpoint header**, stored as a single container header value:
//!   four 16-digit uppercase hex words separated by single spaces
//!   (`version objectNumber objectLength reservedToNonce`).
//! - The **checkpoint trailer**, a little-endian binary record at the tail
//!   of the current checkpoint object:
//!
//! ```text
//! +----------------------------+----------------------------+
//! | 12 x u64 fixed fields      | (objectNumber, bytes) pairs|
//! | (root ref + element count  |  for the three layout      |
//! |  per tree)                 |  reports, concatenated     |
//! +----------------------------+----------------------------+
//! ```

use crate::btree::NodeRef;
use bytes::{Buf, BufMut, BytesMut};
use ledgerfs_common::{Error, LayoutReport, Result};

/// Name of the container header carrying the checkpoint record
pub const CHECKPOINT_HEADER_NAME: &str = "X-Container-Meta-Checkpoint";

/// Name of the container header carrying the storage policy
pub const STORAGE_POLICY_HEADER_NAME: &str = "X-Storage-Policy";

/// Account header marking the account as bi-modal
pub const ACCOUNT_BIMODAL_HEADER_NAME: &str = "X-Account-Meta-Bi-Modal";

/// Value posted for the bi-modal account header
pub const ACCOUNT_BIMODAL_HEADER_VALUE: &str = "true";

/// Current checkpoint header version tag
pub const CHECKPOINT_HEADER_VERSION: u64 = 2;

/// First nonce handed out on a freshly formatted volume
pub const FIRST_NONCE: u64 = 0x64;

/// Size of the trailer's fixed fields (12 x u64)
pub const TRAILER_FIXED_SIZE: usize = 96;

/// Size of one serialized layout-report element
pub const LAYOUT_ELEMENT_SIZE: usize = 16;

/// Object names in the checkpoint container are the object number in hex
#[must_use]
pub fn object_name(object_number: u64) -> String {
    format!("{object_number:016X}")
}

/// Checkpoint header, stored on the checkpoint container
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckpointHeader {
    /// Object whose tail holds the trailer; 0 means no checkpoint yet
    pub checkpoint_object_number: u64,
    /// Length of the trailer region at the tail of that object
    pub checkpoint_object_length: u64,
    /// Highest nonce durably reserved
    pub reserved_to_nonce: u64,
}

impl CheckpointHeader {
    /// Header seeded when auto-formatting a fresh container
    #[must_use]
    pub fn initial() -> Self {
        Self {
            checkpoint_object_number: 0,
            checkpoint_object_length: 0,
            reserved_to_nonce: FIRST_NONCE,
        }
    }

    /// Serialize to the container-header string form
    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{:016X} {:016X} {:016X} {:016X}",
            CHECKPOINT_HEADER_VERSION,
            self.checkpoint_object_number,
            self.checkpoint_object_length,
            self.reserved_to_nonce,
        )
    }

    /// Parse the container-header string form
    pub fn parse(value: &str) -> Result<Self> {
        let fields: Vec<&str> = value.split(' ').collect();
        if fields.is_empty() {
            return Err(Error::parse(format!("empty checkpoint header: {value:?}")));
        }

        let version = parse_hex(fields[0], "version", value)?;
        if version != CHECKPOINT_HEADER_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        if fields.len() != 4 {
            return Err(Error::parse(format!(
                "checkpoint header has {} fields, expected 4: {value:?}",
                fields.len()
            )));
        }

        Ok(Self {
            checkpoint_object_number: parse_hex(fields[1], "objectNumber", value)?,
            checkpoint_object_length: parse_hex(fields[2], "objectLength", value)?,
            reserved_to_nonce: parse_hex(fields[3], "reservedToNonce", value)?,
        })
    }
}

fn parse_hex(field: &str, what: &str, value: &str) -> Result<u64> {
    u64::from_str_radix(field, 16)
        .map_err(|_| Error::parse(format!("bad {what} in checkpoint header: {value:?}")))
}

/// Checkpoint object trailer: root references and layout element counts
/// for the three trees. The layout reports follow the fixed fields.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckpointTrailer {
    pub inode_rec_root: NodeRef,
    pub inode_rec_layout_elements: u64,
    pub log_segment_rec_root: NodeRef,
    pub log_segment_rec_layout_elements: u64,
    pub bplus_object_root: NodeRef,
    pub bplus_object_layout_elements: u64,
}

impl CheckpointTrailer {
    /// Serialize the fixed fields
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(TRAILER_FIXED_SIZE);
        for (root, elements) in [
            (&self.inode_rec_root, self.inode_rec_layout_elements),
            (&self.log_segment_rec_root, self.log_segment_rec_layout_elements),
            (&self.bplus_object_root, self.bplus_object_layout_elements),
        ] {
            buf.put_u64_le(root.object_number);
            buf.put_u64_le(root.offset);
            buf.put_u64_le(root.length);
            buf.put_u64_le(elements);
        }
        buf.to_vec()
    }
}

/// Serialize the three layout reports as packed (objectNumber, bytes)
/// pairs in trailer order (inode, log segment, B+Tree object).
#[must_use]
pub fn encode_layouts(layouts: [&LayoutReport; 3]) -> Vec<u8> {
    let total: usize = layouts.iter().map(|l| l.len()).sum();
    let mut buf = BytesMut::with_capacity(total * LAYOUT_ELEMENT_SIZE);
    for layout in layouts {
        for (&object_number, &object_bytes) in layout {
            buf.put_u64_le(object_number);
            buf.put_u64_le(object_bytes);
        }
    }
    buf.to_vec()
}

/// Parse a trailer blob fetched from the tail of the checkpoint object:
/// fixed fields followed by the three layout reports. The blob length must
/// match the declared element counts exactly.
pub fn decode_trailer(data: &[u8]) -> Result<(CheckpointTrailer, [LayoutReport; 3])> {
    if data.len() < TRAILER_FIXED_SIZE {
        return Err(Error::corrupt(format!(
            "checkpoint trailer too small: {} bytes",
            data.len()
        )));
    }

    let mut buf = &data[..];
    let mut roots = [NodeRef::default(); 3];
    let mut counts = [0u64; 3];
    for i in 0..3 {
        roots[i] = NodeRef {
            object_number: buf.get_u64_le(),
            offset: buf.get_u64_le(),
            length: buf.get_u64_le(),
        };
        counts[i] = buf.get_u64_le();
    }

    let element_bytes = counts
        .iter()
        .try_fold(0u64, |acc, &count| acc.checked_add(count))
        .and_then(|total| total.checked_mul(LAYOUT_ELEMENT_SIZE as u64))
        .ok_or_else(|| Error::corrupt("checkpoint trailer element counts overflow"))?;
    let expected = TRAILER_FIXED_SIZE as u64 + element_bytes;
    if data.len() as u64 != expected {
        return Err(Error::corrupt(format!(
            "checkpoint trailer is {} bytes, expected {expected}",
            data.len()
        )));
    }

    let mut layouts: [LayoutReport; 3] = Default::default();
    for (layout, &count) in layouts.iter_mut().zip(counts.iter()) {
        for _ in 0..count {
            let object_number = buf.get_u64_le();
            let object_bytes = buf.get_u64_le();
            layout.insert(object_number, object_bytes);
        }
    }

    let trailer = CheckpointTrailer {
        inode_rec_root: roots[0],
        inode_rec_layout_elements: counts[0],
        log_segment_rec_root: roots[1],
        log_segment_rec_layout_elements: counts[1],
        bplus_object_root: roots[2],
        bplus_object_layout_elements: counts[2],
    };

    Ok((trailer, layouts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_header_encoding() {
        let header = CheckpointHeader::initial();
        assert_eq!(
            header.encode(),
            "0000000000000002 0000000000000000 0000000000000000 0000000000000064"
        );
    }

    #[test]
    fn test_header_roundtrip() {
        let header = CheckpointHeader {
            checkpoint_object_number: 0x65,
            checkpoint_object_length: 0x1234,
            reserved_to_nonce: 0x44C,
        };
        let parsed = CheckpointHeader::parse(&header.encode()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_header_rejects_old_version() {
        let err = CheckpointHeader::parse(
            "0000000000000001 0000000000000000 0000000000000000 0000000000000064",
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion(1)));
    }

    #[test]
    fn test_header_rejects_wrong_field_count() {
        let err =
            CheckpointHeader::parse("0000000000000002 0000000000000000").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_header_rejects_bad_hex() {
        let err = CheckpointHeader::parse(
            "0000000000000002 zzzz000000000000 0000000000000000 0000000000000064",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_trailer_roundtrip() {
        let trailer = CheckpointTrailer {
            inode_rec_root: NodeRef {
                object_number: 0x65,
                offset: 0,
                length: 512,
            },
            inode_rec_layout_elements: 2,
            log_segment_rec_root: NodeRef::default(),
            log_segment_rec_layout_elements: 0,
            bplus_object_root: NodeRef {
                object_number: 0x66,
                offset: 128,
                length: 256,
            },
            bplus_object_layout_elements: 1,
        };

        let mut inode_layout = LayoutReport::new();
        inode_layout.insert(0x65, 512);
        inode_layout.insert(0x10, 0);
        let log_layout = LayoutReport::new();
        let mut obj_layout = LayoutReport::new();
        obj_layout.insert(0x66, 256);

        let mut blob = trailer.to_bytes();
        blob.extend_from_slice(&encode_layouts([
            &inode_layout,
            &log_layout,
            &obj_layout,
        ]));

        let (parsed, layouts) = decode_trailer(&blob).unwrap();
        assert_eq!(parsed, trailer);
        assert_eq!(layouts[0], inode_layout);
        assert!(layouts[1].is_empty());
        assert_eq!(layouts[2], obj_layout);
    }

    #[test]
    fn test_trailer_rejects_size_mismatch() {
        let trailer = CheckpointTrailer {
            inode_rec_layout_elements: 3, // declares elements that are absent
            ..Default::default()
        };
        let blob = trailer.to_bytes();
        assert!(matches!(decode_trailer(&blob), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_object_name() {
        assert_eq!(object_name(0x65), "0000000000000065");
        assert_eq!(object_name(u64::MAX), "FFFFFFFFFFFFFFFF");
    }
}
