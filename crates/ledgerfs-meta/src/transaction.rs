//! Replay-log transactions
//!
//! Every surviving mutation to one of the three trees is journaled as a
//! self-contained frame:
//!
//! ```text
//! +-------+----------------+----------------------+----------+---------+
//! | CRC64 | BytesFollowing | LastCheckpointObjNum | TxnType  | payload |
//! | u64   | u64            | u64 (fence)          | u64      | var     |
//! +-------+----------------+----------------------+----------+---------+
//! ```
//!
//! All fields little-endian. The CRC covers everything after itself.
//! `BytesFollowing` counts the bytes after the first two fields, so the
//! frame occupies `BytesFollowing + 16` bytes before zero padding to the
//! next alignment boundary.

use bytes::{Buf, BufMut};
use ledgerfs_common::checksum::crc64_ecma;
use ledgerfs_common::{Error, Result};

/// Size of the fixed frame header (4 x u64)
pub const FRAME_HEADER_SIZE: usize = 32;

const TXN_PUT_INODE_REC: u64 = 0;
const TXN_PUT_INODE_RECS: u64 = 1;
const TXN_DELETE_INODE_REC: u64 = 2;
const TXN_PUT_LOG_SEGMENT_REC: u64 = 3;
const TXN_DELETE_LOG_SEGMENT_REC: u64 = 4;
const TXN_PUT_BPLUS_TREE_OBJECT: u64 = 5;
const TXN_DELETE_BPLUS_TREE_OBJECT: u64 = 6;

/// One journaled mutation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transaction {
    PutInodeRec { inode_number: u64, value: Vec<u8> },
    PutInodeRecs { recs: Vec<(u64, Vec<u8>)> },
    DeleteInodeRec { inode_number: u64 },
    PutLogSegmentRec { segment_number: u64, value: Vec<u8> },
    DeleteLogSegmentRec { segment_number: u64 },
    PutBPlusTreeObject { object_number: u64, value: Vec<u8> },
    DeleteBPlusTreeObject { object_number: u64 },
}

impl Transaction {
    /// Wire tag for this transaction
    #[must_use]
    pub fn transaction_type(&self) -> u64 {
        match self {
            Self::PutInodeRec { .. } => TXN_PUT_INODE_REC,
            Self::PutInodeRecs { .. } => TXN_PUT_INODE_RECS,
            Self::DeleteInodeRec { .. } => TXN_DELETE_INODE_REC,
            Self::PutLogSegmentRec { .. } => TXN_PUT_LOG_SEGMENT_REC,
            Self::DeleteLogSegmentRec { .. } => TXN_DELETE_LOG_SEGMENT_REC,
            Self::PutBPlusTreeObject { .. } => TXN_PUT_BPLUS_TREE_OBJECT,
            Self::DeleteBPlusTreeObject { .. } => TXN_DELETE_BPLUS_TREE_OBJECT,
        }
    }

    /// Exact payload size in bytes
    #[must_use]
    pub fn payload_len(&self) -> usize {
        match self {
            Self::PutInodeRec { value, .. }
            | Self::PutLogSegmentRec { value, .. }
            | Self::PutBPlusTreeObject { value, .. } => 16 + value.len(),
            Self::PutInodeRecs { recs } => {
                8 + recs.iter().map(|(_, v)| 16 + v.len()).sum::<usize>()
            }
            Self::DeleteInodeRec { .. }
            | Self::DeleteLogSegmentRec { .. }
            | Self::DeleteBPlusTreeObject { .. } => 8,
        }
    }

    /// Total frame size before alignment padding
    #[must_use]
    pub fn frame_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload_len()
    }

    /// Serialize the full frame into `out`, which must hold at least
    /// `frame_size()` bytes. Bytes beyond the frame are left untouched.
    pub fn fill_frame(&self, last_checkpoint_object_number: u64, out: &mut [u8]) {
        let frame = self.frame_size();
        assert!(out.len() >= frame, "frame buffer too small");

        {
            let mut buf = &mut out[8..frame];
            buf.put_u64_le((frame - 16) as u64); // BytesFollowing
            buf.put_u64_le(last_checkpoint_object_number);
            buf.put_u64_le(self.transaction_type());
            self.encode_payload(&mut buf);
        }

        let crc = crc64_ecma(&out[8..frame]);
        out[..8].copy_from_slice(&crc.to_le_bytes());
    }

    fn encode_payload<B: BufMut>(&self, buf: &mut B) {
        match self {
            Self::PutInodeRec {
                inode_number: key,
                value,
            }
            | Self::PutLogSegmentRec {
                segment_number: key,
                value,
            }
            | Self::PutBPlusTreeObject {
                object_number: key,
                value,
            } => {
                buf.put_u64_le(*key);
                buf.put_u64_le(value.len() as u64);
                buf.put_slice(value);
            }
            Self::PutInodeRecs { recs } => {
                buf.put_u64_le(recs.len() as u64);
                for (inode_number, value) in recs {
                    buf.put_u64_le(*inode_number);
                    buf.put_u64_le(value.len() as u64);
                    buf.put_slice(value);
                }
            }
            Self::DeleteInodeRec { inode_number: key }
            | Self::DeleteLogSegmentRec {
                segment_number: key,
            }
            | Self::DeleteBPlusTreeObject {
                object_number: key,
            } => {
                buf.put_u64_le(*key);
            }
        }
    }

    /// Decode a payload for the given wire tag. Unknown tags and short
    /// payloads are corruption, which replay treats as end-of-log.
    pub fn decode_payload(transaction_type: u64, payload: &[u8]) -> Result<Self> {
        let mut buf = payload;
        let txn = match transaction_type {
            TXN_PUT_INODE_REC => {
                let (inode_number, value) = get_keyed_value(&mut buf)?;
                Self::PutInodeRec {
                    inode_number,
                    value,
                }
            }
            TXN_PUT_INODE_RECS => {
                let count = get_u64(&mut buf)?;
                let mut recs = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    recs.push(get_keyed_value(&mut buf)?);
                }
                Self::PutInodeRecs { recs }
            }
            TXN_DELETE_INODE_REC => Self::DeleteInodeRec {
                inode_number: get_u64(&mut buf)?,
            },
            TXN_PUT_LOG_SEGMENT_REC => {
                let (segment_number, value) = get_keyed_value(&mut buf)?;
                Self::PutLogSegmentRec {
                    segment_number,
                    value,
                }
            }
            TXN_DELETE_LOG_SEGMENT_REC => Self::DeleteLogSegmentRec {
                segment_number: get_u64(&mut buf)?,
            },
            TXN_PUT_BPLUS_TREE_OBJECT => {
                let (object_number, value) = get_keyed_value(&mut buf)?;
                Self::PutBPlusTreeObject {
                    object_number,
                    value,
                }
            }
            TXN_DELETE_BPLUS_TREE_OBJECT => Self::DeleteBPlusTreeObject {
                object_number: get_u64(&mut buf)?,
            },
            other => {
                return Err(Error::corrupt(format!("unknown transaction type {other}")));
            }
        };
        Ok(txn)
    }

    /// Short description for trace records
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::PutInodeRec { inode_number, .. } => {
                format!("PutInodeRec {inode_number:016X}")
            }
            Self::PutInodeRecs { recs } => format!("PutInodeRecs x{}", recs.len()),
            Self::DeleteInodeRec { inode_number } => {
                format!("DeleteInodeRec {inode_number:016X}")
            }
            Self::PutLogSegmentRec { segment_number, .. } => {
                format!("PutLogSegmentRec {segment_number:016X}")
            }
            Self::DeleteLogSegmentRec { segment_number } => {
                format!("DeleteLogSegmentRec {segment_number:016X}")
            }
            Self::PutBPlusTreeObject { object_number, .. } => {
                format!("PutBPlusTreeObject {object_number:016X}")
            }
            Self::DeleteBPlusTreeObject { object_number } => {
                format!("DeleteBPlusTreeObject {object_number:016X}")
            }
        }
    }
}

/// Fixed frame header as read back from the log
#[derive(Clone, Copy, Debug)]
pub struct FrameHeader {
    pub crc64: u64,
    pub bytes_following: u64,
    pub last_checkpoint_object_number: u64,
    pub transaction_type: u64,
}

impl FrameHeader {
    /// Parse the fixed header from the start of a frame
    #[must_use]
    pub fn parse(data: &[u8]) -> Self {
        let mut buf = data;
        Self {
            crc64: buf.get_u64_le(),
            bytes_following: buf.get_u64_le(),
            last_checkpoint_object_number: buf.get_u64_le(),
            transaction_type: buf.get_u64_le(),
        }
    }

    /// Total frame size (before alignment padding) this header declares
    #[must_use]
    pub fn frame_size(&self) -> u64 {
        self.bytes_following.saturating_add(16)
    }
}

fn get_u64(buf: &mut &[u8]) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(Error::corrupt("transaction payload truncated"));
    }
    Ok(buf.get_u64_le())
}

fn get_keyed_value(buf: &mut &[u8]) -> Result<(u64, Vec<u8>)> {
    let key = get_u64(buf)?;
    let len = get_u64(buf)? as usize;
    if buf.remaining() < len {
        return Err(Error::corrupt("transaction value truncated"));
    }
    let mut value = vec![0u8; len];
    buf.copy_to_slice(&mut value);
    Ok((key, value))
}
