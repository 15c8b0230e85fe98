//! Local replay log
//!
//! Append-only journal of transactions since the last checkpoint. Every
//! frame begins on a 4096-byte boundary and is zero-padded up to the next
//! one; writes go through page-aligned buffers to a file opened with
//! O_SYNC, so a transaction is durable before the append returns.
//!
//! On open the log is scanned from the start: each frame's CRC-64 and
//! checkpoint fence are validated and its transaction handed to the
//! caller. The first bad frame (bad CRC, stale fence, unknown type, or a
//! declared length running past the end) is treated as the tail of the
//! log; the file is truncated there and the scan stops cleanly.

use crate::transaction::{FrameHeader, Transaction, FRAME_HEADER_SIZE};
use ledgerfs_common::checksum::crc64_ecma;
use ledgerfs_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, info, warn};

/// Replay-log frames begin on this boundary
pub const ALIGNMENT: usize = 4096;

/// Pre-allocated write buffer: frames that fit reuse it
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 100 * ALIGNMENT;

/// Round `value` up to the next alignment boundary
#[inline]
#[must_use]
pub const fn align_up(value: u64) -> u64 {
    (value + ALIGNMENT as u64 - 1) & !(ALIGNMENT as u64 - 1)
}

/// Page-aligned, zero-initialized buffer for O_SYNC/direct writes
pub struct AlignedBuffer {
    data: Vec<u8>,
    alignment: usize,
}

impl AlignedBuffer {
    /// Allocate an aligned buffer of at least `size` bytes, rounded up to
    /// the alignment boundary
    #[must_use]
    pub fn new(size: usize) -> Self {
        use std::alloc::{alloc_zeroed, Layout};

        let aligned_size = align_up(size as u64) as usize;
        let layout = Layout::from_size_align(aligned_size.max(ALIGNMENT), ALIGNMENT)
            .expect("invalid layout for aligned buffer");

        let data = unsafe {
            let ptr = alloc_zeroed(layout);
            if ptr.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            Vec::from_raw_parts(ptr, layout.size(), layout.size())
        };

        Self {
            data,
            alignment: ALIGNMENT,
        }
    }

    /// Get the buffer as a slice
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Get the buffer as a mutable slice
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Buffer size in bytes (always an alignment multiple)
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the buffer is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        use std::alloc::{dealloc, Layout};

        if !self.data.is_empty() {
            let layout = Layout::from_size_align(self.data.capacity(), self.alignment)
                .expect("invalid layout for deallocation");
            unsafe {
                let ptr = self.data.as_mut_ptr();
                std::mem::forget(std::mem::take(&mut self.data));
                dealloc(ptr, layout);
            }
        }
    }
}

/// The volume's local replay log
pub struct ReplayLog {
    file: File,
    position: u64,
    write_buf: AlignedBuffer,
}

impl ReplayLog {
    /// Create a fresh log. The file must not already exist; a leftover log
    /// at this path means the previous checkpoint never removed it.
    pub fn create(path: &Path) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        sync_flags(&mut options);

        let file = options.open(path)?;
        debug!(path = %path.display(), "created replay log");

        Ok(Self {
            file,
            position: 0,
            write_buf: AlignedBuffer::new(DEFAULT_WRITE_BUFFER_SIZE),
        })
    }

    /// Open an existing log for replay and subsequent appends. Returns
    /// `None` when no log exists.
    pub fn open(path: &Path) -> Result<Option<Self>> {
        let mut options = OpenOptions::new();
        options.read(true).write(true);
        sync_flags(&mut options);

        let file = match options.open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        Ok(Some(Self {
            file,
            position: 0,
            write_buf: AlignedBuffer::new(DEFAULT_WRITE_BUFFER_SIZE),
        }))
    }

    /// Byte offset of the next append (always an alignment multiple)
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Append one transaction frame, zero-padded to the alignment
    /// boundary. Durable when this returns.
    pub fn append(&mut self, txn: &Transaction, last_checkpoint_object_number: u64) -> Result<()> {
        let frame = txn.frame_size();
        let aligned = align_up(frame as u64) as usize;

        self.file.seek(SeekFrom::Start(self.position))?;
        if aligned <= self.write_buf.len() {
            let out = &mut self.write_buf.as_mut_slice()[..aligned];
            out.fill(0);
            txn.fill_frame(last_checkpoint_object_number, out);
            self.file.write_all(out)?;
        } else {
            let mut fresh = AlignedBuffer::new(frame);
            txn.fill_frame(last_checkpoint_object_number, fresh.as_mut_slice());
            self.file.write_all(fresh.as_slice())?;
        }

        #[cfg(not(unix))]
        self.file.sync_data()?;

        self.position += aligned as u64;
        Ok(())
    }

    /// Scan the log from the start, handing each valid transaction to
    /// `apply`. Stops at the first bad frame, truncating the file there;
    /// afterwards the log is positioned for appends.
    pub fn scan(
        &mut self,
        last_checkpoint_object_number: u64,
        mut apply: impl FnMut(Transaction) -> Result<()>,
    ) -> Result<()> {
        // Discard any partial page at the tail
        let size = self.file.metadata()?.len() & !(ALIGNMENT as u64 - 1);

        self.file.seek(SeekFrom::Start(0))?;
        let mut head = AlignedBuffer::new(ALIGNMENT);
        let mut pos = 0u64;
        let mut replayed = 0u64;

        while pos < size {
            self.file.read_exact(head.as_mut_slice())?;
            let header = FrameHeader::parse(head.as_slice());
            let frame_size = header.frame_size();

            if frame_size < FRAME_HEADER_SIZE as u64 || frame_size > size - pos {
                warn!(offset = pos, "replay-log frame length invalid, truncating");
                return self.truncate_at(pos);
            }
            let aligned = align_up(frame_size);

            let outcome = if aligned as usize <= head.len() {
                decode_frame(
                    &head.as_slice()[..frame_size as usize],
                    last_checkpoint_object_number,
                )
            } else {
                let mut big = AlignedBuffer::new(aligned as usize);
                self.file.seek(SeekFrom::Start(pos))?;
                self.file.read_exact(big.as_mut_slice())?;
                decode_frame(
                    &big.as_slice()[..frame_size as usize],
                    last_checkpoint_object_number,
                )
            };

            match outcome {
                Ok(txn) => {
                    apply(txn)?;
                    replayed += 1;
                    pos += aligned;
                }
                Err(Error::Corrupt(reason)) => {
                    warn!(offset = pos, %reason, "replay-log frame rejected, truncating");
                    return self.truncate_at(pos);
                }
                Err(err) => return Err(err),
            }
        }

        // A partial tail page, if any, is dropped as well
        if self.file.metadata()?.len() != size {
            self.file.set_len(size)?;
        }

        self.position = pos;
        self.file.seek(SeekFrom::Start(pos))?;
        info!(transactions = replayed, end = pos, "replay log applied");
        Ok(())
    }

    fn truncate_at(&mut self, pos: u64) -> Result<()> {
        self.file.set_len(pos)?;
        self.file.seek(SeekFrom::Start(pos))?;
        self.position = pos;
        Ok(())
    }
}

fn sync_flags(options: &mut OpenOptions) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(libc::O_SYNC);
    }
    #[cfg(not(unix))]
    let _ = options;
}

/// Validate CRC and fence, then decode the payload. All failures are
/// corruption: the caller truncates the log at this frame.
fn decode_frame(frame: &[u8], last_checkpoint_object_number: u64) -> Result<Transaction> {
    let header = FrameHeader::parse(frame);
    if crc64_ecma(&frame[8..]) != header.crc64 {
        return Err(Error::corrupt("replay-log frame checksum mismatch"));
    }
    if header.last_checkpoint_object_number != last_checkpoint_object_number {
        return Err(Error::corrupt(format!(
            "replay-log frame fenced to checkpoint object {:016X}, current is {:016X}",
            header.last_checkpoint_object_number, last_checkpoint_object_number
        )));
    }
    Transaction::decode_payload(header.transaction_type, &frame[FRAME_HEADER_SIZE..])
}
