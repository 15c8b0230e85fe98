//! Checkpoint writer, chunked-PUT helpers, GC, and the checkpoint daemon
//!
//! `put_checkpoint` collapses a volume's advanced state into a new
//! checkpoint: flush the trees (their dirty nodes stream into the open
//! checkpoint object), ship the trailer and packed layout reports, swap
//! the container header (the commit point), drop the replay log, and
//! garbage-collect objects no tree references anymore.
//!
//! Only the checkpoint daemon calls `put_checkpoint`, holding the volume
//! lock for the duration.

use crate::btree::{NodeIo, NodeRef};
use crate::format::{encode_layouts, object_name, CheckpointHeader, CHECKPOINT_HEADER_NAME};
use crate::store::{ChunkedPutContext, Headers, ObjectStore};
use crate::volume::{fetch_nonce_locked, TreeState, Volume, VolumeState};
use crossbeam::channel::{after, Receiver, Sender};
use crossbeam::select;
use crossbeam::sync::WaitGroup;
use ledgerfs_common::{Error, LayoutReport, Result, VolumeConfig};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info};

/// A request handed to the checkpoint daemon
pub(crate) struct CheckpointRequest {
    pub exit_on_completion: bool,
    pub done: Option<Sender<Result<()>>>,
}

/// The volume's (at most one) open chunked PUT into the checkpoint
/// container, plus the flushed-data flag the node writes feed.
pub(crate) struct ChunkedPutState {
    ctx: Option<Box<dyn ChunkedPutContext>>,
    pub object_number: u64,
    pub flushed_data: bool,
}

impl ChunkedPutState {
    pub fn new() -> Self {
        Self {
            ctx: None,
            object_number: 0,
            flushed_data: false,
        }
    }

    /// Ensure a chunked PUT is open, allocating a fresh object number for
    /// it when necessary.
    pub fn open_if_necessary(
        &mut self,
        store: &dyn ObjectStore,
        config: &VolumeConfig,
        header: &mut CheckpointHeader,
        next_nonce: &mut u64,
    ) -> Result<()> {
        if self.ctx.is_none() {
            let object_number = fetch_nonce_locked(store, config, header, next_nonce)?;
            let ctx = store.object_fetch_chunked_put_context(
                &config.account_name,
                &config.checkpoint_container_name,
                &object_name(object_number),
            )?;
            self.object_number = object_number;
            self.ctx = Some(ctx);
        }
        Ok(())
    }

    /// Running length of the open object
    pub fn bytes_put(&self) -> Result<u64> {
        self.ctx
            .as_ref()
            .map(|ctx| ctx.bytes_put())
            .ok_or_else(|| Error::storage("bytes_put with no open checkpoint chunked PUT"))
    }

    /// Append one chunk to the open object
    pub fn send_chunk(&mut self, buf: &[u8]) -> Result<()> {
        self.ctx
            .as_mut()
            .ok_or_else(|| Error::storage("send_chunk with no open checkpoint chunked PUT"))?
            .send_chunk(buf)
    }

    /// Close the open object once it has grown past `max_flush_size`,
    /// bounding single-object size (and with it recovery cost). A closed
    /// or absent context is left alone.
    pub fn close_if_necessary(&mut self, max_flush_size: u64) -> Result<()> {
        if let Some(ctx) = self.ctx.as_ref() {
            if ctx.bytes_put() >= max_flush_size {
                return self.close();
            }
        }
        Ok(())
    }

    /// Close the open object. Calling this with no open context is a
    /// programming error surfaced to the daemon as fatal.
    pub fn close(&mut self) -> Result<()> {
        match self.ctx.take() {
            Some(ctx) => ctx.close(),
            None => Err(Error::storage("close with no open checkpoint chunked PUT")),
        }
    }
}

/// Node I/O wired into one tree's flush: writes stream into the open
/// chunked PUT and are credited to that tree's layout report.
pub(crate) struct CheckpointIo<'a> {
    pub store: &'a dyn ObjectStore,
    pub config: &'a VolumeConfig,
    pub chunked: &'a mut ChunkedPutState,
    pub layout: &'a mut LayoutReport,
    pub header: &'a mut CheckpointHeader,
    pub next_nonce: &'a mut u64,
}

impl NodeIo for CheckpointIo<'_> {
    fn get_node(&mut self, node: &NodeRef) -> Result<Vec<u8>> {
        self.store.object_get(
            &self.config.account_name,
            &self.config.checkpoint_container_name,
            &object_name(node.object_number),
            node.offset,
            node.length,
        )
    }

    fn put_node(&mut self, buf: &[u8]) -> Result<(u64, u64)> {
        self.chunked
            .open_if_necessary(self.store, self.config, self.header, self.next_nonce)?;
        let offset = self.chunked.bytes_put()?;
        self.chunked.send_chunk(buf)?;
        self.chunked.flushed_data = true;

        let object_number = self.chunked.object_number;
        *self.layout.entry(object_number).or_insert(0) += buf.len() as u64;

        self.chunked.close_if_necessary(self.config.max_flush_size)?;
        Ok((object_number, offset))
    }

    fn discard_node(&mut self, node: &NodeRef) {
        if let Some(bytes) = self.layout.get_mut(&node.object_number) {
            *bytes = bytes.saturating_sub(node.length);
        }
    }
}

impl Volume {
    /// Write a checkpoint. Runs under the volume lock, from the daemon
    /// only. Any error leaves the volume in a state where a later
    /// "successful" checkpoint could mask lost node references, so the
    /// daemon treats every error as fatal.
    pub(crate) fn put_checkpoint(&self, state: &mut VolumeState) -> Result<()> {
        let VolumeState {
            header,
            trailer,
            inode_rec,
            log_segment_rec,
            bplus_object,
            chunked,
            next_nonce,
            replay_log,
            gc_pending,
            ..
        } = state;

        // Let the previous checkpoint's deletes drain first
        if let Some(wg) = gc_pending.take() {
            wg.wait();
        }

        chunked.flushed_data = false;

        trailer.inode_rec_root = flush_tree(
            inode_rec,
            self.store.as_ref(),
            &self.config,
            chunked,
            header,
            next_nonce,
        )?;
        trailer.log_segment_rec_root = flush_tree(
            log_segment_rec,
            self.store.as_ref(),
            &self.config,
            chunked,
            header,
            next_nonce,
        )?;
        trailer.bplus_object_root = flush_tree(
            bplus_object,
            self.store.as_ref(),
            &self.config,
            chunked,
            header,
            next_nonce,
        )?;

        if !chunked.flushed_data {
            // Nothing reached the object store; the existing checkpoint
            // still describes this volume exactly.
            debug!(volume = %self.config.volume_name, "checkpoint skipped, no flushed data");
            return Ok(());
        }

        inode_rec.tree.prune();
        log_segment_rec.tree.prune();
        bplus_object.tree.prune();

        trailer.inode_rec_layout_elements = inode_rec.layout.len() as u64;
        trailer.log_segment_rec_layout_elements = log_segment_rec.layout.len() as u64;
        trailer.bplus_object_layout_elements = bplus_object.layout.len() as u64;

        let trailer_buf = trailer.to_bytes();
        let layout_buf = encode_layouts([
            &inode_rec.layout,
            &log_segment_rec.layout,
            &bplus_object.layout,
        ]);

        chunked.open_if_necessary(self.store.as_ref(), &self.config, header, next_nonce)?;
        let trailer_beginning = chunked.bytes_put()?;
        chunked.send_chunk(&trailer_buf)?;
        chunked.send_chunk(&layout_buf)?;
        let trailer_ending = chunked.bytes_put()?;
        let checkpoint_object_number = chunked.object_number;
        chunked.close()?;

        header.checkpoint_object_number = checkpoint_object_number;
        header.checkpoint_object_length = trailer_ending - trailer_beginning;

        // The container POST is the commit point
        let mut headers = Headers::new();
        headers.insert(CHECKPOINT_HEADER_NAME.to_string(), header.encode());
        self.store.container_post(
            &self.config.account_name,
            &self.config.checkpoint_container_name,
            &headers,
        )?;

        // The replay log is superseded by the checkpoint just committed
        *replay_log = None;
        if let Some(path) = self.config.replay_log_path.as_deref() {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        // Garbage collection: any object whose cumulative referenced
        // bytes reached zero is safe to delete now that the header no
        // longer depends on it.
        let mut combined = LayoutReport::new();
        for tree_state in [&mut *inode_rec, &mut *log_segment_rec, &mut *bplus_object] {
            for (&object_number, &bytes) in &tree_state.layout {
                *combined.entry(object_number).or_insert(0) += bytes;
            }
            tree_state.layout.retain(|_, bytes| *bytes != 0);
        }

        let wg = WaitGroup::new();
        let mut deletes = 0u64;
        for (object_number, bytes) in combined {
            if bytes == 0 {
                self.store.object_delete_async(
                    &self.config.account_name,
                    &self.config.checkpoint_container_name,
                    &object_name(object_number),
                    wg.clone(),
                );
                deletes += 1;
            }
        }
        *gc_pending = Some(wg);

        info!(
            volume = %self.config.volume_name,
            object = %object_name(checkpoint_object_number),
            trailer_bytes = header.checkpoint_object_length,
            deletes,
            "checkpoint committed"
        );
        Ok(())
    }
}

fn flush_tree(
    tree_state: &mut TreeState,
    store: &dyn ObjectStore,
    config: &VolumeConfig,
    chunked: &mut ChunkedPutState,
    header: &mut CheckpointHeader,
    next_nonce: &mut u64,
) -> Result<NodeRef> {
    let TreeState { tree, layout } = tree_state;
    let mut io = CheckpointIo {
        store,
        config,
        chunked,
        layout,
        header,
        next_nonce,
    };
    tree.flush(&mut io)
}

/// One long-lived daemon per volume: checkpoints on request or on the
/// configured interval, and halts the volume on any checkpoint failure.
pub(crate) fn daemon(volume: Arc<Volume>, requests: Receiver<CheckpointRequest>) {
    loop {
        let request = select! {
            recv(requests) -> msg => match msg {
                Ok(request) => request,
                Err(_) => return, // volume dropped the sender
            },
            recv(after(volume.config.checkpoint_interval)) -> _ => CheckpointRequest {
                exit_on_completion: false,
                done: None,
            },
        };

        let mut state = volume.state.lock();
        debug!(volume = %volume.config.volume_name, "checkpoint start");
        let result = volume.put_checkpoint(&mut state);
        let failed = result.is_err();

        match &result {
            Ok(()) => {
                for waiter in state.next_checkpoint_waiters.drain(..) {
                    let _ = waiter.send(());
                }
            }
            Err(err) => {
                // Nodes may have been marked clean without their bytes (or
                // the trailer pointing at them) becoming durable; a later
                // checkpoint would paper over the loss. Stop taking writes.
                error!(
                    volume = %volume.config.volume_name,
                    %err,
                    "checkpoint failed, halting volume"
                );
                volume.failed.store(true, Ordering::SeqCst);
            }
        }

        let exit_on_completion = request.exit_on_completion;
        if let Some(done) = request.done {
            let _ = done.send(result);
        }
        drop(state);

        if exit_on_completion || failed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_close_absent_context_is_error() {
        let mut chunked = ChunkedPutState::new();
        assert!(chunked.close().is_err());
        assert!(chunked.bytes_put().is_err());
        assert!(chunked.send_chunk(b"x").is_err());
    }

    #[test]
    fn test_close_if_necessary_bounds_object_size() {
        let store = MemoryStore::new();
        store
            .container_put("acct", "ckpt", &Headers::new())
            .unwrap();
        let config = VolumeConfig {
            account_name: "acct".to_string(),
            checkpoint_container_name: "ckpt".to_string(),
            ..Default::default()
        };
        let mut header = CheckpointHeader::initial();
        let mut next_nonce = header.reserved_to_nonce;

        let mut chunked = ChunkedPutState::new();
        chunked
            .open_if_necessary(&store, &config, &mut header, &mut next_nonce)
            .unwrap();
        let first_object = chunked.object_number;

        chunked.send_chunk(&[0u8; 64]).unwrap();
        chunked.close_if_necessary(1024).unwrap();
        assert!(chunked.ctx.is_some(), "under the bound, stays open");

        chunked.send_chunk(&[0u8; 2048]).unwrap();
        chunked.close_if_necessary(1024).unwrap();
        assert!(chunked.ctx.is_none(), "past the bound, closed");

        // Reopening allocates a new object number
        chunked
            .open_if_necessary(&store, &config, &mut header, &mut next_nonce)
            .unwrap();
        assert_ne!(chunked.object_number, first_object);
        chunked.close().unwrap();
    }
}
