//! Volume lifecycle and mutation surface
//!
//! A [`Volume`] owns the three metadata B+Trees, their layout reports,
//! the current checkpoint header and trailer, the replay log, and the
//! nonce allocator. A single mutex serializes every externally visible
//! operation; the checkpoint daemon is the only task that writes
//! checkpoints and it takes the same mutex for the duration.
//!
//! Bringing a volume up reads the checkpoint header from the container
//! (optionally formatting a missing one), loads the trailer and layout
//! reports from the tail of the checkpoint object, reopens the trees,
//! replays the local log, and starts the daemon. Bringing it down is one
//! final checkpoint with `exit_on_completion`.

use crate::btree::{BPlusTree, NodeIo, NodeRef};
use crate::cache::NodeCache;
use crate::checkpoint::{daemon, CheckpointRequest, ChunkedPutState};
use crate::format::{
    decode_trailer, object_name, CheckpointHeader, CheckpointTrailer,
    ACCOUNT_BIMODAL_HEADER_NAME, ACCOUNT_BIMODAL_HEADER_VALUE, CHECKPOINT_HEADER_NAME,
    STORAGE_POLICY_HEADER_NAME,
};
use crate::replaylog::ReplayLog;
use crate::store::{Headers, ObjectStore};
use crate::transaction::Transaction;
use crossbeam::channel::{bounded, Receiver, Sender};
use crossbeam::sync::WaitGroup;
use ledgerfs_common::{Error, LayoutReport, Result, TreeType, VolumeConfig};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

/// One tree plus the engine's accounting of which objects its nodes
/// occupy
pub(crate) struct TreeState {
    pub tree: BPlusTree,
    pub layout: LayoutReport,
}

/// All mutable volume state, guarded by the volume mutex
pub(crate) struct VolumeState {
    pub header: CheckpointHeader,
    pub trailer: CheckpointTrailer,
    pub inode_rec: TreeState,
    pub log_segment_rec: TreeState,
    pub bplus_object: TreeState,
    pub chunked: ChunkedPutState,
    pub next_nonce: u64,
    pub replay_log: Option<ReplayLog>,
    pub gc_pending: Option<WaitGroup>,
    pub next_checkpoint_waiters: Vec<Sender<()>>,
}

impl VolumeState {
    /// Apply one replayed transaction to the trees
    fn apply(&mut self, txn: Transaction) {
        match txn {
            Transaction::PutInodeRec {
                inode_number,
                value,
            } => put_or_patch(&mut self.inode_rec.tree, inode_number, value),
            Transaction::PutInodeRecs { recs } => {
                for (inode_number, value) in recs {
                    put_or_patch(&mut self.inode_rec.tree, inode_number, value);
                }
            }
            Transaction::DeleteInodeRec { inode_number } => {
                self.inode_rec.tree.delete_by_key(inode_number);
            }
            Transaction::PutLogSegmentRec {
                segment_number,
                value,
            } => put_or_patch(&mut self.log_segment_rec.tree, segment_number, value),
            Transaction::DeleteLogSegmentRec { segment_number } => {
                self.log_segment_rec.tree.delete_by_key(segment_number);
            }
            Transaction::PutBPlusTreeObject {
                object_number,
                value,
            } => put_or_patch(&mut self.bplus_object.tree, object_number, value),
            Transaction::DeleteBPlusTreeObject { object_number } => {
                self.bplus_object.tree.delete_by_key(object_number);
            }
        }
    }
}

fn put_or_patch(tree: &mut BPlusTree, key: u64, value: Vec<u8>) {
    if !tree.patch_by_key(key, &value) {
        tree.put(key, value);
    }
}

/// A metadata volume: three checkpointed B+Tree maps plus their replay
/// log, nonce allocator, and checkpoint daemon
pub struct Volume {
    pub(crate) config: VolumeConfig,
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) state: Mutex<VolumeState>,
    pub(crate) failed: AtomicBool,
    down: AtomicBool,
    request_tx: Sender<CheckpointRequest>,
    daemon: Mutex<Option<thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("config", &self.config)
            .field("failed", &self.failed.load(std::sync::atomic::Ordering::Relaxed))
            .field("down", &self.down.load(std::sync::atomic::Ordering::Relaxed))
            .finish()
    }
}

impl Volume {
    /// Bring a volume up. With `auto_format`, a missing checkpoint
    /// container is created and seeded with an initial header; otherwise
    /// the HEAD failure propagates. Parse and startup I/O failures return
    /// to the caller without starting the daemon.
    pub fn up(
        config: VolumeConfig,
        store: Arc<dyn ObjectStore>,
        auto_format: bool,
    ) -> Result<Arc<Self>> {
        let header_value = match store
            .container_head(&config.account_name, &config.checkpoint_container_name)
        {
            Ok(headers) => headers
                .get(CHECKPOINT_HEADER_NAME)
                .cloned()
                .ok_or_else(|| {
                    Error::parse(format!(
                        "missing {CHECKPOINT_HEADER_NAME} header on {}/{}",
                        config.account_name, config.checkpoint_container_name
                    ))
                })?,
            Err(err) if auto_format && err.is_not_found() => {
                format_container(store.as_ref(), &config)?
            }
            Err(err) => return Err(err),
        };

        let header = CheckpointHeader::parse(&header_value)?;

        let (trailer, layouts) = if header.checkpoint_object_number == 0 {
            (CheckpointTrailer::default(), Default::default())
        } else {
            let blob = store.object_tail(
                &config.account_name,
                &config.checkpoint_container_name,
                &object_name(header.checkpoint_object_number),
                header.checkpoint_object_length,
            )?;
            decode_trailer(&blob)?
        };
        let [inode_layout, log_segment_layout, bplus_layout] = layouts;

        let mut io = ReadOnlyIo {
            store: store.as_ref(),
            account: &config.account_name,
            container: &config.checkpoint_container_name,
        };
        let inode_tree = open_tree(
            trailer.inode_rec_root,
            config.max_inodes_per_metadata_node,
            config.metadata_node_cache_entries,
            &mut io,
        )?;
        let log_segment_tree = open_tree(
            trailer.log_segment_rec_root,
            config.max_log_segments_per_metadata_node,
            config.metadata_node_cache_entries,
            &mut io,
        )?;
        let bplus_tree = open_tree(
            trailer.bplus_object_root,
            config.max_objects_per_metadata_node,
            config.metadata_node_cache_entries,
            &mut io,
        )?;

        let next_nonce = header.reserved_to_nonce;
        let mut state = VolumeState {
            header,
            trailer,
            inode_rec: TreeState {
                tree: inode_tree,
                layout: inode_layout,
            },
            log_segment_rec: TreeState {
                tree: log_segment_tree,
                layout: log_segment_layout,
            },
            bplus_object: TreeState {
                tree: bplus_tree,
                layout: bplus_layout,
            },
            chunked: ChunkedPutState::new(),
            next_nonce,
            replay_log: None,
            gc_pending: None,
            next_checkpoint_waiters: Vec::new(),
        };

        if let Some(path) = config.replay_log_path.as_deref() {
            if let Some(mut log) = ReplayLog::open(path)? {
                let fence = state.header.checkpoint_object_number;
                log.scan(fence, |txn| {
                    state.apply(txn);
                    Ok(())
                })?;
                state.replay_log = Some(log);
            }
        }

        let (request_tx, request_rx) = bounded(8);
        let volume = Arc::new(Self {
            config,
            store,
            state: Mutex::new(state),
            failed: AtomicBool::new(false),
            down: AtomicBool::new(false),
            request_tx,
            daemon: Mutex::new(None),
        });

        let handle = thread::Builder::new()
            .name(format!("ckpt-{}", volume.config.volume_name))
            .spawn({
                let volume = Arc::clone(&volume);
                move || daemon(volume, request_rx)
            })?;
        *volume.daemon.lock() = Some(handle);

        info!(volume = %volume.config.volume_name, "volume up");
        Ok(volume)
    }

    /// Take a final checkpoint and stop the daemon
    pub fn down(&self) -> Result<()> {
        if self.down.swap(true, Ordering::SeqCst) {
            return Err(Error::Down);
        }
        let result = self.send_checkpoint_request(true);
        if let Some(handle) = self.daemon.lock().take() {
            let _ = handle.join();
        }
        info!(volume = %self.config.volume_name, "volume down");
        result
    }

    /// Request a checkpoint from the daemon and wait for it
    pub fn checkpoint(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::Down);
        }
        self.send_checkpoint_request(false)
    }

    fn send_checkpoint_request(&self, exit_on_completion: bool) -> Result<()> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(Error::Halted);
        }
        let (done_tx, done_rx) = bounded(1);
        self.request_tx
            .send(CheckpointRequest {
                exit_on_completion,
                done: Some(done_tx),
            })
            .map_err(|_| Error::Halted)?;
        done_rx.recv().map_err(|_| Error::Halted)?
    }

    /// Register for a one-shot signal when the next checkpoint completes
    pub fn next_checkpoint_done(&self) -> Result<Receiver<()>> {
        let mut state = self.lock_state()?;
        let (tx, rx) = bounded(1);
        state.next_checkpoint_waiters.push(tx);
        Ok(rx)
    }

    /// Volume configuration
    #[must_use]
    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    /// Fetch a never-reused nonce, reserving a fresh range durably (via a
    /// checkpoint-header POST) when the current one is exhausted.
    pub fn fetch_nonce(&self) -> Result<u64> {
        let mut state = self.lock_state()?;
        let VolumeState {
            header, next_nonce, ..
        } = &mut *state;
        match fetch_nonce_locked(self.store.as_ref(), &self.config, header, next_nonce) {
            Ok(nonce) => Ok(nonce),
            Err(err) => self.fail(err),
        }
    }

    /// Read an inode record
    pub fn get_inode_rec(&self, inode_number: u64) -> Result<Option<Vec<u8>>> {
        let state = self.lock_state()?;
        Ok(state.inode_rec.tree.get(inode_number).map(<[u8]>::to_vec))
    }

    /// Write an inode record
    pub fn put_inode_rec(&self, inode_number: u64, value: &[u8]) -> Result<()> {
        let mut state = self.lock_state()?;
        put_or_patch(&mut state.inode_rec.tree, inode_number, value.to_vec());
        self.record_transaction(
            &mut state,
            Transaction::PutInodeRec {
                inode_number,
                value: value.to_vec(),
            },
        )
    }

    /// Write a batch of inode records as one transaction
    pub fn put_inode_recs(&self, recs: &[(u64, Vec<u8>)]) -> Result<()> {
        let mut state = self.lock_state()?;
        for (inode_number, value) in recs {
            put_or_patch(&mut state.inode_rec.tree, *inode_number, value.clone());
        }
        self.record_transaction(
            &mut state,
            Transaction::PutInodeRecs {
                recs: recs.to_vec(),
            },
        )
    }

    /// Delete an inode record
    pub fn delete_inode_rec(&self, inode_number: u64) -> Result<()> {
        let mut state = self.lock_state()?;
        state.inode_rec.tree.delete_by_key(inode_number);
        self.record_transaction(&mut state, Transaction::DeleteInodeRec { inode_number })
    }

    /// Read a log-segment record
    pub fn get_log_segment_rec(&self, segment_number: u64) -> Result<Option<Vec<u8>>> {
        let state = self.lock_state()?;
        Ok(state
            .log_segment_rec
            .tree
            .get(segment_number)
            .map(<[u8]>::to_vec))
    }

    /// Write a log-segment record
    pub fn put_log_segment_rec(&self, segment_number: u64, value: &[u8]) -> Result<()> {
        let mut state = self.lock_state()?;
        put_or_patch(&mut state.log_segment_rec.tree, segment_number, value.to_vec());
        self.record_transaction(
            &mut state,
            Transaction::PutLogSegmentRec {
                segment_number,
                value: value.to_vec(),
            },
        )
    }

    /// Delete a log-segment record
    pub fn delete_log_segment_rec(&self, segment_number: u64) -> Result<()> {
        let mut state = self.lock_state()?;
        state.log_segment_rec.tree.delete_by_key(segment_number);
        self.record_transaction(
            &mut state,
            Transaction::DeleteLogSegmentRec { segment_number },
        )
    }

    /// Read a B+Tree object
    pub fn get_bplus_tree_object(&self, object_number: u64) -> Result<Option<Vec<u8>>> {
        let state = self.lock_state()?;
        Ok(state
            .bplus_object
            .tree
            .get(object_number)
            .map(<[u8]>::to_vec))
    }

    /// Write a B+Tree object
    pub fn put_bplus_tree_object(&self, object_number: u64, value: &[u8]) -> Result<()> {
        let mut state = self.lock_state()?;
        put_or_patch(&mut state.bplus_object.tree, object_number, value.to_vec());
        self.record_transaction(
            &mut state,
            Transaction::PutBPlusTreeObject {
                object_number,
                value: value.to_vec(),
            },
        )
    }

    /// Delete a B+Tree object
    pub fn delete_bplus_tree_object(&self, object_number: u64) -> Result<()> {
        let mut state = self.lock_state()?;
        state.bplus_object.tree.delete_by_key(object_number);
        self.record_transaction(
            &mut state,
            Transaction::DeleteBPlusTreeObject { object_number },
        )
    }

    /// Fetch a tree's layout report (its own accounting), cross-checking
    /// it against the engine's bookkeeping.
    pub fn fetch_layout_report(&self, tree_type: TreeType) -> Result<LayoutReport> {
        let state = self.lock_state()?;
        let tree_state = match tree_type {
            TreeType::InodeRec => &state.inode_rec,
            TreeType::LogSegmentRec => &state.log_segment_rec,
            TreeType::BPlusTreeObject => &state.bplus_object,
        };

        let report = tree_state.tree.layout_report();
        for (object_number, bytes) in &report {
            match tree_state.layout.get(object_number) {
                None => error!(
                    volume = %self.config.volume_name,
                    tree = %tree_type,
                    object = %object_name(*object_number),
                    "object present in tree but not in layout report"
                ),
                Some(recorded) if recorded != bytes => error!(
                    volume = %self.config.volume_name,
                    tree = %tree_type,
                    object = %object_name(*object_number),
                    tree_bytes = bytes,
                    layout_bytes = recorded,
                    "byte counts disagree between tree and layout report"
                ),
                Some(_) => {}
            }
        }
        for object_number in tree_state.layout.keys() {
            if !report.contains_key(object_number) {
                // Zero-byte residue stays until the next checkpoint's GC
                warn!(
                    volume = %self.config.volume_name,
                    tree = %tree_type,
                    object = %object_name(*object_number),
                    "object present in layout report but not in tree"
                );
            }
        }

        Ok(report)
    }

    /// Journal one mutation. An event record is always emitted; with the
    /// replay log disabled nothing else happens and the engine tolerates
    /// data loss between checkpoints.
    fn record_transaction(&self, state: &mut VolumeState, txn: Transaction) -> Result<()> {
        debug!(
            volume = %self.config.volume_name,
            txn = %txn.describe(),
            "record transaction"
        );

        let Some(path) = self.config.replay_log_path.as_deref() else {
            return Ok(());
        };

        let fence = state.header.checkpoint_object_number;
        if state.replay_log.is_none() {
            // Either bring-up found no log or the last checkpoint removed
            // it; start a fresh one.
            match ReplayLog::create(path) {
                Ok(log) => state.replay_log = Some(log),
                Err(err) => return self.fail(err),
            }
        }
        if let Some(log) = state.replay_log.as_mut() {
            if let Err(err) = log.append(&txn, fence) {
                return self.fail(err);
            }
        }
        Ok(())
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, VolumeState>> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(Error::Halted);
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::Down);
        }
        Ok(self.state.lock())
    }

    /// The replay log (or a nonce-reservation POST) is the only durable
    /// record of recent changes; once it cannot be written the volume
    /// must stop servicing writes.
    fn fail<T>(&self, err: Error) -> Result<T> {
        error!(
            volume = %self.config.volume_name,
            %err,
            "fatal failure, halting volume"
        );
        self.failed.store(true, Ordering::SeqCst);
        Err(err)
    }
}

/// Allocate the next nonce, advancing the durable reservation first when
/// the reserved range is exhausted. The header POST must succeed before
/// the nonce is handed out, so a crash can never lead to reuse.
pub(crate) fn fetch_nonce_locked(
    store: &dyn ObjectStore,
    config: &VolumeConfig,
    header: &mut CheckpointHeader,
    next_nonce: &mut u64,
) -> Result<u64> {
    if *next_nonce == header.reserved_to_nonce {
        let reserved = *next_nonce + config.nonce_reserve_step;
        let mut updated = header.clone();
        updated.reserved_to_nonce = reserved;

        let mut headers = Headers::new();
        headers.insert(CHECKPOINT_HEADER_NAME.to_string(), updated.encode());
        store.container_post(
            &config.account_name,
            &config.checkpoint_container_name,
            &headers,
        )?;

        header.reserved_to_nonce = reserved;
        debug!(reserved, "advanced durable nonce reservation");
    }

    let nonce = *next_nonce;
    *next_nonce += 1;
    Ok(nonce)
}

fn format_container(store: &dyn ObjectStore, config: &VolumeConfig) -> Result<String> {
    let header_value = CheckpointHeader::initial().encode();

    let mut container_headers = Headers::new();
    container_headers.insert(CHECKPOINT_HEADER_NAME.to_string(), header_value.clone());
    container_headers.insert(
        STORAGE_POLICY_HEADER_NAME.to_string(),
        config.checkpoint_container_storage_policy.clone(),
    );
    store.container_put(
        &config.account_name,
        &config.checkpoint_container_name,
        &container_headers,
    )?;

    let mut account_headers = Headers::new();
    account_headers.insert(
        ACCOUNT_BIMODAL_HEADER_NAME.to_string(),
        ACCOUNT_BIMODAL_HEADER_VALUE.to_string(),
    );
    store.account_post(&config.account_name, &account_headers)?;

    info!(
        account = %config.account_name,
        container = %config.checkpoint_container_name,
        "formatted checkpoint container"
    );
    Ok(header_value)
}

fn open_tree(
    root: NodeRef,
    fanout: usize,
    cache_entries: usize,
    io: &mut dyn NodeIo,
) -> Result<BPlusTree> {
    let cache = Arc::new(Mutex::new(NodeCache::new(cache_entries)));
    if root.is_empty() {
        Ok(BPlusTree::new(fanout, cache))
    } else {
        BPlusTree::open(root, fanout, io, cache)
    }
}

/// Node reads for volume bring-up; the trees are never written outside a
/// checkpoint.
struct ReadOnlyIo<'a> {
    store: &'a dyn ObjectStore,
    account: &'a str,
    container: &'a str,
}

impl NodeIo for ReadOnlyIo<'_> {
    fn get_node(&mut self, node: &NodeRef) -> Result<Vec<u8>> {
        self.store.object_get(
            self.account,
            self.container,
            &object_name(node.object_number),
            node.offset,
            node.length,
        )
    }

    fn put_node(&mut self, _buf: &[u8]) -> Result<(u64, u64)> {
        Err(Error::storage("metadata trees are read-only during bring-up"))
    }

    fn discard_node(&mut self, _node: &NodeRef) {}
}
