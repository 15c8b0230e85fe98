//! Paged B+Tree map for metadata records
//!
//! A u64-keyed ordered map whose persistent form is a set of checksummed
//! nodes written through a [`NodeIo`] callback: fanout-bounded leaves plus
//! a root node listing the leaf locations. The tree is fully resident in
//! memory once opened; leaves carry per-leaf dirty flags so a flush only
//! rewrites what changed since the previous flush.
//!
//! Node formats (little-endian):
//!
//! ```text
//! leaf:  | magic:u32 | count:u64 | {key:u64, len:u64, value} x count | crc32c:u32 |
//! root:  | magic:u32 | leaves:u64 | {objNum:u64, off:u64, len:u64} x leaves | crc32c:u32 |
//! ```

use crate::cache::NodeCache;
use bytes::{Buf, BufMut, BytesMut};
use ledgerfs_common::checksum::{compute_crc32c, verify_crc32c};
use ledgerfs_common::{Error, LayoutReport, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Leaf node magic number
const LEAF_MAGIC: u32 = 0x4C46_4C46; // "LFLF"

/// Root node magic number
const ROOT_MAGIC: u32 = 0x4C46_5254; // "LFRT"

/// Location of a serialized node within the checkpoint container.
/// An all-zero reference means "not written yet".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeRef {
    pub object_number: u64,
    pub offset: u64,
    pub length: u64,
}

impl NodeRef {
    /// True when this reference points at nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.object_number == 0
    }
}

/// Node I/O callbacks supplied by the tree's owner. Writes land in the
/// open checkpoint object; reads come from the checkpoint container.
pub trait NodeIo {
    /// Fetch the bytes of a previously written node
    fn get_node(&mut self, node: &NodeRef) -> Result<Vec<u8>>;

    /// Write a node, returning the object number and offset it landed at
    fn put_node(&mut self, buf: &[u8]) -> Result<(u64, u64)>;

    /// Note that a previously written node is no longer referenced
    fn discard_node(&mut self, node: &NodeRef);
}

struct Leaf {
    entries: BTreeMap<u64, Vec<u8>>,
    disk: NodeRef,
    dirty: bool,
}

impl Leaf {
    fn fresh() -> Self {
        Self {
            entries: BTreeMap::new(),
            disk: NodeRef::default(),
            dirty: true,
        }
    }

    fn max_key(&self) -> Option<u64> {
        self.entries.keys().next_back().copied()
    }
}

/// A u64-keyed B+Tree map backed by object-store nodes
pub struct BPlusTree {
    fanout: usize,
    leaves: Vec<Leaf>,
    retired: Vec<NodeRef>,
    root_ref: NodeRef,
    dirty: bool,
    cache: Arc<Mutex<NodeCache>>,
}

impl std::fmt::Debug for BPlusTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BPlusTree")
            .field("fanout", &self.fanout)
            .field("leaves", &self.leaves.len())
            .field("root_ref", &self.root_ref)
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl BPlusTree {
    /// Create a fresh, empty tree
    #[must_use]
    pub fn new(fanout: usize, cache: Arc<Mutex<NodeCache>>) -> Self {
        Self {
            fanout: fanout.max(1),
            leaves: Vec::new(),
            retired: Vec::new(),
            root_ref: NodeRef::default(),
            dirty: false,
            cache,
        }
    }

    /// Reopen a tree from the root reference recorded in a checkpoint
    /// trailer, loading every node through `io` (or the cache).
    pub fn open(
        root: NodeRef,
        fanout: usize,
        io: &mut dyn NodeIo,
        cache: Arc<Mutex<NodeCache>>,
    ) -> Result<Self> {
        let mut tree = Self::new(fanout, cache);
        let root_buf = tree.read_node(&root, io)?;
        let leaf_refs = decode_root(&root_buf)?;

        for leaf_ref in leaf_refs {
            let leaf_buf = tree.read_node(&leaf_ref, io)?;
            let entries = decode_leaf(&leaf_buf)?;
            tree.leaves.push(Leaf {
                entries,
                disk: leaf_ref,
                dirty: false,
            });
        }

        tree.root_ref = root;
        Ok(tree)
    }

    fn read_node(&self, node: &NodeRef, io: &mut dyn NodeIo) -> Result<Vec<u8>> {
        if let Some(buf) = self.cache.lock().get(node) {
            return Ok(buf);
        }
        let buf = io.get_node(node)?;
        if buf.len() as u64 != node.length {
            return Err(Error::corrupt(format!(
                "node at {:016X}+{} is {} bytes, expected {}",
                node.object_number,
                node.offset,
                buf.len(),
                node.length
            )));
        }
        self.cache.lock().insert(node, buf.clone());
        Ok(buf)
    }

    /// Index of the leaf whose key range covers `key`
    fn locate(&self, key: u64) -> Option<usize> {
        if self.leaves.is_empty() {
            return None;
        }
        let idx = self
            .leaves
            .partition_point(|leaf| leaf.max_key().is_some_and(|max| max < key));
        Some(idx.min(self.leaves.len() - 1))
    }

    /// Replace the value under an existing key. Returns false (without
    /// modifying anything) when the key is absent.
    pub fn patch_by_key(&mut self, key: u64, value: &[u8]) -> bool {
        let Some(idx) = self.locate(key) else {
            return false;
        };
        let leaf = &mut self.leaves[idx];
        match leaf.entries.get_mut(&key) {
            Some(slot) => {
                slot.clear();
                slot.extend_from_slice(value);
                leaf.dirty = true;
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Insert a key/value pair, splitting the covering leaf if it grows
    /// past the fanout.
    pub fn put(&mut self, key: u64, value: Vec<u8>) {
        let idx = match self.locate(key) {
            Some(idx) => idx,
            None => {
                self.leaves.push(Leaf::fresh());
                0
            }
        };

        let leaf = &mut self.leaves[idx];
        leaf.entries.insert(key, value);
        leaf.dirty = true;
        self.dirty = true;

        if leaf.entries.len() > self.fanout {
            let mid = *leaf
                .entries
                .keys()
                .nth(leaf.entries.len() / 2)
                .expect("non-empty leaf");
            let upper = leaf.entries.split_off(&mid);
            self.leaves.insert(
                idx + 1,
                Leaf {
                    entries: upper,
                    disk: NodeRef::default(),
                    dirty: true,
                },
            );
        }
    }

    /// Remove a key. Returns whether it was present.
    pub fn delete_by_key(&mut self, key: u64) -> bool {
        let Some(idx) = self.locate(key) else {
            return false;
        };
        let leaf = &mut self.leaves[idx];
        if leaf.entries.remove(&key).is_none() {
            return false;
        }
        leaf.dirty = true;
        self.dirty = true;
        if leaf.entries.is_empty() {
            let leaf = self.leaves.remove(idx);
            if !leaf.disk.is_empty() {
                self.retired.push(leaf.disk);
            }
        }
        true
    }

    /// Look up a key
    #[must_use]
    pub fn get(&self, key: u64) -> Option<&[u8]> {
        let idx = self.locate(key)?;
        self.leaves[idx].entries.get(&key).map(Vec::as_slice)
    }

    /// Number of entries across all leaves
    #[must_use]
    pub fn len(&self) -> usize {
        self.leaves.iter().map(|leaf| leaf.entries.len()).sum()
    }

    /// Check if the tree holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Write every dirty node through `io` and return the new root
    /// reference. A clean tree returns its existing root without touching
    /// `io` at all; a fresh, never-written empty tree returns the zero
    /// reference the same way.
    pub fn flush(&mut self, io: &mut dyn NodeIo) -> Result<NodeRef> {
        if !self.dirty {
            return Ok(self.root_ref);
        }

        for node in self.retired.drain(..) {
            io.discard_node(&node);
        }

        for leaf in &mut self.leaves {
            if !leaf.dirty {
                continue;
            }
            if !leaf.disk.is_empty() {
                io.discard_node(&leaf.disk);
            }
            let buf = encode_leaf(&leaf.entries);
            let (object_number, offset) = io.put_node(&buf)?;
            leaf.disk = NodeRef {
                object_number,
                offset,
                length: buf.len() as u64,
            };
            self.cache.lock().insert(&leaf.disk, buf);
            leaf.dirty = false;
        }

        if !self.root_ref.is_empty() {
            io.discard_node(&self.root_ref);
        }
        let buf = encode_root(self.leaves.iter().map(|leaf| leaf.disk));
        let (object_number, offset) = io.put_node(&buf)?;
        self.root_ref = NodeRef {
            object_number,
            offset,
            length: buf.len() as u64,
        };
        self.cache.lock().insert(&self.root_ref, buf);
        self.dirty = false;

        Ok(self.root_ref)
    }

    /// Release cached node buffers
    pub fn prune(&mut self) {
        self.cache.lock().clear();
    }

    /// The tree's own accounting of which objects hold its live nodes
    #[must_use]
    pub fn layout_report(&self) -> LayoutReport {
        let mut report = LayoutReport::new();
        for leaf in &self.leaves {
            if !leaf.disk.is_empty() {
                *report.entry(leaf.disk.object_number).or_insert(0) += leaf.disk.length;
            }
        }
        if !self.root_ref.is_empty() {
            *report.entry(self.root_ref.object_number).or_insert(0) += self.root_ref.length;
        }
        report
    }

    #[cfg(test)]
    fn leaf_count(&self) -> usize {
        self.leaves.len()
    }
}

fn encode_leaf(entries: &BTreeMap<u64, Vec<u8>>) -> Vec<u8> {
    let payload: usize = entries.values().map(|v| 16 + v.len()).sum();
    let mut buf = BytesMut::with_capacity(4 + 8 + payload + 4);
    buf.put_u32_le(LEAF_MAGIC);
    buf.put_u64_le(entries.len() as u64);
    for (key, value) in entries {
        buf.put_u64_le(*key);
        buf.put_u64_le(value.len() as u64);
        buf.put_slice(value);
    }
    let crc = compute_crc32c(&buf);
    buf.put_u32_le(crc);
    buf.to_vec()
}

fn decode_leaf(data: &[u8]) -> Result<BTreeMap<u64, Vec<u8>>> {
    let body = check_node(data, LEAF_MAGIC, "leaf")?;
    let mut buf = body;
    if buf.remaining() < 8 {
        return Err(Error::corrupt("leaf node truncated"));
    }
    let count = buf.get_u64_le();
    let mut entries = BTreeMap::new();
    for _ in 0..count {
        if buf.remaining() < 16 {
            return Err(Error::corrupt("leaf entry header truncated"));
        }
        let key = buf.get_u64_le();
        let len = buf.get_u64_le() as usize;
        if buf.remaining() < len {
            return Err(Error::corrupt("leaf entry value truncated"));
        }
        let mut value = vec![0u8; len];
        buf.copy_to_slice(&mut value);
        entries.insert(key, value);
    }
    Ok(entries)
}

fn encode_root(leaf_refs: impl Iterator<Item = NodeRef>) -> Vec<u8> {
    let refs: Vec<NodeRef> = leaf_refs.collect();
    let mut buf = BytesMut::with_capacity(4 + 8 + refs.len() * 24 + 4);
    buf.put_u32_le(ROOT_MAGIC);
    buf.put_u64_le(refs.len() as u64);
    for node in refs {
        buf.put_u64_le(node.object_number);
        buf.put_u64_le(node.offset);
        buf.put_u64_le(node.length);
    }
    let crc = compute_crc32c(&buf);
    buf.put_u32_le(crc);
    buf.to_vec()
}

fn decode_root(data: &[u8]) -> Result<Vec<NodeRef>> {
    let body = check_node(data, ROOT_MAGIC, "root")?;
    let mut buf = body;
    if buf.remaining() < 8 {
        return Err(Error::corrupt("root node truncated"));
    }
    let count = buf.get_u64_le() as usize;
    if buf.remaining() != count * 24 {
        return Err(Error::corrupt(format!(
            "root node declares {count} leaves but carries {} bytes",
            buf.remaining()
        )));
    }
    let mut refs = Vec::with_capacity(count);
    for _ in 0..count {
        refs.push(NodeRef {
            object_number: buf.get_u64_le(),
            offset: buf.get_u64_le(),
            length: buf.get_u64_le(),
        });
    }
    Ok(refs)
}

/// Validate magic and trailing CRC, returning the body between them
fn check_node<'a>(data: &'a [u8], magic: u32, what: &str) -> Result<&'a [u8]> {
    if data.len() < 8 {
        return Err(Error::corrupt(format!("{what} node too small")));
    }
    let (payload, crc_bytes) = data.split_at(data.len() - 4);
    let crc = u32::from_le_bytes(crc_bytes.try_into().expect("4 bytes"));
    if !verify_crc32c(payload, crc) {
        return Err(Error::corrupt(format!("{what} node checksum mismatch")));
    }
    let mut buf = payload;
    if buf.get_u32_le() != magic {
        return Err(Error::corrupt(format!("bad {what} node magic")));
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// NodeIo backed by a map, emulating one open checkpoint object
    #[derive(Default)]
    struct MapNodeIo {
        nodes: HashMap<(u64, u64), Vec<u8>>,
        object_number: u64,
        next_offset: u64,
        discarded: Vec<NodeRef>,
    }

    impl MapNodeIo {
        fn new(object_number: u64) -> Self {
            Self {
                object_number,
                ..Default::default()
            }
        }
    }

    impl NodeIo for MapNodeIo {
        fn get_node(&mut self, node: &NodeRef) -> Result<Vec<u8>> {
            self.nodes
                .get(&(node.object_number, node.offset))
                .cloned()
                .ok_or_else(|| Error::storage("no such node"))
        }

        fn put_node(&mut self, buf: &[u8]) -> Result<(u64, u64)> {
            let offset = self.next_offset;
            self.next_offset += buf.len() as u64;
            self.nodes.insert((self.object_number, offset), buf.to_vec());
            Ok((self.object_number, offset))
        }

        fn discard_node(&mut self, node: &NodeRef) {
            self.discarded.push(*node);
            self.nodes.remove(&(node.object_number, node.offset));
        }
    }

    fn cache() -> Arc<Mutex<NodeCache>> {
        Arc::new(Mutex::new(NodeCache::new(64)))
    }

    #[test]
    fn test_put_get_patch_delete() {
        let mut tree = BPlusTree::new(8, cache());

        assert!(!tree.patch_by_key(1, b"x"));
        tree.put(1, b"one".to_vec());
        tree.put(2, b"two".to_vec());

        assert_eq!(tree.get(1), Some(&b"one"[..]));
        assert!(tree.patch_by_key(1, b"uno"));
        assert_eq!(tree.get(1), Some(&b"uno"[..]));

        assert!(tree.delete_by_key(2));
        assert!(!tree.delete_by_key(2));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_leaf_split() {
        let mut tree = BPlusTree::new(4, cache());
        for key in 0..20 {
            tree.put(key, vec![key as u8]);
        }
        assert!(tree.leaf_count() > 1);
        assert_eq!(tree.len(), 20);
        for key in 0..20 {
            assert_eq!(tree.get(key), Some(&[key as u8][..]));
        }
    }

    #[test]
    fn test_flush_and_open_roundtrip() {
        let mut io = MapNodeIo::new(7);
        let shared_cache = cache();

        let root = {
            let mut tree = BPlusTree::new(4, Arc::clone(&shared_cache));
            for key in 0..10 {
                tree.put(key, format!("value_{key}").into_bytes());
            }
            tree.flush(&mut io).unwrap()
        };
        assert!(!root.is_empty());

        let reopened = BPlusTree::open(root, 4, &mut io, shared_cache).unwrap();
        assert_eq!(reopened.len(), 10);
        for key in 0..10 {
            assert_eq!(
                reopened.get(key),
                Some(format!("value_{key}").as_bytes())
            );
        }
    }

    #[test]
    fn test_clean_flush_writes_nothing() {
        let mut io = MapNodeIo::new(7);
        let mut tree = BPlusTree::new(4, cache());

        // Fresh empty tree: no nodes shipped, zero root
        let root = tree.flush(&mut io).unwrap();
        assert!(root.is_empty());
        assert!(io.nodes.is_empty());

        tree.put(1, b"one".to_vec());
        let root = tree.flush(&mut io).unwrap();
        let nodes_after_first = io.nodes.len();

        // No mutation since: same root, no new writes
        let again = tree.flush(&mut io).unwrap();
        assert_eq!(again, root);
        assert_eq!(io.nodes.len(), nodes_after_first);
    }

    #[test]
    fn test_rewrite_discards_old_nodes() {
        let mut io = MapNodeIo::new(7);
        let mut tree = BPlusTree::new(4, cache());

        tree.put(1, b"one".to_vec());
        let first_root = tree.flush(&mut io).unwrap();

        tree.put(2, b"two".to_vec());
        let second_root = tree.flush(&mut io).unwrap();

        assert_ne!(first_root, second_root);
        // Old leaf and old root were both discarded
        assert_eq!(io.discarded.len(), 2);
        assert!(io.discarded.contains(&first_root));
    }

    #[test]
    fn test_emptied_tree_flushes_empty_root() {
        let mut io = MapNodeIo::new(7);
        let shared_cache = cache();

        let mut tree = BPlusTree::new(4, Arc::clone(&shared_cache));
        tree.put(1, b"one".to_vec());
        tree.flush(&mut io).unwrap();

        assert!(tree.delete_by_key(1));
        let root = tree.flush(&mut io).unwrap();
        assert!(!root.is_empty());

        let reopened = BPlusTree::open(root, 4, &mut io, shared_cache).unwrap();
        assert!(reopened.is_empty());
    }

    #[test]
    fn test_layout_report_tracks_live_nodes() {
        let mut io = MapNodeIo::new(9);
        let mut tree = BPlusTree::new(2, cache());
        for key in 0..6 {
            tree.put(key, vec![0u8; 32]);
        }
        tree.flush(&mut io).unwrap();

        let report = tree.layout_report();
        let total: u64 = report.values().sum();
        let stored: u64 = io.nodes.values().map(|buf| buf.len() as u64).sum();
        assert_eq!(total, stored);
        assert_eq!(report.len(), 1); // single object in this io
    }

    #[test]
    fn test_open_rejects_corrupt_node() {
        let mut io = MapNodeIo::new(7);
        let shared_cache = cache();

        let root = {
            let mut tree = BPlusTree::new(4, Arc::clone(&shared_cache));
            tree.put(1, b"one".to_vec());
            tree.flush(&mut io).unwrap()
        };

        // Flip a byte in the root node and drop the cached copy
        io.nodes
            .get_mut(&(root.object_number, root.offset))
            .unwrap()[5] ^= 0xFF;
        shared_cache.lock().clear();

        let err = BPlusTree::open(root, 4, &mut io, shared_cache).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[test]
    fn test_open_served_from_cache() {
        let mut io = MapNodeIo::new(7);
        let shared_cache = cache();

        let root = {
            let mut tree = BPlusTree::new(4, Arc::clone(&shared_cache));
            tree.put(1, b"one".to_vec());
            tree.flush(&mut io).unwrap()
        };

        // Remove the backing nodes entirely; the warm cache still serves them
        io.nodes.clear();
        let reopened = BPlusTree::open(root, 4, &mut io, shared_cache).unwrap();
        assert_eq!(reopened.get(1), Some(&b"one"[..]));
    }
}
