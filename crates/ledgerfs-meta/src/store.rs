//! Object-store client contract
//!
//! The engine consumes a container/object backend through the
//! [`ObjectStore`] trait: container HEAD/PUT/POST, account POST, object
//! GET by range and by tail, chunked PUT, and asynchronous delete.
//! [`MemoryStore`] is an in-process implementation backed by maps, used by
//! every end-to-end test and usable as a stand-in backend.

use crossbeam::sync::WaitGroup;
use ledgerfs_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use tracing::warn;

/// Header map as exchanged with the backend
pub type Headers = HashMap<String, String>;

/// One open chunked PUT: chunks are buffered server-side and the object
/// becomes visible atomically on close.
pub trait ChunkedPutContext: Send {
    /// Append a chunk to the object
    fn send_chunk(&mut self, buf: &[u8]) -> Result<()>;

    /// Running length of the object so far
    fn bytes_put(&self) -> u64;

    /// Finish the PUT, making the object visible
    fn close(self: Box<Self>) -> Result<()>;
}

/// Blocking object-store client consumed by the engine
pub trait ObjectStore: Send + Sync {
    /// HEAD a container, returning its headers
    fn container_head(&self, account: &str, container: &str) -> Result<Headers>;

    /// PUT (create) a container with the given headers
    fn container_put(&self, account: &str, container: &str, headers: &Headers) -> Result<()>;

    /// POST (update) container headers
    fn container_post(&self, account: &str, container: &str, headers: &Headers) -> Result<()>;

    /// POST (update) account headers
    fn account_post(&self, account: &str, headers: &Headers) -> Result<()>;

    /// Fetch the last `length` bytes of the named object
    fn object_tail(
        &self,
        account: &str,
        container: &str,
        name: &str,
        length: u64,
    ) -> Result<Vec<u8>>;

    /// Fetch `length` bytes of the named object starting at `offset`
    fn object_get(
        &self,
        account: &str,
        container: &str,
        name: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>>;

    /// Begin a chunked PUT of the named object
    fn object_fetch_chunked_put_context(
        &self,
        account: &str,
        container: &str,
        name: &str,
    ) -> Result<Box<dyn ChunkedPutContext>>;

    /// Delete the named object asynchronously. The `done` guard is dropped
    /// once the delete has completed (successfully or not); failures are
    /// logged, not returned.
    fn object_delete_async(&self, account: &str, container: &str, name: &str, done: WaitGroup);
}

#[derive(Default)]
struct Container {
    headers: Headers,
    objects: HashMap<String, Vec<u8>>,
}

#[derive(Default)]
struct Shared {
    accounts: HashMap<String, Headers>,
    containers: HashMap<(String, String), Container>,
}

/// In-memory object store
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// List object names in a container (test observability)
    #[must_use]
    pub fn object_names(&self, account: &str, container: &str) -> Vec<String> {
        let shared = self.shared.lock();
        shared
            .containers
            .get(&(account.to_string(), container.to_string()))
            .map(|c| {
                let mut names: Vec<String> = c.objects.keys().cloned().collect();
                names.sort();
                names
            })
            .unwrap_or_default()
    }

    /// Read a container header value (test observability)
    #[must_use]
    pub fn container_header(&self, account: &str, container: &str, name: &str) -> Option<String> {
        let shared = self.shared.lock();
        shared
            .containers
            .get(&(account.to_string(), container.to_string()))
            .and_then(|c| c.headers.get(name).cloned())
    }

    /// Read an account header value (test observability)
    #[must_use]
    pub fn account_header(&self, account: &str, name: &str) -> Option<String> {
        let shared = self.shared.lock();
        shared
            .accounts
            .get(account)
            .and_then(|h| h.get(name).cloned())
    }
}

impl ObjectStore for MemoryStore {
    fn container_head(&self, account: &str, container: &str) -> Result<Headers> {
        let shared = self.shared.lock();
        shared
            .containers
            .get(&(account.to_string(), container.to_string()))
            .map(|c| c.headers.clone())
            .ok_or_else(|| Error::http(404, format!("{account}/{container}")))
    }

    fn container_put(&self, account: &str, container: &str, headers: &Headers) -> Result<()> {
        let mut shared = self.shared.lock();
        let entry = shared
            .containers
            .entry((account.to_string(), container.to_string()))
            .or_default();
        entry.headers = headers.clone();
        Ok(())
    }

    fn container_post(&self, account: &str, container: &str, headers: &Headers) -> Result<()> {
        let mut shared = self.shared.lock();
        let entry = shared
            .containers
            .get_mut(&(account.to_string(), container.to_string()))
            .ok_or_else(|| Error::http(404, format!("{account}/{container}")))?;
        for (name, value) in headers {
            entry.headers.insert(name.clone(), value.clone());
        }
        Ok(())
    }

    fn account_post(&self, account: &str, headers: &Headers) -> Result<()> {
        let mut shared = self.shared.lock();
        let entry = shared.accounts.entry(account.to_string()).or_default();
        for (name, value) in headers {
            entry.insert(name.clone(), value.clone());
        }
        Ok(())
    }

    fn object_tail(
        &self,
        account: &str,
        container: &str,
        name: &str,
        length: u64,
    ) -> Result<Vec<u8>> {
        let shared = self.shared.lock();
        let object = lookup_object(&shared, account, container, name)?;
        let start = object.len().saturating_sub(length as usize);
        Ok(object[start..].to_vec())
    }

    fn object_get(
        &self,
        account: &str,
        container: &str,
        name: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>> {
        let shared = self.shared.lock();
        let object = lookup_object(&shared, account, container, name)?;
        let start = offset as usize;
        let end = start + length as usize;
        if end > object.len() {
            return Err(Error::http(
                416,
                format!("{account}/{container}/{name}: range {start}..{end} beyond {}", object.len()),
            ));
        }
        Ok(object[start..end].to_vec())
    }

    fn object_fetch_chunked_put_context(
        &self,
        account: &str,
        container: &str,
        name: &str,
    ) -> Result<Box<dyn ChunkedPutContext>> {
        Ok(Box::new(MemoryChunkedPut {
            shared: Arc::clone(&self.shared),
            account: account.to_string(),
            container: container.to_string(),
            name: name.to_string(),
            buf: Vec::new(),
        }))
    }

    fn object_delete_async(&self, account: &str, container: &str, name: &str, done: WaitGroup) {
        let shared = Arc::clone(&self.shared);
        let account = account.to_string();
        let container = container.to_string();
        let name = name.to_string();
        thread::spawn(move || {
            let removed = shared
                .lock()
                .containers
                .get_mut(&(account.clone(), container.clone()))
                .and_then(|c| c.objects.remove(&name))
                .is_some();
            if !removed {
                warn!(%account, %container, %name, "async delete of absent object");
            }
            drop(done);
        });
    }
}

fn lookup_object<'a>(
    shared: &'a Shared,
    account: &str,
    container: &str,
    name: &str,
) -> Result<&'a Vec<u8>> {
    shared
        .containers
        .get(&(account.to_string(), container.to_string()))
        .and_then(|c| c.objects.get(name))
        .ok_or_else(|| Error::http(404, format!("{account}/{container}/{name}")))
}

struct MemoryChunkedPut {
    shared: Arc<Mutex<Shared>>,
    account: String,
    container: String,
    name: String,
    buf: Vec<u8>,
}

impl ChunkedPutContext for MemoryChunkedPut {
    fn send_chunk(&mut self, buf: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    fn bytes_put(&self) -> u64 {
        self.buf.len() as u64
    }

    fn close(self: Box<Self>) -> Result<()> {
        let mut shared = self.shared.lock();
        let entry = shared
            .containers
            .entry((self.account, self.container))
            .or_default();
        entry.objects.insert(self.name, self.buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_head_missing() {
        let store = MemoryStore::new();
        let err = store.container_head("acct", "ckpt").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_container_put_head_post() {
        let store = MemoryStore::new();
        let mut headers = Headers::new();
        headers.insert("X-Test".to_string(), "one".to_string());
        store.container_put("acct", "ckpt", &headers).unwrap();

        let got = store.container_head("acct", "ckpt").unwrap();
        assert_eq!(got.get("X-Test").unwrap(), "one");

        let mut update = Headers::new();
        update.insert("X-Test".to_string(), "two".to_string());
        store.container_post("acct", "ckpt", &update).unwrap();
        let got = store.container_head("acct", "ckpt").unwrap();
        assert_eq!(got.get("X-Test").unwrap(), "two");
    }

    #[test]
    fn test_chunked_put_visible_on_close() {
        let store = MemoryStore::new();
        store.container_put("acct", "ckpt", &Headers::new()).unwrap();

        let mut ctx = store
            .object_fetch_chunked_put_context("acct", "ckpt", "obj")
            .unwrap();
        ctx.send_chunk(b"hello ").unwrap();
        assert_eq!(ctx.bytes_put(), 6);
        ctx.send_chunk(b"world").unwrap();
        assert_eq!(ctx.bytes_put(), 11);

        // Not visible until close
        assert!(store.object_tail("acct", "ckpt", "obj", 5).is_err());

        ctx.close().unwrap();
        assert_eq!(store.object_tail("acct", "ckpt", "obj", 5).unwrap(), b"world");
        assert_eq!(
            store.object_get("acct", "ckpt", "obj", 0, 5).unwrap(),
            b"hello"
        );
    }

    #[test]
    fn test_object_get_range_bounds() {
        let store = MemoryStore::new();
        store.container_put("acct", "ckpt", &Headers::new()).unwrap();
        let mut ctx = store
            .object_fetch_chunked_put_context("acct", "ckpt", "obj")
            .unwrap();
        ctx.send_chunk(b"0123456789").unwrap();
        ctx.close().unwrap();

        assert_eq!(store.object_get("acct", "ckpt", "obj", 3, 4).unwrap(), b"3456");
        assert!(store.object_get("acct", "ckpt", "obj", 8, 4).is_err());
    }

    #[test]
    fn test_object_delete_async_signals_wait_group() {
        let store = MemoryStore::new();
        store.container_put("acct", "ckpt", &Headers::new()).unwrap();
        let mut ctx = store
            .object_fetch_chunked_put_context("acct", "ckpt", "obj")
            .unwrap();
        ctx.send_chunk(b"bytes").unwrap();
        ctx.close().unwrap();

        let wg = WaitGroup::new();
        store.object_delete_async("acct", "ckpt", "obj", wg.clone());
        wg.wait();

        assert!(store.object_names("acct", "ckpt").is_empty());
    }
}
