//! Content addressed blob storage shared by every export.

mod layout;

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use crate::digest::sha256_digest;

pub use layout::LayoutStore;

/// Append-only blob store keyed by digest.
///
/// Writes of the same digest are idempotent, so concurrent exports can share
/// one store without coordinating.
pub trait ContentStore: Send + Sync {
    /// Stores `data` under `digest`. Returns `false` if the blob was already
    /// present and nothing was written.
    fn put(&self, digest: &str, data: &[u8]) -> io::Result<bool>;

    /// Reads a blob back. Fails with [`io::ErrorKind::NotFound`] for an
    /// unknown digest.
    fn get(&self, digest: &str) -> io::Result<Vec<u8>>;

    fn contains(&self, digest: &str) -> bool;
}

/// Hashes `data` and stores it, returning its digest.
pub fn write_blob(store: &dyn ContentStore, data: &[u8]) -> io::Result<String> {
    let digest = sha256_digest(data);
    store.put(&digest, data)?;
    Ok(digest)
}

pub(crate) fn not_found(digest: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("blob {digest} not found"))
}

#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Arc<[u8]>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|blobs| blobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored digests, sorted.
    pub fn digests(&self) -> Vec<String> {
        let mut digests: Vec<String> = self
            .blobs
            .lock()
            .map(|blobs| blobs.keys().cloned().collect())
            .unwrap_or_default();
        digests.sort();
        digests
    }
}

impl ContentStore for MemoryStore {
    fn put(&self, digest: &str, data: &[u8]) -> io::Result<bool> {
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| io::Error::other("memory store lock poisoned"))?;
        if blobs.contains_key(digest) {
            return Ok(false);
        }
        blobs.insert(digest.to_string(), Arc::from(data));
        Ok(true)
    }

    fn get(&self, digest: &str) -> io::Result<Vec<u8>> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| io::Error::other("memory store lock poisoned"))?;
        blobs
            .get(digest)
            .map(|blob| blob.to_vec())
            .ok_or_else(|| not_found(digest))
    }

    fn contains(&self, digest: &str) -> bool {
        self.blobs
            .lock()
            .map(|blobs| blobs.contains_key(digest))
            .unwrap_or(false)
    }
}
