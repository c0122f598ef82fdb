use std::borrow::Cow;
use std::collections::HashSet;
use std::io;
use std::sync::Arc;

use crate::compression::codec::{self, PayloadFormat};
use crate::digest::sha256_digest;
use crate::error::{ExportError, Result};

/// One build step's filesystem changeset, as handed over by the build graph.
///
/// The payload is a tar stream, possibly already gzip or zstd compressed.
/// `diff_id` is always the digest of the uncompressed tar.
#[derive(Debug, Clone)]
pub struct LayerDiff {
    index: usize,
    diff_id: String,
    size: u64,
    parent: Option<String>,
    format: PayloadFormat,
    payload: Arc<[u8]>,
}

impl LayerDiff {
    /// Wraps `payload` as the layer at ordinal `index`, decoding it once to
    /// compute its diff id and uncompressed size.
    pub fn new(index: usize, payload: impl Into<Vec<u8>>) -> io::Result<Self> {
        let payload = payload.into();
        let format = PayloadFormat::detect(&payload);
        let raw = codec::decode(&payload, format)?;
        let diff_id = sha256_digest(&raw);
        let size = raw.len() as u64;
        drop(raw);

        Ok(Self {
            index,
            diff_id,
            size,
            parent: None,
            format,
            payload: payload.into(),
        })
    }

    /// Wraps `payload` with a diff id and size declared by the producer.
    /// Nothing is verified here.
    pub fn from_parts(
        index: usize,
        diff_id: impl Into<String>,
        size: u64,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        let payload = payload.into();
        Self {
            index,
            diff_id: diff_id.into(),
            size,
            parent: None,
            format: PayloadFormat::detect(&payload),
            payload: payload.into(),
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn diff_id(&self) -> &str {
        &self.diff_id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn format(&self) -> PayloadFormat {
        self.format
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The uncompressed tar stream.
    pub fn raw(&self) -> io::Result<Cow<'_, [u8]>> {
        codec::decode(&self.payload, self.format)
    }
}

/// Every diff of one image must carry a distinct ordinal.
pub(crate) fn check_ordinals(diffs: &[LayerDiff]) -> Result<()> {
    let mut seen = HashSet::with_capacity(diffs.len());
    match diffs.iter().find(|diff| !seen.insert(diff.index)) {
        Some(diff) => Err(ExportError::DuplicateLayerIndex(diff.index)),
        None => Ok(()),
    }
}
