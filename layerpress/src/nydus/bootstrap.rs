use std::collections::BTreeMap;
use std::io::{self, Read};

use serde::{Deserialize, Serialize};

use super::ConvertedLayer;
use super::blob::{ChunkInfo, EntryKind, LayerEntry};
use crate::error::{ExportError, Result};

/// Path of the bootstrap document inside the bootstrap layer tar.
pub const BOOTSTRAP_PATH: &str = "image/image.boot";
pub const BOOTSTRAP_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRecord {
    pub digest: String,
    pub size: u64,
    /// Diff id of the layer the blob was converted from.
    pub source_diff_id: String,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub blob_index: usize,
    #[serde(flatten)]
    pub chunk: ChunkInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InodeKind {
    File { chunks: Vec<ChunkRef> },
    Directory,
    Symlink { target: String },
    Hardlink { target: String },
    Special { entry_type: u8, major: u32, minor: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub kind: InodeKind,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub mtime: u64,
    pub size: u64,
    /// Blob index of the layer that last wrote this path.
    pub layer: usize,
}

/// Merged filesystem index over every blob of one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bootstrap {
    pub version: u32,
    pub chunk_size: u32,
    pub blobs: Vec<BlobRecord>,
    pub inodes: BTreeMap<String, Inode>,
}

impl Bootstrap {
    /// Applies `layers` bottom-up. `layers` must already be in manifest order.
    pub(crate) fn merge(layers: &[ConvertedLayer], chunk_size: u32) -> Result<Self> {
        let mut tree = MergedTree::default();
        let mut blobs = Vec::with_capacity(layers.len());

        for (blob_index, layer) in layers.iter().enumerate() {
            tree.apply(blob_index, layer)
                .map_err(|reason| ExportError::conversion(layer.artifact.position, reason))?;
            blobs.push(BlobRecord {
                digest: layer.artifact.digest.clone(),
                size: layer.artifact.size,
                source_diff_id: layer.source_diff_id.clone(),
                chunk_count: layer.chunks.len(),
            });
        }

        Ok(Self {
            version: BOOTSTRAP_VERSION,
            chunk_size,
            blobs,
            inodes: tree.entries,
        })
    }

    pub fn lookup(&self, path: &str) -> Option<&Inode> {
        self.inodes.get(path.trim_matches('/'))
    }

    /// Packs the bootstrap as a single-entry tar with fixed metadata.
    pub fn to_tar(&self) -> io::Result<Vec<u8>> {
        let document = serde_json::to_vec(self)?;
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_size(document.len() as u64);

        let mut builder = tar::Builder::new(Vec::new());
        builder.append_data(&mut header, BOOTSTRAP_PATH, document.as_slice())?;
        builder.into_inner()
    }

    pub fn from_tar(data: &[u8]) -> io::Result<Self> {
        let mut archive = tar::Archive::new(data);
        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry.path()?.to_string_lossy() == BOOTSTRAP_PATH {
                let mut document = Vec::new();
                entry.read_to_end(&mut document)?;
                return Ok(serde_json::from_slice(&document)?);
            }
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{BOOTSTRAP_PATH} not found in bootstrap layer"),
        ))
    }
}

#[derive(Default)]
struct MergedTree {
    entries: BTreeMap<String, Inode>,
}

impl MergedTree {
    fn apply(&mut self, blob_index: usize, layer: &ConvertedLayer) -> std::result::Result<(), String> {
        // Whiteouts only hide lower layers, so they go first.
        for entry in &layer.entries {
            match entry.kind {
                EntryKind::Whiteout => self.delete_entry(&entry.path),
                EntryKind::Opaque => self.clear_directory(&entry.path),
                _ => {}
            }
        }

        for entry in &layer.entries {
            let kind = match &entry.kind {
                EntryKind::Whiteout | EntryKind::Opaque => continue,
                EntryKind::File { chunks } => {
                    let chunks = chunks
                        .iter()
                        .map(|&id| {
                            layer
                                .chunks
                                .get(id)
                                .map(|chunk| ChunkRef {
                                    blob_index,
                                    chunk: chunk.clone(),
                                })
                                .ok_or_else(|| format!("{} references missing chunk {id}", entry.path))
                        })
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    InodeKind::File { chunks }
                }
                EntryKind::Directory => InodeKind::Directory,
                EntryKind::Symlink { target } => InodeKind::Symlink {
                    target: target.clone(),
                },
                EntryKind::Hardlink { target } => {
                    if !self.entries.contains_key(target) {
                        return Err(format!(
                            "hard link {} points at missing {}",
                            entry.path, target
                        ));
                    }
                    InodeKind::Hardlink {
                        target: target.clone(),
                    }
                }
                EntryKind::Special {
                    entry_type,
                    major,
                    minor,
                } => InodeKind::Special {
                    entry_type: *entry_type,
                    major: *major,
                    minor: *minor,
                },
            };
            self.add_entry(entry, kind, blob_index);
        }

        Ok(())
    }

    fn add_entry(&mut self, entry: &LayerEntry, kind: InodeKind, layer: usize) {
        // A non-directory replacing a directory takes its subtree with it.
        if !matches!(kind, InodeKind::Directory) {
            self.clear_directory(&entry.path);
        }
        self.entries.insert(
            entry.path.clone(),
            Inode {
                kind,
                mode: entry.mode,
                uid: entry.uid,
                gid: entry.gid,
                mtime: entry.mtime,
                size: entry.size,
                layer,
            },
        );
    }

    fn delete_entry(&mut self, path: &str) {
        self.entries.remove(path);
        self.clear_directory(path);
    }

    fn clear_directory(&mut self, dir: &str) {
        if dir.is_empty() {
            self.entries.clear();
            return;
        }
        let dir_prefix = format!("{dir}/");
        self.entries.retain(|path, _| !path.starts_with(&dir_prefix));
    }
}
