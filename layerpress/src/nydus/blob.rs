use std::collections::HashMap;
use std::io::{self, Read};
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::digest::sha256_digest;

pub const DEFAULT_CHUNK_SIZE: u32 = 0x10_0000;
pub const BLOB_MAGIC: &[u8; 8] = b"NYDSBLOB";
const CHUNK_ZSTD_LEVEL: i32 = 3;
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";
const WHITEOUT_PREFIX: &str = ".wh.";

/// Location of one compressed chunk inside a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Digest of the uncompressed chunk.
    pub digest: String,
    pub compressed_offset: u64,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EntryKind {
    /// Indexes into the blob chunk table.
    File { chunks: Vec<usize> },
    Directory,
    Symlink { target: String },
    Hardlink { target: String },
    Special { entry_type: u8, major: u32, minor: u32 },
    Whiteout,
    Opaque,
}

/// One tar entry of a layer. Whiteouts carry the path they delete, opaque
/// markers the directory they empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerEntry {
    pub path: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub mtime: u64,
    pub size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChunkTable {
    chunk_size: u32,
    chunks: Vec<ChunkInfo>,
}

/// A layer restructured into a chunk blob plus the entry list the bootstrap
/// is built from.
#[derive(Debug)]
pub struct BlobLayer {
    pub entries: Vec<LayerEntry>,
    pub chunks: Vec<ChunkInfo>,
    /// Blob bytes: compressed chunks, the JSON chunk table, its length as a
    /// little-endian u32 and [`BLOB_MAGIC`].
    pub data: Vec<u8>,
}

/// Splits every regular file of `raw_tar` into `chunk_size` chunks and packs
/// the distinct ones into a blob.
pub fn build_blob(raw_tar: &[u8], chunk_size: u32) -> io::Result<BlobLayer> {
    let mut archive = tar::Archive::new(raw_tar);
    let mut data = Vec::new();
    let mut chunks: Vec<ChunkInfo> = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut entries = Vec::new();
    let mut buf = vec![0u8; chunk_size.max(1) as usize];

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = normalize_path(&entry.path()?)?;
        if path.is_empty() {
            continue;
        }

        let header = entry.header();
        let raw = header.as_old();
        let entry_type = header.entry_type();
        let mode = numeric_field(&raw.mode, header.mode())?;
        let uid = numeric_field(&raw.uid, header.uid())?;
        let gid = numeric_field(&raw.gid, header.gid())?;
        let mtime = numeric_field(&raw.mtime, header.mtime())?;
        let size = header.size()?;
        let link_name = entry
            .link_name()?
            .map(|target| target.to_string_lossy().into_owned());

        let (parent, name) = match path.rsplit_once('/') {
            Some((parent, name)) => (parent, name),
            None => ("", path.as_str()),
        };

        let (path, kind) = if name == OPAQUE_WHITEOUT {
            (parent.to_string(), EntryKind::Opaque)
        } else if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
            (join_path(parent, hidden), EntryKind::Whiteout)
        } else if entry_type.is_file() || entry_type.is_contiguous() {
            let mut ids = Vec::new();
            loop {
                let n = read_full(&mut entry, &mut buf)?;
                if n == 0 {
                    break;
                }
                let chunk = &buf[..n];
                let digest = sha256_digest(chunk);
                let id = match seen.get(&digest) {
                    Some(&id) => id,
                    None => {
                        let compressed = zstd::bulk::compress(chunk, CHUNK_ZSTD_LEVEL)?;
                        chunks.push(ChunkInfo {
                            digest: digest.clone(),
                            compressed_offset: data.len() as u64,
                            compressed_size: compressed.len() as u32,
                            uncompressed_size: n as u32,
                        });
                        data.extend_from_slice(&compressed);
                        seen.insert(digest, chunks.len() - 1);
                        chunks.len() - 1
                    }
                };
                ids.push(id);
            }
            (path, EntryKind::File { chunks: ids })
        } else if entry_type.is_dir() {
            (path, EntryKind::Directory)
        } else if entry_type.is_symlink() {
            let target = link_name.ok_or_else(|| missing_link(&path))?;
            (path, EntryKind::Symlink { target })
        } else if entry_type.is_hard_link() {
            let target = link_name.ok_or_else(|| missing_link(&path))?;
            let target = normalize_path(Path::new(&target))?;
            (path, EntryKind::Hardlink { target })
        } else if entry_type.is_character_special()
            || entry_type.is_block_special()
            || entry_type.is_fifo()
        {
            let (major, minor) = if entry_type.is_fifo() {
                (0, 0)
            } else {
                device_numbers(entry.header())?
            };
            let kind = EntryKind::Special {
                entry_type: entry_type.as_byte(),
                major,
                minor,
            };
            (path, kind)
        } else {
            continue;
        };

        let size = match kind {
            EntryKind::File { .. } => size,
            _ => 0,
        };
        entries.push(LayerEntry {
            path,
            kind,
            mode,
            uid,
            gid,
            mtime,
            size,
        });
    }

    let table = serde_json::to_vec(&ChunkTable {
        chunk_size,
        chunks: chunks.clone(),
    })?;
    data.extend_from_slice(&table);
    data.extend_from_slice(&(table.len() as u32).to_le_bytes());
    data.extend_from_slice(BLOB_MAGIC);

    Ok(BlobLayer {
        entries,
        chunks,
        data,
    })
}

/// Reads the chunk table back from the tail of a blob.
pub fn read_chunk_table(blob: &[u8]) -> io::Result<Vec<ChunkInfo>> {
    let invalid = || io::Error::new(io::ErrorKind::InvalidData, "not a nydus blob");
    let footer_start = blob.len().checked_sub(BLOB_MAGIC.len() + 4).ok_or_else(invalid)?;
    if &blob[footer_start + 4..] != BLOB_MAGIC {
        return Err(invalid());
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&blob[footer_start..footer_start + 4]);
    let table_start = footer_start
        .checked_sub(u32::from_le_bytes(len) as usize)
        .ok_or_else(invalid)?;
    let table: ChunkTable = serde_json::from_slice(&blob[table_start..footer_start])?;
    Ok(table.chunks)
}

/// Decompresses one chunk of `blob`.
pub fn read_chunk(blob: &[u8], chunk: &ChunkInfo) -> io::Result<Vec<u8>> {
    let start = chunk.compressed_offset as usize;
    let end = start + chunk.compressed_size as usize;
    let compressed = blob.get(start..end).ok_or_else(|| {
        io::Error::new(io::ErrorKind::UnexpectedEof, "chunk outside blob bounds")
    })?;
    zstd::bulk::decompress(compressed, chunk.uncompressed_size as usize)
}

/// Relative, slash separated form of a tar path. Rejects `..` components.
pub(crate) fn normalize_path(path: &Path) -> io::Result<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::ParentDir => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("path {} escapes the layer root", path.display()),
                ));
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    Ok(parts.join("/"))
}

/// Writers commonly leave unused numeric fields NUL or space filled; those
/// read as zero instead of failing the octal parse.
fn numeric_field<T: Default>(raw: &[u8], parsed: io::Result<T>) -> io::Result<T> {
    if raw.iter().all(|b| *b == 0 || *b == b' ') {
        Ok(T::default())
    } else {
        parsed
    }
}

fn device_numbers(header: &tar::Header) -> io::Result<(u32, u32)> {
    let (raw_major, raw_minor) = if let Some(ustar) = header.as_ustar() {
        (ustar.dev_major, ustar.dev_minor)
    } else if let Some(gnu) = header.as_gnu() {
        (gnu.dev_major, gnu.dev_minor)
    } else {
        return Ok((0, 0));
    };
    let major = numeric_field(&raw_major, header.device_major())?.unwrap_or(0);
    let minor = numeric_field(&raw_minor, header.device_minor())?.unwrap_or(0);
    Ok((major, minor))
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

fn missing_link(path: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("link {path} has no target"),
    )
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
