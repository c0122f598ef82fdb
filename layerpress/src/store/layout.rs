use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use super::{ContentStore, not_found};
use crate::digest::sha256_hex;
use crate::manifest::{
    ANNOTATION_REF_NAME, Annotations, Descriptor, MEDIA_TYPE_OCI_INDEX, ManifestList,
    PlatformManifest,
};

const OCI_LAYOUT_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);
/// Serializes `index.json` updates across every store in the process.
static INDEX_LOCK: Mutex<()> = Mutex::new(());

#[derive(Debug, Serialize, Deserialize)]
struct OciLayout {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: String,
}

/// OCI image layout on disk:
///
/// ```text
/// <root>/
/// |-- oci-layout
/// |-- index.json
/// `-- blobs/sha256/<hex>
/// ```
pub struct LayoutStore {
    root: PathBuf,
}

impl LayoutStore {
    pub fn open<P: AsRef<Path>>(root: P) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("blobs").join("sha256"))?;

        let layout_path = root.join(OCI_LAYOUT_FILE);
        if !layout_path.exists() {
            let writer = BufWriter::new(fs::File::create(layout_path)?);
            let layout = OciLayout {
                image_layout_version: "1.0.0".to_string(),
            };
            serde_json::to_writer(writer, &layout)?;
        }

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &str) -> io::Result<PathBuf> {
        let hex = sha256_hex(digest).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid blob digest {digest}"),
            )
        })?;
        Ok(self.root.join("blobs").join("sha256").join(hex))
    }

    fn read_index(&self) -> io::Result<ManifestList> {
        let index_path = self.root.join(INDEX_FILE);
        if !index_path.exists() {
            return Ok(ManifestList {
                schema_version: 2,
                media_type: Some(MEDIA_TYPE_OCI_INDEX.to_string()),
                manifests: Vec::new(),
            });
        }
        let reader = BufReader::new(fs::File::open(index_path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    fn lock_index() -> io::Result<MutexGuard<'static, ()>> {
        INDEX_LOCK
            .lock()
            .map_err(|_| io::Error::other("index lock poisoned"))
    }

    fn write_index(&self, index: &ManifestList) -> io::Result<()> {
        let index_path = self.root.join(INDEX_FILE);
        let temp_path = self.root.join(temp_name(INDEX_FILE));
        let mut writer = BufWriter::new(fs::File::create(&temp_path)?);
        serde_json::to_writer_pretty(&mut writer, index)?;
        writer.flush()?;
        fs::rename(temp_path, index_path)
    }

    /// Tags `manifest` as `reference` in `index.json`, replacing any
    /// previous manifest with the same tag.
    pub fn record_image(&self, reference: &str, manifest: &Descriptor) -> io::Result<()> {
        let _guard = Self::lock_index()?;
        let mut index = self.read_index()?;
        index
            .manifests
            .retain(|entry| ref_name(entry) != Some(reference));

        let mut annotations = Annotations::new();
        annotations.insert(ANNOTATION_REF_NAME.to_string(), reference.to_string());
        index.manifests.push(PlatformManifest {
            digest: manifest.digest.clone(),
            media_type: manifest.media_type.clone(),
            platform: None,
            size: manifest.size,
            annotations: Some(annotations),
        });

        self.write_index(&index)
    }

    /// Tagged images as `(reference, manifest descriptor)` pairs.
    pub fn list_images(&self) -> io::Result<Vec<(String, Descriptor)>> {
        let index = self.read_index()?;
        Ok(index
            .manifests
            .iter()
            .filter_map(|entry| {
                let reference = ref_name(entry)?.to_string();
                let descriptor = Descriptor::new(&entry.media_type, &entry.digest, entry.size);
                Some((reference, descriptor))
            })
            .collect())
    }

    /// Drops the tag. Blobs stay, other images may share them.
    pub fn remove_image(&self, reference: &str) -> io::Result<bool> {
        let _guard = Self::lock_index()?;
        let mut index = self.read_index()?;
        let before = index.manifests.len();
        index
            .manifests
            .retain(|entry| ref_name(entry) != Some(reference));
        if index.manifests.len() == before {
            return Ok(false);
        }
        self.write_index(&index)?;
        Ok(true)
    }
}

fn temp_name(name: &str) -> String {
    format!(
        ".{name}.{}-{}.tmp",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

fn ref_name(entry: &PlatformManifest) -> Option<&str> {
    entry
        .annotations
        .as_ref()?
        .get(ANNOTATION_REF_NAME)
        .map(String::as_str)
}

impl ContentStore for LayoutStore {
    fn put(&self, digest: &str, data: &[u8]) -> io::Result<bool> {
        let path = self.blob_path(digest)?;
        if path.exists() {
            return Ok(false);
        }

        // Write under a unique name and rename into place so readers never
        // observe a partial blob.
        let temp_path = path.with_file_name(temp_name(sha256_hex(digest).unwrap_or("blob")));
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp_path, &path)?;
        Ok(true)
    }

    fn get(&self, digest: &str) -> io::Result<Vec<u8>> {
        let path = self.blob_path(digest)?;
        fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => not_found(digest),
            _ => e,
        })
    }

    fn contains(&self, digest: &str) -> bool {
        self.blob_path(digest)
            .map(|path| path.exists())
            .unwrap_or(false)
    }
}
