use crate::compression::Compression;
use crate::manifest::{Annotations, Descriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactRole {
    Layer,
    NydusBlob,
    NydusBootstrap,
}

/// A blob produced by one transform stage, waiting to be listed in a
/// manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Position in the manifest layer list.
    pub position: usize,
    /// Digest of the stored (compressed or converted) bytes.
    pub digest: String,
    pub size: u64,
    pub media_type: String,
    pub annotations: Annotations,
    /// Digest of the uncompressed content, listed in the image config.
    pub diff_id: String,
    pub compression: Compression,
    pub role: ArtifactRole,
}

impl Artifact {
    pub fn descriptor(&self) -> Descriptor {
        Descriptor {
            media_type: self.media_type.clone(),
            digest: self.digest.clone(),
            size: self.size,
            annotations: (!self.annotations.is_empty()).then(|| self.annotations.clone()),
        }
    }
}
