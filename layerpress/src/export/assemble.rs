use crate::artifact::{Artifact, ArtifactRole};
use crate::compression::Compression;
use crate::digest::sha256_digest;
use crate::error::{ExportError, Result};
use crate::manifest::{Descriptor, ImageManifest, MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_OCI_MANIFEST};

/// A serialized image manifest and its digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub digest: String,
    pub media_type: String,
    pub bytes: Vec<u8>,
    pub image: ImageManifest,
}

impl Manifest {
    pub fn descriptor(&self) -> Descriptor {
        Descriptor::new(&self.media_type, &self.digest, self.bytes.len() as u64)
    }

    /// Layer descriptors followed by the config descriptor: every blob a
    /// registry needs before it accepts the manifest.
    pub fn blobs(&self) -> impl Iterator<Item = &Descriptor> {
        self.image
            .layers
            .iter()
            .chain(std::iter::once(&self.image.config))
    }
}

/// Builds the manifest for one export from its artifacts, in ordinal order.
pub fn assemble(
    mut artifacts: Vec<Artifact>,
    config: Descriptor,
    oci_media_types: bool,
) -> Result<Manifest> {
    if artifacts.is_empty() {
        return Err(ExportError::EmptyLayerSet);
    }
    artifacts.sort_by_key(|artifact| artifact.position);

    let family = artifacts[0].compression;
    if let Some(odd) = artifacts.iter().find(|a| a.compression != family) {
        return Err(ExportError::MixedLayerFormats {
            index: odd.position,
            expected: family,
            found: odd.compression,
        });
    }
    check_bootstrap(&artifacts, family)?;

    let media_type = if oci_media_types || family.only_supports_oci_types() {
        MEDIA_TYPE_OCI_MANIFEST
    } else {
        MEDIA_TYPE_DOCKER_MANIFEST
    };

    let image = ImageManifest {
        schema_version: 2,
        media_type: media_type.to_string(),
        config,
        layers: artifacts.iter().map(Artifact::descriptor).collect(),
        annotations: None,
    };
    let bytes = serde_json::to_vec(&image)?;

    Ok(Manifest {
        digest: sha256_digest(&bytes),
        media_type: media_type.to_string(),
        bytes,
        image,
    })
}

/// A nydus layer list ends with exactly one bootstrap; any other list has
/// none.
fn check_bootstrap(artifacts: &[Artifact], family: Compression) -> Result<()> {
    let last = artifacts.len() - 1;
    let expect_bootstrap = family == Compression::Nydus;

    for (i, artifact) in artifacts.iter().enumerate() {
        let is_bootstrap = artifact.role == ArtifactRole::NydusBootstrap;
        let wanted = expect_bootstrap && i == last;
        if is_bootstrap != wanted {
            return Err(ExportError::MisplacedBootstrap(artifact.position));
        }
    }
    Ok(())
}
