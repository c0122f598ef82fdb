use std::borrow::Cow;

use tracing::debug;

use super::CompressionSpec;
use super::codec;
use crate::artifact::{Artifact, ArtifactRole};
use crate::diff::LayerDiff;
use crate::digest::sha256_digest;
use crate::error::{ExportError, Result};
use crate::manifest::Annotations;
use crate::store::ContentStore;

/// Compresses one layer under `spec` and writes the blob to `store`.
///
/// A payload already in the target format is stored as-is unless
/// `spec.force` is set, in which case it is decoded and encoded again.
pub fn compress(
    diff: &LayerDiff,
    spec: &CompressionSpec,
    store: &dyn ContentStore,
) -> Result<Artifact> {
    let target = spec
        .compression
        .payload_format()
        .ok_or_else(|| ExportError::UnsupportedAlgorithm(spec.compression.to_string()))?;

    let blob: Cow<'_, [u8]> = if !spec.force && diff.format() == target {
        debug!(
            layer = diff.index(),
            compression = %spec.compression,
            "layer already in target format, skipping recompression"
        );
        Cow::Borrowed(diff.payload())
    } else {
        let raw = diff.raw()?;
        Cow::Owned(codec::encode(&raw, target, spec.level)?)
    };

    let digest = sha256_digest(&blob);
    let written = store.put(&digest, &blob)?;
    debug!(
        layer = diff.index(),
        digest = %digest,
        size = blob.len(),
        written,
        "stored layer blob"
    );

    Ok(Artifact {
        position: diff.index(),
        digest,
        size: blob.len() as u64,
        media_type: spec.layer_media_type().to_string(),
        annotations: Annotations::new(),
        diff_id: diff.diff_id().to_string(),
        compression: spec.compression,
        role: ArtifactRole::Layer,
    })
}
