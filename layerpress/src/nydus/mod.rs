//! Nydus conversion: every layer becomes a chunk blob and one trailing
//! bootstrap layer indexes the merged filesystem across all blobs.
//!
//! Blobs are converted concurrently. The bootstrap depends on every blob, so
//! it is only built once all of them have completed, and blob order in the
//! bootstrap follows layer ordinals rather than completion order.

pub mod blob;
pub mod bootstrap;

use std::sync::Arc;

use futures_util::{StreamExt, TryStreamExt, stream};
use tracing::{debug, info};

use crate::artifact::{Artifact, ArtifactRole};
use crate::compression::{Compression, MEDIA_TYPE_NYDUS_BLOB, MEDIA_TYPE_NYDUS_BOOTSTRAP};
use crate::config;
use crate::diff::{LayerDiff, check_ordinals};
use crate::digest::sha256_digest;
use crate::error::{ExportError, Result};
use crate::manifest::Annotations;
use crate::store::{ContentStore, write_blob};
use blob::{ChunkInfo, DEFAULT_CHUNK_SIZE, LayerEntry};
use bootstrap::Bootstrap;

pub const ANNOTATION_NYDUS_BLOB: &str = "containerd.io/snapshot/nydus-blob";
pub const ANNOTATION_NYDUS_BOOTSTRAP: &str = "containerd.io/snapshot/nydus-bootstrap";

/// A converted blob together with the entry list the bootstrap needs.
pub(crate) struct ConvertedLayer {
    pub(crate) artifact: Artifact,
    pub(crate) source_diff_id: String,
    pub(crate) entries: Vec<LayerEntry>,
    pub(crate) chunks: Vec<ChunkInfo>,
}

pub struct NydusConverter {
    chunk_size: u32,
    concurrency: usize,
}

impl NydusConverter {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: config::get_compression_workers(),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: u32) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Converts the whole ordered layer set of one image. Returns one blob
    /// artifact per layer followed by the bootstrap artifact; on any failure
    /// nothing is returned.
    pub async fn convert(
        &self,
        diffs: Vec<LayerDiff>,
        store: Arc<dyn ContentStore>,
    ) -> Result<Vec<Artifact>> {
        check_ordinals(&diffs)?;
        let layer_count = diffs.len();
        let chunk_size = self.chunk_size;

        let tasks = diffs.into_iter().map(|diff| {
            let store = Arc::clone(&store);
            tokio::task::spawn_blocking(move || convert_layer(&diff, chunk_size, store.as_ref()))
        });

        let mut layers: Vec<ConvertedLayer> = stream::iter(tasks)
            .buffer_unordered(self.concurrency)
            .map(|joined| joined.map_err(ExportError::from).and_then(|layer| layer))
            .try_collect()
            .await?;
        layers.sort_by_key(|layer| layer.artifact.position);

        let (layers, bootstrap) = tokio::task::spawn_blocking(move || {
            let bootstrap = build_bootstrap(&layers, chunk_size, store.as_ref())?;
            Ok::<_, ExportError>((layers, bootstrap))
        })
        .await??;

        info!(
            layers = layer_count,
            bootstrap = %bootstrap.digest,
            "converted layers to nydus"
        );

        let mut artifacts: Vec<Artifact> = layers.into_iter().map(|layer| layer.artifact).collect();
        artifacts.push(bootstrap);
        Ok(artifacts)
    }
}

impl Default for NydusConverter {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts `diffs` with the default chunk size and worker count.
pub async fn convert(diffs: Vec<LayerDiff>, store: Arc<dyn ContentStore>) -> Result<Vec<Artifact>> {
    NydusConverter::new().convert(diffs, store).await
}

fn convert_layer(
    diff: &LayerDiff,
    chunk_size: u32,
    store: &dyn ContentStore,
) -> Result<ConvertedLayer> {
    let index = diff.index();
    let raw = diff
        .raw()
        .map_err(|e| ExportError::conversion(index, format!("unreadable payload: {e}")))?;

    let actual = sha256_digest(&raw);
    if actual != diff.diff_id() {
        return Err(ExportError::conversion(
            index,
            format!(
                "payload digest {actual} does not match diff id {}",
                diff.diff_id()
            ),
        ));
    }

    let layer = blob::build_blob(&raw, chunk_size)
        .map_err(|e| ExportError::conversion(index, format!("invalid layer tar: {e}")))?;

    let digest = write_blob(store, &layer.data)?;
    debug!(
        layer = index,
        digest = %digest,
        entries = layer.entries.len(),
        chunks = layer.chunks.len(),
        "stored nydus blob"
    );

    let mut annotations = Annotations::new();
    annotations.insert(ANNOTATION_NYDUS_BLOB.to_string(), "true".to_string());

    Ok(ConvertedLayer {
        artifact: Artifact {
            position: index,
            diff_id: digest.clone(),
            digest,
            size: layer.data.len() as u64,
            media_type: MEDIA_TYPE_NYDUS_BLOB.to_string(),
            annotations,
            compression: Compression::Nydus,
            role: ArtifactRole::NydusBlob,
        },
        source_diff_id: diff.diff_id().to_string(),
        entries: layer.entries,
        chunks: layer.chunks,
    })
}

fn build_bootstrap(
    layers: &[ConvertedLayer],
    chunk_size: u32,
    store: &dyn ContentStore,
) -> Result<Artifact> {
    let bootstrap = Bootstrap::merge(layers, chunk_size)?;
    let data = bootstrap.to_tar()?;
    let digest = write_blob(store, &data)?;

    let position = layers
        .iter()
        .map(|layer| layer.artifact.position + 1)
        .max()
        .unwrap_or(0);

    let mut annotations = Annotations::new();
    annotations.insert(ANNOTATION_NYDUS_BOOTSTRAP.to_string(), "true".to_string());

    Ok(Artifact {
        position,
        diff_id: digest.clone(),
        digest,
        size: data.len() as u64,
        media_type: MEDIA_TYPE_NYDUS_BOOTSTRAP.to_string(),
        annotations,
        compression: Compression::Nydus,
        role: ArtifactRole::NydusBootstrap,
    })
}
