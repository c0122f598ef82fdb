//! Image export: turns the ordered layer diffs of a build into a stored (and
//! optionally pushed) image under one compression policy.
//!
//! Every step before publishing only writes content-addressed blobs, so an
//! export that fails or is dropped part way leaves nothing but unreferenced
//! blobs behind. The manifest is only handed to the publisher once every
//! layer, the config and the manifest itself are stored.

pub mod assemble;
pub mod policy;

use std::sync::Arc;

use futures_util::{StreamExt, TryStreamExt, stream};
use tracing::{debug, info, warn};

use crate::artifact::Artifact;
use crate::compression::{self, Compression, CompressionSpec};
use crate::config;
use crate::diff::{LayerDiff, check_ordinals};
use crate::error::{ExportError, Result};
use crate::manifest::{
    Descriptor, ImageConfig, MEDIA_TYPE_DOCKER_CONFIG, MEDIA_TYPE_OCI_CONFIG, Platform,
};
use crate::nydus::NydusConverter;
use crate::reference::ImageReference;
use crate::registry::Publisher;
use crate::store::{ContentStore, write_blob};

pub use assemble::{Manifest, assemble};
pub use policy::ExportStrategy;

pub const ATTR_NAME: &str = "name";
pub const ATTR_PUSH: &str = "push";
pub const ATTR_COMPRESSION: &str = "compression";
pub const ATTR_FORCE_COMPRESSION: &str = "force-compression";
pub const ATTR_OCI_MEDIA_TYPES: &str = "oci-mediatypes";
pub const ATTR_COMPRESSION_LEVEL: &str = "compression-level";

#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub layers: Vec<LayerDiff>,
    pub spec: CompressionSpec,
    pub target: Option<ImageReference>,
    pub push: bool,
    pub platform: Platform,
}

impl ExportRequest {
    pub fn new(layers: Vec<LayerDiff>, spec: CompressionSpec) -> Self {
        Self {
            layers,
            spec,
            target: None,
            push: false,
            platform: Platform::host(),
        }
    }

    pub fn with_target(mut self, target: ImageReference) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_push(mut self, push: bool) -> Self {
        self.push = push;
        self
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Builds a request from exporter attributes such as
    /// `compression=zstd`, `force-compression=true` or `name=app:v1`.
    ///
    /// Boolean attributes given without a value count as `true`. Unknown
    /// keys are ignored.
    pub fn from_attrs<'a, I>(layers: Vec<LayerDiff>, attrs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut request = Self::new(layers, CompressionSpec::default());
        let mut level = None;

        for (key, value) in attrs {
            match key {
                ATTR_NAME => request.target = Some(ImageReference::parse(value)?),
                ATTR_PUSH => request.push = parse_bool(key, value)?,
                ATTR_COMPRESSION => request.spec.compression = value.parse()?,
                ATTR_FORCE_COMPRESSION => request.spec.force = parse_bool(key, value)?,
                ATTR_OCI_MEDIA_TYPES => request.spec.oci_media_types = parse_bool(key, value)?,
                ATTR_COMPRESSION_LEVEL => {
                    let parsed: i32 = value
                        .trim()
                        .parse()
                        .map_err(|_| ExportError::invalid_attribute(key, value))?;
                    level = Some(parsed);
                }
                _ => warn!(key, "ignoring unknown export attribute"),
            }
        }

        // The level is only meaningful once the algorithm is known.
        if let Some(level) = level {
            request.spec = request.spec.with_level(level)?;
        }
        Ok(request)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim() {
        "" => Ok(true),
        other => other
            .parse()
            .map_err(|_| ExportError::invalid_attribute(key, value)),
    }
}

/// Result of a successful export.
#[derive(Debug, Clone)]
pub struct ExportedImage {
    pub manifest: Manifest,
    pub config: Descriptor,
    pub target: Option<ImageReference>,
    pub pushed: bool,
}

pub struct Exporter {
    store: Arc<dyn ContentStore>,
    publisher: Option<Arc<dyn Publisher>>,
    concurrency: usize,
}

impl Exporter {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self {
            store,
            publisher: None,
            concurrency: config::get_compression_workers(),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    pub async fn export(&self, request: ExportRequest) -> Result<ExportedImage> {
        let ExportRequest {
            layers,
            spec,
            target,
            push,
            platform,
        } = request;

        if layers.is_empty() {
            return Err(ExportError::EmptyLayerSet);
        }
        check_ordinals(&layers)?;
        let publish_to = if push {
            let target = target
                .as_ref()
                .ok_or_else(|| ExportError::invalid_attribute(ATTR_PUSH, "true (no image name)"))?;
            let publisher = self.publisher.as_ref().ok_or_else(|| {
                ExportError::invalid_attribute(ATTR_PUSH, "true (no publisher configured)")
            })?;
            Some((target, publisher))
        } else {
            None
        };

        let spec = spec.normalized();
        info!(
            layers = layers.len(),
            compression = %spec.compression,
            force = spec.force,
            oci_media_types = spec.oci_media_types,
            "exporting image"
        );

        let mut artifacts = match ExportStrategy::select(&spec) {
            ExportStrategy::PerLayer(spec) => self.compress_layers(layers, spec).await?,
            ExportStrategy::WholeSet => {
                NydusConverter::new()
                    .with_concurrency(self.concurrency)
                    .convert(layers, Arc::clone(&self.store))
                    .await?
            }
        };
        artifacts.sort_by_key(|artifact| artifact.position);

        let config = self.write_config(&artifacts, &platform, spec.compression, spec.oci_media_types)?;
        let manifest = assemble(artifacts, config.clone(), spec.oci_media_types)?;
        self.store.put(&manifest.digest, &manifest.bytes)?;
        debug!(digest = %manifest.digest, "stored manifest");

        if let Some((target, publisher)) = publish_to {
            publisher
                .publish(target, &manifest, Arc::clone(&self.store))
                .await?;
            info!(target = %target, digest = %manifest.digest, "pushed image");
        }

        info!(digest = %manifest.digest, "exported image");
        Ok(ExportedImage {
            manifest,
            config,
            target,
            pushed: push,
        })
    }

    async fn compress_layers(
        &self,
        layers: Vec<LayerDiff>,
        spec: CompressionSpec,
    ) -> Result<Vec<Artifact>> {
        let tasks = layers.into_iter().map(|diff| {
            let store = Arc::clone(&self.store);
            tokio::task::spawn_blocking(move || compression::compress(&diff, &spec, store.as_ref()))
        });

        stream::iter(tasks)
            .buffer_unordered(self.concurrency)
            .map(|joined| joined.map_err(ExportError::from).and_then(|artifact| artifact))
            .try_collect()
            .await
    }

    fn write_config(
        &self,
        artifacts: &[Artifact],
        platform: &Platform,
        compression: Compression,
        oci_media_types: bool,
    ) -> Result<Descriptor> {
        let diff_ids = artifacts.iter().map(|a| a.diff_id.clone()).collect();
        let bytes = serde_json::to_vec(&ImageConfig::for_layers(platform, diff_ids))?;
        let digest = write_blob(self.store.as_ref(), &bytes)?;

        let media_type = if oci_media_types || compression.only_supports_oci_types() {
            MEDIA_TYPE_OCI_CONFIG
        } else {
            MEDIA_TYPE_DOCKER_CONFIG
        };
        Ok(Descriptor::new(media_type, &digest, bytes.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&'static str, &'static str)]) -> Result<ExportRequest> {
        ExportRequest::from_attrs(Vec::new(), pairs.iter().copied())
    }

    #[test]
    fn test_from_attrs() {
        let request = attrs(&[
            ("name", "localhost:5000/app:v2"),
            ("push", "true"),
            ("compression", "zstd"),
            ("force-compression", ""),
            ("oci-mediatypes", "false"),
            ("compression-level", "19"),
        ])
        .unwrap();

        assert!(request.push);
        assert_eq!(request.spec.compression, Compression::Zstd);
        assert!(request.spec.force);
        assert!(!request.spec.oci_media_types);
        assert_eq!(request.spec.level, Some(19));
        let target = request.target.unwrap();
        assert_eq!(target.registry, "localhost:5000");
        assert_eq!(target.tag, "v2");
    }

    #[test]
    fn test_from_attrs_defaults() {
        let request = attrs(&[("unpack", "true")]).unwrap();
        assert_eq!(request.spec, CompressionSpec::default());
        assert_eq!(request.spec.compression, Compression::Gzip);
        assert!(!request.push);
        assert!(request.target.is_none());
    }

    #[test]
    fn test_from_attrs_level_follows_compression() {
        // The level is checked against the final algorithm, whatever the
        // attribute order.
        let request = attrs(&[("compression-level", "15"), ("compression", "zstd")]).unwrap();
        assert_eq!(request.spec.level, Some(15));

        let err = attrs(&[("compression-level", "15"), ("compression", "gzip")]).unwrap_err();
        assert!(matches!(err, ExportError::InvalidAttribute { .. }));
    }

    #[test]
    fn test_from_attrs_rejects_bad_values() {
        assert!(matches!(
            attrs(&[("compression", "brotli")]).unwrap_err(),
            ExportError::UnsupportedAlgorithm(_)
        ));
        assert!(matches!(
            attrs(&[("push", "yes please")]).unwrap_err(),
            ExportError::InvalidAttribute { ref key, .. } if key == "push"
        ));
        assert!(matches!(
            attrs(&[("compression-level", "max")]).unwrap_err(),
            ExportError::InvalidAttribute { .. }
        ));
        assert!(matches!(
            attrs(&[("name", "bad name")]).unwrap_err(),
            ExportError::InvalidReference(_)
        ));
    }
}
