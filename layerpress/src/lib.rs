//! Core library for exporting container images from build layer diffs.
//!
//! The crate takes the ordered layer changesets of a build, transforms them
//! under a single compression policy (uncompressed, gzip, zstd or nydus),
//! assembles an OCI or Docker v2 manifest over the results and writes
//! everything into a content addressed store, optionally pushing the image
//! to a registry.

/// Transform stage outputs waiting to be listed in a manifest.
pub mod artifact;
/// Compression algorithms, media types and the per-layer backend.
pub mod compression;
/// Environment driven settings.
pub mod config;
/// Layer changesets handed over by the build.
pub mod diff;
pub mod digest;
pub mod error;
/// Export orchestration, strategy selection and manifest assembly.
pub mod export;
/// Types that model OCI image manifests and configs.
pub mod manifest;
/// Conversion of layer sets to nydus blobs plus a bootstrap.
pub mod nydus;
pub mod reference;
/// Registry client and publisher for pushing exported images.
pub mod registry;
/// Content addressed blob stores.
pub mod store;

#[cfg(test)]
mod testutil;

pub use artifact::{Artifact, ArtifactRole};
pub use compression::{Compression, CompressionSpec};
pub use diff::LayerDiff;
pub use error::{ExportError, Result};
pub use export::{ExportRequest, ExportedImage, Exporter, Manifest};
pub use reference::ImageReference;
pub use store::{ContentStore, LayoutStore, MemoryStore};
