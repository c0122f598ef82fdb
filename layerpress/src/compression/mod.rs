//! Layer compression algorithms, their media types and the per-layer
//! compression backend.

pub mod backend;
pub mod codec;

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use tracing::warn;

use crate::error::{ExportError, Result};
use codec::PayloadFormat;

pub use backend::compress;

pub const MEDIA_TYPE_OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
pub const MEDIA_TYPE_OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const MEDIA_TYPE_OCI_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
pub const MEDIA_TYPE_DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";
pub const MEDIA_TYPE_DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const MEDIA_TYPE_NYDUS_BLOB: &str = "application/vnd.oci.image.layer.nydus.blob.v1";
pub const MEDIA_TYPE_NYDUS_BOOTSTRAP: &str = "application/vnd.oci.image.layer.nydus.bootstrap.v1";

/// The single compression family of one export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Compression {
    Uncompressed,
    #[default]
    Gzip,
    Zstd,
    Nydus,
}

impl Compression {
    pub fn as_str(self) -> &'static str {
        match self {
            Compression::Uncompressed => "uncompressed",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
            Compression::Nydus => "nydus",
        }
    }

    /// Formats with no Docker v2 media type.
    pub fn only_supports_oci_types(self) -> bool {
        matches!(self, Compression::Zstd | Compression::Nydus)
    }

    pub fn level_range(self) -> Option<RangeInclusive<i32>> {
        match self {
            Compression::Gzip => Some(0..=9),
            Compression::Zstd => Some(1..=22),
            Compression::Uncompressed | Compression::Nydus => None,
        }
    }

    /// Payload encoding produced by the per-layer backend, `None` for nydus
    /// which restructures layers instead of compressing them.
    pub fn payload_format(self) -> Option<PayloadFormat> {
        match self {
            Compression::Uncompressed => Some(PayloadFormat::Tar),
            Compression::Gzip => Some(PayloadFormat::Gzip),
            Compression::Zstd => Some(PayloadFormat::Zstd),
            Compression::Nydus => None,
        }
    }
}

impl FromStr for Compression {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uncompressed" | "none" => Ok(Compression::Uncompressed),
            "gzip" => Ok(Compression::Gzip),
            "zstd" => Ok(Compression::Zstd),
            "nydus" => Ok(Compression::Nydus),
            _ => Err(ExportError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Media type of a layer blob produced under `compression`. For nydus this
/// is the blob media type; the bootstrap has its own.
pub fn layer_media_type(compression: Compression, oci_media_types: bool) -> &'static str {
    match (compression, oci_media_types) {
        (Compression::Uncompressed, true) => MEDIA_TYPE_OCI_LAYER,
        (Compression::Uncompressed, false) => MEDIA_TYPE_DOCKER_LAYER,
        (Compression::Gzip, true) => MEDIA_TYPE_OCI_LAYER_GZIP,
        (Compression::Gzip, false) => MEDIA_TYPE_DOCKER_LAYER_GZIP,
        (Compression::Zstd, _) => MEDIA_TYPE_OCI_LAYER_ZSTD,
        (Compression::Nydus, _) => MEDIA_TYPE_NYDUS_BLOB,
    }
}

/// Compression settings for one export. Every layer of the export is
/// produced under the same spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompressionSpec {
    pub compression: Compression,
    pub force: bool,
    pub oci_media_types: bool,
    pub level: Option<i32>,
}

impl CompressionSpec {
    pub fn new(compression: Compression) -> Self {
        Self {
            compression,
            ..Self::default()
        }
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_oci_media_types(mut self, oci_media_types: bool) -> Self {
        self.oci_media_types = oci_media_types;
        self
    }

    pub fn with_level(mut self, level: i32) -> Result<Self> {
        match self.compression.level_range() {
            Some(range) if range.contains(&level) => {
                self.level = Some(level);
                Ok(self)
            }
            _ => Err(ExportError::invalid_attribute(
                "compression-level",
                &format!("{level} (for {})", self.compression),
            )),
        }
    }

    /// Upgrades to OCI media types when the algorithm has no Docker
    /// equivalent.
    pub fn normalized(mut self) -> Self {
        if self.compression.only_supports_oci_types() && !self.oci_media_types {
            warn!(
                compression = %self.compression,
                "compression only supports OCI media types, enabling oci-mediatypes"
            );
            self.oci_media_types = true;
        }
        self
    }

    pub fn layer_media_type(&self) -> &'static str {
        layer_media_type(self.compression, self.oci_media_types)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compression() {
        assert_eq!("gzip".parse::<Compression>().unwrap(), Compression::Gzip);
        assert_eq!("ZSTD".parse::<Compression>().unwrap(), Compression::Zstd);
        assert_eq!("nydus".parse::<Compression>().unwrap(), Compression::Nydus);
        assert_eq!(
            "uncompressed".parse::<Compression>().unwrap(),
            Compression::Uncompressed
        );
        assert_eq!("none".parse::<Compression>().unwrap(), Compression::Uncompressed);
    }

    #[test]
    fn test_parse_unsupported_compression() {
        let err = "brotli".parse::<Compression>().unwrap_err();
        assert!(matches!(err, ExportError::UnsupportedAlgorithm(name) if name == "brotli"));
    }

    #[test]
    fn test_media_type_table() {
        assert_eq!(
            layer_media_type(Compression::Gzip, true),
            "application/vnd.oci.image.layer.v1.tar+gzip"
        );
        assert_eq!(
            layer_media_type(Compression::Zstd, true),
            "application/vnd.oci.image.layer.v1.tar+zstd"
        );
        assert_eq!(
            layer_media_type(Compression::Gzip, false),
            MEDIA_TYPE_DOCKER_LAYER_GZIP
        );
        assert_eq!(
            layer_media_type(Compression::Uncompressed, true),
            MEDIA_TYPE_OCI_LAYER
        );
        assert_ne!(layer_media_type(Compression::Nydus, true), MEDIA_TYPE_OCI_LAYER_GZIP);
        assert_ne!(layer_media_type(Compression::Nydus, true), MEDIA_TYPE_OCI_LAYER_ZSTD);
    }

    #[test]
    fn test_normalized_forces_oci_types() {
        let spec = CompressionSpec::new(Compression::Zstd).normalized();
        assert!(spec.oci_media_types);

        let spec = CompressionSpec::new(Compression::Gzip).normalized();
        assert!(!spec.oci_media_types);
    }

    #[test]
    fn test_level_validation() {
        assert_eq!(
            CompressionSpec::new(Compression::Zstd)
                .with_level(19)
                .unwrap()
                .level,
            Some(19)
        );
        assert!(CompressionSpec::new(Compression::Gzip).with_level(12).is_err());
        assert!(CompressionSpec::new(Compression::Nydus).with_level(3).is_err());
    }
}
