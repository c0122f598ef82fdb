use crate::compression::{Compression, CompressionSpec};

/// How the layers of one export are transformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportStrategy {
    /// Every diff goes through the compression backend on its own.
    PerLayer(CompressionSpec),
    /// The whole ordered diff set goes through the nydus converter at once.
    WholeSet,
}

impl ExportStrategy {
    pub fn select(spec: &CompressionSpec) -> Self {
        match spec.compression {
            Compression::Nydus => ExportStrategy::WholeSet,
            Compression::Uncompressed | Compression::Gzip | Compression::Zstd => {
                ExportStrategy::PerLayer(spec.normalized())
            }
        }
    }
}
