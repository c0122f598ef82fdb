use thiserror::Error;

use crate::compression::Compression;
use crate::registry::RegistryError;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Unsupported compression algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Nydus conversion failed for layer {index}: {reason}")]
    Conversion { index: usize, reason: String },

    #[error("Export requires at least one layer")]
    EmptyLayerSet,

    #[error("Layer ordinal {0} appears more than once")]
    DuplicateLayerIndex(usize),

    #[error("Layer {index} is {found} but the image is {expected}")]
    MixedLayerFormats {
        index: usize,
        expected: Compression,
        found: Compression,
    },

    #[error("Nydus bootstrap must be the single last layer, found at position {0}")]
    MisplacedBootstrap(usize),

    #[error("Invalid value for export attribute {key}: {value}")]
    InvalidAttribute { key: String, value: String },

    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    #[error("Publish failed: {0}")]
    Publish(#[from] RegistryError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Layer task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ExportError {
    pub(crate) fn conversion(index: usize, reason: impl ToString) -> Self {
        ExportError::Conversion {
            index,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn invalid_attribute(key: &str, value: &str) -> Self {
        ExportError::InvalidAttribute {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ExportError>;
