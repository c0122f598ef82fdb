use thiserror::Error;

#[derive(Error, Debug)]
pub enum LayerpressCliError {
    #[error("Input error: {0}")]
    Input(String),
    #[error("{0}")]
    ExportRuntime(#[from] layerpress::ExportError),
    #[error("{0}")]
    RegistryRuntime(#[from] layerpress::registry::RegistryError),
    #[error("Manifest parse error: {0}")]
    ManifestParse(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LayerpressCliError>;
