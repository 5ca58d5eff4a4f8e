use thiserror::Error;

use crate::classifier::ClassifierError;

/// Failures reading or writing categorizer configuration sources. The
/// categorizer itself never surfaces these from loading; it logs and falls
/// back to empty or default state.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid model artifact: {0}")]
    Model(#[from] ClassifierError),
}
