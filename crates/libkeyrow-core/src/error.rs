use thiserror::Error;

/// Errors from core types and configuration
#[derive(Debug, Error)]
pub enum KeyrowError {
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("key error: {0}")]
    Key(#[from] crate::key::KeyError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}
