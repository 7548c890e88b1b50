use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DcosError {
    /// Malformed argv or unknown verb.
    #[error("{0}")]
    Usage(String),
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    Auth(String),
    #[error("{message}")]
    Transport { url: String, message: String },
    #[error("HTTP {status}: {message}")]
    Remote { status: u16, message: String },
    #[error("{0}")]
    Integrity(String),
    #[error("{0}")]
    State(String),
    /// An external tool (tar, unzip, a plugin) failed to run.
    #[error("{0}")]
    Process(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("toml error: {0}")]
    TomlRead(#[from] toml::de::Error),
    #[error("toml error: {0}")]
    TomlWrite(#[from] toml::ser::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl DcosError {
    pub fn missing_config(key: &str) -> Self {
        DcosError::Config(format!(
            "Missing required config parameter: \"{key}\".  Please run `dcos config set {key} <value>`."
        ))
    }
}

pub type Result<T, E = DcosError> = std::result::Result<T, E>;
