use std::path::PathBuf;

/// Errors returned while setting a session up.
///
/// Failures of a running session (lost connections, undeliverable frames, malformed server frames) are not errors:
/// the session recovers from them on its own and reports them through [crate::Event].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("username must not be empty")]
    EmptyUsername,
    #[error("failed to read config {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("unknown location preset `{0}`")]
    UnknownPreset(String),
}

pub type Result<T> = std::result::Result<T, Error>;
