use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("invalid channel: {0}")]
    InvalidChannel(String),

    #[error("invalid subscription pattern: {0}")]
    InvalidPattern(String),

    #[error("event channel closed")]
    ChannelClosed,

    #[error("subscriber lagged behind by {0} events")]
    Lagged(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("no platform config directory available")]
    NoConfigDir,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("session store encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}
