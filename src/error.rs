use std::path::PathBuf;

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to encode checkpoint: {0}")]
    Encode(String),

    #[error("failed to decode checkpoint {path}: {message}")]
    Decode { path: PathBuf, message: String },

    #[error("checkpoint is missing parameter '{0}'")]
    MissingKey(String),

    #[error("checkpoint has unexpected parameters: {0:?}")]
    UnexpectedKeys(Vec<String>),

    #[error("shape mismatch for '{name}': checkpoint {stored:?}, model {expected:?}")]
    ShapeMismatch {
        name: String,
        stored: Vec<usize>,
        expected: Vec<usize>,
    },

    #[error("optimizer state references unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("key '{key}' does not carry the prefix '{prefix}'")]
    UnmappedKey { key: String, prefix: String },

    #[error("unsupported checkpoint schema version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("optimizer record error: {0}")]
    Recorder(String),

    #[error("tensor data error: {0}")]
    Tensor(String),
}

/// Errors that can occur during training.
#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("evaluation requested but no validation data was supplied")]
    NoValidationData,

    #[error("this trainer requires a checkpoint directory")]
    MissingCheckpointDir,

    #[error("loader trainer requires a loader path")]
    MissingLoaderPath,

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    Validation(String),
}
