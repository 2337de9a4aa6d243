use std::path::PathBuf;

/// Errors that abort a run.
///
/// Per-name resolution misses and per-task migration failures never surface
/// here; they are reported through `Resolution` and `MigrationOutcome`.
#[derive(Debug, thiserror::Error)]
pub enum ChurnError {
    #[error("Could not connect to {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },

    #[error("Input file {} does not exist", .0.display())]
    InputNotFound(PathBuf),

    #[error("Input error: {0}")]
    Input(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Inventory error: {0}")]
    Inventory(String),

    #[error("Unclassified migration engine failure: {0}")]
    Engine(String),

    #[error("Migration worker aborted: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),
}
