//! Error types for the ambient (non-test-verdict) parts of the engine.
//!
//! A failing *test* is never represented as an `Err` here — that is a
//! [`crate::node::Verdict::Fail`], a normal outcome the TAP emitter knows how
//! to report. `EngineError` is reserved for failures in the scaffolding
//! around the test tree: malformed configuration or a writer that can't be
//! written to.

use std::path::PathBuf;

/// Errors raised by configuration loading and harness setup.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The configuration file could not be read from disk.
    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file's TOML could not be parsed.
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// A required environment variable referenced by `${VAR}` was not set.
    #[error("environment variable {0} is not set and has no default")]
    MissingEnvVar(String),

    /// Writing a TAP line to the output sink failed.
    #[error("failed to write TAP output: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
