//! Error types for millrace-common
//!
//! Defines module-specific error types using thiserror for clear error
//! propagation. Protocol violations inside the pipeline are deliberately
//! not represented here: they are contract breaches and abort instead of
//! propagating (see the pipeline crate).

use thiserror::Error;

/// Main error type for millrace-common
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration value out of range
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Sample rate not supported by the pipeline
    #[error("Unsupported sample rate: {0}")]
    SampleRateInvalid(u32),
}

/// Convenience Result type using millrace-common Error
pub type Result<T> = std::result::Result<T, Error>;
