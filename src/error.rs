//! Error types for specreduce

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Specreduce error types
#[derive(Error, Debug)]
pub enum Error {
    /// Parallel arrays disagree on shape
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Wavelength grids of two products differ
    #[error("wavelength grid mismatch: {0}")]
    WavelengthMismatch(String),

    /// No sky fiber found in the frame's fiber range
    #[error("no sky fiber in fiber range {fibermin}..={fibermax}")]
    NoSkyFibers {
        /// Lowest fiber number in the frame
        fibermin: i32,
        /// Highest fiber number in the frame
        fibermax: i32,
    },

    /// Malformed FITS structure
    #[error("invalid FITS format: {0}")]
    FitsFormat(String),

    /// A named HDU is absent from the file
    #[error("missing FITS extension '{0}'")]
    MissingExtension(String),

    /// A required header keyword is absent
    #[error("missing header keyword '{0}'")]
    MissingKeyword(String),

    /// findfile was asked for a path without one of its required inputs
    #[error("required input '{input}' is not set for type '{filetype}'")]
    MissingPathInput {
        /// Name of the missing input (night, expid, ...)
        input: &'static str,
        /// File type being resolved
        filetype: &'static str,
    },

    /// QA record is inconsistent with the data it describes
    #[error("QA error: {0}")]
    Qa(String),

    /// Figure rendering failed
    #[error("plot rendering failed: {0}")]
    Plot(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// QA file (de)serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
