//! Error taxonomy for the extraction pipeline.
//!
//! The split between fatal and recoverable errors is positional: everything
//! the batch driver hits *before* its sample loop (metadata unreadable,
//! forward model missing, empty clip pool) aborts the run, while any variant
//! raised *inside* the loop is caught at the loop boundary, logged with the
//! sample index, and counted as a single failed sample.
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    /// No decoding strategy could parse a matrix file.
    #[error("no decoder could parse {}: {reason}", path.display())]
    Format {
        /// File that failed every decode attempt
        path: PathBuf,
        /// Failure detail from the last (text) attempt
        reason: String,
    },

    /// Forward-model file has no matrix under any accepted variable name.
    #[error("no forward matrix in {} (tried {tried:?}, found {found:?})", path.display())]
    ForwardModelNotFound {
        /// Forward-model file
        path: PathBuf,
        /// Variable names searched, in order
        tried: &'static [&'static str],
        /// Variable names actually present in the file
        found: Vec<String>,
    },

    /// A clip listed in the pool was gone by the time it was read.
    #[error("spike clip vanished between listing and read: {}", path.display())]
    ClipNotFound {
        /// Resolved clip path
        path: PathBuf,
    },

    /// Clean sensor signal has zero power, so SNR calibration would divide
    /// by zero.
    #[error("sample {index}: clean signal has zero power, cannot calibrate noise")]
    DegenerateSample {
        /// Absolute dataset index of the sample
        index: usize,
    },

    /// A metadata field's rank or shape matches none of the recognized
    /// dataset-version layouts.
    #[error("field '{field}' has unrecognized shape {shape:?}: {detail}")]
    ShapeMismatch {
        /// Metadata variable name
        field: &'static str,
        /// Shape as stored on disk
        shape: Vec<usize>,
        /// What was expected
        detail: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExtractError>;
