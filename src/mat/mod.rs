//! Matrix-file reader for the three persisted formats used by the
//! simulation pipeline.
//!
//! A single dataset can mix files written by MATLAB (binary level-5 for v7,
//! an HDF5 container for v7.3) and by Octave (plain text).  [`load_mat`]
//! hides the difference: it tries each decoder in a fixed order and returns
//! the same canonical mapping regardless of which one succeeded.
//!
//! ```text
//! load_mat(path)
//!   ├─ v5::decode     MAT level-5 binary (MATLAB ≤ v7, scipy savemat)
//!   ├─ hdf5::decode   HDF5 container (MATLAB v7.3), one level deep
//!   └─ text::decode   Octave plain-text format
//! ```
//!
//! Every decoder returns arrays in canonical order: logical MATLAB shape,
//! row-major memory.  Column-major on-disk layouts are transposed on load.
//!
//! The first two attempts fail silently (the next decoder gets its turn);
//! only when all three fail does [`load_mat`] raise
//! [`ExtractError::Format`].
pub mod hdf5;
pub mod text;
pub mod v5;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result as DecodeResult;
use ndarray::{ArrayD, IxDyn, ShapeBuilder};
use tracing::debug;

use crate::error::{ExtractError, Result};

// ── Value types ───────────────────────────────────────────────────────────

/// One named variable from a matrix file.
///
/// Numeric storage classes are widened to `f64` on load (the native MATLAB
/// width), so downstream code never branches on dtype.
#[derive(Debug, Clone, PartialEq)]
pub enum MatVar {
    /// A true scalar (Octave `# type: scalar`, or a 1×1 matrix).
    Scalar(f64),
    /// An N-dimensional numeric array in canonical order.
    Array(ArrayD<f64>),
    /// A character array.
    Text(String),
}

impl MatVar {
    /// Scalar view: `Scalar`, or any array with exactly one element.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            MatVar::Scalar(v) => Some(*v),
            MatVar::Array(a) if a.len() == 1 => a.iter().next().copied(),
            _ => None,
        }
    }

    /// Array view (`None` for text).  Scalars are not converted; use
    /// [`as_scalar`](Self::as_scalar) for those.
    pub fn as_array(&self) -> Option<&ArrayD<f64>> {
        match self {
            MatVar::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MatVar::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// A loaded matrix file: variable name → value.
#[derive(Debug, Clone, Default)]
pub struct MatFile {
    pub vars: BTreeMap<String, MatVar>,
}

impl MatFile {
    pub fn get(&self, name: &str) -> Option<&MatVar> {
        self.vars.get(name)
    }

    /// All variable names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.vars.keys().map(String::as_str).collect()
    }
}

// ── Dispatch ──────────────────────────────────────────────────────────────

/// Load a matrix file of any supported encoding.
///
/// Decode order: binary v5, then the HDF5 container, then Octave text.
/// The order matters only for speed (each decoder rejects foreign magic
/// bytes almost immediately); a file parseable by one encoding is not
/// parseable by the others.
pub fn load_mat<P: AsRef<Path>>(path: P) -> Result<MatFile> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;

    match v5::decode(&bytes) {
        Ok(vars) => return Ok(MatFile { vars }),
        Err(e) => debug!(path = %path.display(), "not MAT v5: {e:#}"),
    }
    match hdf5::decode(&bytes) {
        Ok(vars) => return Ok(MatFile { vars }),
        Err(e) => debug!(path = %path.display(), "not HDF5: {e:#}"),
    }
    match text::decode(&bytes) {
        Ok(vars) => Ok(MatFile { vars }),
        Err(e) => Err(ExtractError::Format {
            path: path.to_path_buf(),
            reason: format!("{e:#}"),
        }),
    }
}

// ── Shared shape plumbing ─────────────────────────────────────────────────

/// Build a canonical (row-major) array from column-major flat data.
///
/// Both binary encodings and the Octave text format lay values out in
/// column-major order relative to the logical MATLAB shape; this is the one
/// place that transposes them back.
pub(crate) fn from_col_major(dims: &[usize], data: Vec<f64>) -> DecodeResult<ArrayD<f64>> {
    let n: usize = dims.iter().product();
    anyhow::ensure!(
        n == data.len(),
        "shape {dims:?} wants {n} values, got {}",
        data.len()
    );
    let arr = ArrayD::from_shape_vec(IxDyn(dims).f(), data)?;
    Ok(arr.as_standard_layout().into_owned())
}

/// Collapse a freshly decoded array to `Scalar` when it is 1×1.
///
/// MATLAB has no scalar type; every scalar round-trips as a 1×1 matrix.
pub(crate) fn collapse_scalar(arr: ArrayD<f64>) -> MatVar {
    if arr.len() == 1 {
        MatVar::Scalar(arr.iter().next().copied().unwrap_or(0.0))
    } else {
        MatVar::Array(arr)
    }
}
