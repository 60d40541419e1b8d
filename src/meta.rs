//! Dataset metadata normalization.
//!
//! The metadata file describes every sample to synthesize, but its fields
//! changed rank between dataset generations: `nmm_idx` may be flat or
//! per-source, `scale_ratio` may carry a trailing SNR-level axis,
//! `selected_region` may or may not have a source axis, and `scale_ratio`
//! is NaN for most records in some versions.  All of that skew is resolved
//! **once** here, at load time — [`DatasetMeta::open`] canonicalizes every
//! field to a fixed rank, and [`DatasetMeta::sample`] just indexes.
//!
//! Canonical shapes (`n` samples, `s` source slots, `p` patch width):
//!
//! ```text
//! selected_region  (n, s, p)   region ids, padding-filled
//! nmm_idx          (n, s)      clip index per source slot
//! scale_ratio      (n, s)      amplitude scale, NaN → default
//! mag_change       (n, s, p)   per-region patch weights, padding-filled
//! current_snr      (n,)        optional sensor SNR in dB
//! ```
use std::path::{Path, PathBuf};

use ndarray::{s, Array1, Array2, Array3, ArrayD, Axis, IxDyn};
use tracing::warn;

use crate::config::ExtractConfig;
use crate::error::{ExtractError, Result};
use crate::mat::{load_mat, MatFile, MatVar};

// ── Per-sample view ───────────────────────────────────────────────────────

/// One source patch of a sample: a set of cortical regions driven by one
/// spike clip.
#[derive(Debug, Clone)]
pub struct SourceSlot {
    /// Active region ids, padding removed.  The first entry is the patch
    /// center whose waveform drives the whole patch.
    pub regions: Vec<usize>,
    /// Index into the (cycled) spike-clip pool.
    pub nmm_index: usize,
    /// Amplitude scale applied to the center waveform.
    pub scale: f64,
    /// Per-region weight, aligned with `regions` (center weight 1).
    pub weights: Vec<f64>,
}

/// Fully resolved metadata for one sample index.
#[derive(Debug, Clone)]
pub struct SampleMeta {
    /// Absolute dataset index.
    pub index: usize,
    /// Raw fixed-width label matrix `(s, p)`, padding included — persisted
    /// verbatim into the output sample.
    pub labels: Array2<f64>,
    /// Usable source slots (all-padding slots are dropped here).
    pub sources: Vec<SourceSlot>,
    /// Sensor-space SNR target in dB.
    pub snr_db: f64,
}

// ── Loader ────────────────────────────────────────────────────────────────

/// Load-once wrapper over the metadata file.
#[derive(Debug, Clone)]
pub struct DatasetMeta {
    path: PathBuf,
    selected_region: Array3<f64>,
    nmm_idx: Array2<f64>,
    scale_ratio: Array2<f64>,
    mag_change: Array3<f64>,
    current_snr: Option<Array1<f64>>,
    cfg: ExtractConfig,
}

impl DatasetMeta {
    /// Load and canonicalize a metadata file.
    ///
    /// Rank reconciliation happens here and nowhere else; a field whose
    /// rank matches no known dataset version is a fatal
    /// [`ExtractError::ShapeMismatch`] ("wrong file entirely", as opposed
    /// to one bad record, which surfaces per sample).
    pub fn open<P: AsRef<Path>>(path: P, cfg: &ExtractConfig) -> Result<Self> {
        let path = path.as_ref();
        let file = load_mat(path)?;

        let selected_region = canon_regions(&file)?;
        let (n, s_dim, _p) = selected_region.dim();

        let nmm_idx = canon_per_slot(&file, "nmm_idx", n, s_dim)?;
        let scale_ratio = canon_per_slot(&file, "scale_ratio", n, s_dim)?;
        let mag_change = canon_patch(&file, "mag_change", n, s_dim)?;
        let current_snr = canon_snr(&file, n)?;

        Ok(Self {
            path: path.to_path_buf(),
            selected_region,
            nmm_idx,
            scale_ratio,
            mag_change,
            current_snr,
            cfg: cfg.clone(),
        })
    }

    /// Number of samples described by the file.
    pub fn len(&self) -> usize {
        self.selected_region.dim().0
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve sample `index` to a well-formed (regions, clip, scale,
    /// weights, snr) view.
    ///
    /// Absent or NaN optional fields fall back to the configured defaults;
    /// a clip index that is negative or non-finite is a per-sample
    /// [`ExtractError::ShapeMismatch`].
    pub fn sample(&self, index: usize) -> Result<SampleMeta> {
        let (n, n_src, _p) = self.selected_region.dim();
        if index >= n {
            return Err(ExtractError::ShapeMismatch {
                field: "selected_region",
                shape: self.selected_region.shape().to_vec(),
                detail: format!("sample index {index} out of range ({n} samples)"),
            });
        }

        let labels = self.selected_region.slice(s![index, .., ..]).to_owned();
        let mut sources = Vec::new();

        for slot in 0..n_src {
            let regions: Vec<usize> = labels
                .row(slot)
                .iter()
                .filter(|&&v| v.is_finite() && !self.cfg.is_padding(v))
                .map(|&v| v as usize)
                .collect();
            if regions.is_empty() {
                continue; // slot is entirely padding
            }

            let raw_idx = self.nmm_idx[[index, slot]];
            if !raw_idx.is_finite() || raw_idx < 0.0 {
                return Err(ExtractError::ShapeMismatch {
                    field: "nmm_idx",
                    shape: self.nmm_idx.shape().to_vec(),
                    detail: format!("sample {index} slot {slot}: bad clip index {raw_idx}"),
                });
            }

            let mut scale = self.scale_ratio[[index, slot]];
            if !scale.is_finite() {
                warn!(
                    index,
                    slot,
                    default = self.cfg.default_scale,
                    "scale_ratio is NaN, substituting default"
                );
                scale = self.cfg.default_scale;
            }

            let mut weights: Vec<f64> = self
                .mag_change
                .slice(s![index, slot, ..])
                .iter()
                .filter(|&&v| v.is_finite() && !self.cfg.is_padding(v))
                .copied()
                .collect();
            // Patch widths can disagree by one between generators; align
            // to the region list, missing weights default to the center
            // weight of 1.
            weights.truncate(regions.len());
            weights.resize(regions.len(), 1.0);

            sources.push(SourceSlot {
                regions,
                nmm_index: raw_idx as usize,
                scale,
                weights,
            });
        }

        let snr_db = match &self.current_snr {
            Some(snr) if snr[index].is_finite() => snr[index],
            _ => self.cfg.default_snr_db,
        };

        Ok(SampleMeta { index, labels, sources, snr_db })
    }
}

// ── Canonicalization ──────────────────────────────────────────────────────

/// Fetch a numeric field as a dyn array; 1×1 collapse undone.
fn field_array(file: &MatFile, name: &'static str) -> Result<ArrayD<f64>> {
    match file.get(name) {
        Some(MatVar::Array(a)) => Ok(a.clone()),
        Some(MatVar::Scalar(v)) => Ok(ArrayD::from_elem(IxDyn(&[1, 1]), *v)),
        Some(MatVar::Text(_)) => Err(ExtractError::ShapeMismatch {
            field: name,
            shape: vec![],
            detail: "expected a numeric array, found text".into(),
        }),
        None => Err(ExtractError::ShapeMismatch {
            field: name,
            shape: vec![],
            detail: "variable missing from metadata file".into(),
        }),
    }
}

fn shape_mismatch(field: &'static str, arr: &ArrayD<f64>, detail: &str) -> ExtractError {
    ExtractError::ShapeMismatch {
        field,
        shape: arr.shape().to_vec(),
        detail: detail.into(),
    }
}

/// `selected_region` → `(n, s, p)`.
fn canon_regions(file: &MatFile) -> Result<Array3<f64>> {
    let arr = field_array(file, "selected_region")?;
    let arr = match arr.ndim() {
        // (n,): one region per sample
        1 => arr.insert_axis(Axis(1)).insert_axis(Axis(2)),
        // (n, p): single source slot
        2 => arr.insert_axis(Axis(1)),
        3 => arr,
        _ => return Err(shape_mismatch("selected_region", &arr, "expected rank 1–3")),
    };
    arr.into_dimensionality()
        .map_err(|_| ExtractError::ShapeMismatch {
            field: "selected_region",
            shape: vec![],
            detail: "rank canonicalization failed".into(),
        })
}

/// Per-slot scalar fields (`nmm_idx`, `scale_ratio`) → `(n, s)`.
///
/// * rank 1 `(n,)` — one value shared by every slot;
/// * rank 2 `(n, k)` — per-slot, clamped when `k < s` (and a trailing
///   SNR-level axis of a 2-D `scale_ratio` collapses to level 0 the same
///   way: the first column);
/// * rank 3 `(n, k, levels)` — per-slot with SNR levels; level 0 is used.
fn canon_per_slot(
    file: &MatFile,
    name: &'static str,
    n: usize,
    n_src: usize,
) -> Result<Array2<f64>> {
    let arr = field_array(file, name)?;
    if arr.shape()[0] != n {
        return Err(shape_mismatch(name, &arr, &format!("first axis must be {n} samples")));
    }
    let two_d: Array2<f64> = match arr.ndim() {
        1 => {
            let col = arr.into_dimensionality::<ndarray::Ix1>().unwrap();
            let mut out = Array2::zeros((n, n_src));
            for slot in 0..n_src {
                out.column_mut(slot).assign(&col);
            }
            out
        }
        2 => arr.into_dimensionality().unwrap(),
        3 => {
            let levels = arr.into_dimensionality::<ndarray::Ix3>().unwrap();
            levels.index_axis(Axis(2), 0).to_owned()
        }
        _ => return Err(shape_mismatch(name, &arr, "expected rank 1–3")),
    };
    // Clamp the slot axis by repeating the last column when short.
    let k = two_d.ncols();
    if k == 0 {
        return Err(ExtractError::ShapeMismatch {
            field: name,
            shape: two_d.shape().to_vec(),
            detail: "empty slot axis".into(),
        });
    }
    if k >= n_src {
        Ok(two_d.slice(s![.., ..n_src]).to_owned())
    } else {
        let mut out = Array2::zeros((n, n_src));
        for slot in 0..n_src {
            out.column_mut(slot).assign(&two_d.column(slot.min(k - 1)));
        }
        Ok(out)
    }
}

/// Patch-weight field (`mag_change`) → `(n, s, p)`.
fn canon_patch(
    file: &MatFile,
    name: &'static str,
    n: usize,
    n_src: usize,
) -> Result<Array3<f64>> {
    let arr = field_array(file, name)?;
    if arr.shape()[0] != n {
        return Err(shape_mismatch(name, &arr, &format!("first axis must be {n} samples")));
    }
    let three_d: Array3<f64> = match arr.ndim() {
        2 => arr.insert_axis(Axis(1)).into_dimensionality().unwrap(),
        3 => arr.into_dimensionality().unwrap(),
        _ => return Err(shape_mismatch(name, &arr, "expected rank 2–3")),
    };
    let k = three_d.dim().1;
    if k >= n_src {
        Ok(three_d.slice(s![.., ..n_src, ..]).to_owned())
    } else {
        // Shared weights across slots when the file has fewer.
        let p = three_d.dim().2;
        let mut out = Array3::zeros((n, n_src, p));
        for slot in 0..n_src {
            out.index_axis_mut(Axis(1), slot)
                .assign(&three_d.index_axis(Axis(1), slot.min(k - 1)));
        }
        Ok(out)
    }
}

/// Optional `current_snr` → `(n,)`.
fn canon_snr(file: &MatFile, n: usize) -> Result<Option<Array1<f64>>> {
    let arr = match file.get("current_snr") {
        Some(MatVar::Array(a)) => a.clone(),
        Some(MatVar::Scalar(v)) => ArrayD::from_elem(IxDyn(&[1]), *v),
        _ => return Ok(None),
    };
    let flat: Array1<f64> = match arr.ndim() {
        1 => arr.into_dimensionality().unwrap(),
        2 if arr.shape()[1] == 1 => {
            arr.index_axis(Axis(1), 0).to_owned().into_dimensionality().unwrap()
        }
        2 if arr.shape()[0] == 1 => {
            arr.index_axis(Axis(0), 0).to_owned().into_dimensionality().unwrap()
        }
        _ => return Err(shape_mismatch("current_snr", &arr, "expected a vector")),
    };
    if flat.len() == 1 && n > 1 {
        return Ok(Some(Array1::from_elem(n, flat[0])));
    }
    if flat.len() != n {
        return Err(ExtractError::ShapeMismatch {
            field: "current_snr",
            shape: vec![flat.len()],
            detail: format!("expected {n} entries"),
        });
    }
    Ok(Some(flat))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mat::v5::write_mat5;
    use ndarray::IxDyn;

    fn write_meta(dir: &std::path::Path, vars: &[(&str, MatVar)]) -> PathBuf {
        let path = dir.join("meta.mat");
        write_mat5(&path, vars).unwrap();
        path
    }

    fn arr(shape: &[usize], values: Vec<f64>) -> MatVar {
        MatVar::Array(ArrayD::from_shape_vec(IxDyn(shape), values).unwrap())
    }

    #[test]
    fn flat_fields_resolve_per_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_meta(
            dir.path(),
            &[
                // 2 samples, 1 implicit slot, patch width 2
                ("selected_region", arr(&[2, 2], vec![3.0, -1.0, 5.0, 6.0])),
                ("nmm_idx", arr(&[2], vec![0.0, 7.0])),
                ("scale_ratio", arr(&[2], vec![12.0, f64::NAN])),
                ("mag_change", arr(&[2, 2], vec![1.0, -1.0, 1.0, 0.5])),
            ],
        );
        let meta = DatasetMeta::open(&path, &ExtractConfig::default()).unwrap();
        assert_eq!(meta.len(), 2);

        let s0 = meta.sample(0).unwrap();
        assert_eq!(s0.sources.len(), 1);
        assert_eq!(s0.sources[0].regions, vec![3]);
        assert_eq!(s0.sources[0].nmm_index, 0);
        assert_eq!(s0.sources[0].scale, 12.0);
        assert_eq!(s0.sources[0].weights, vec![1.0]);

        // NaN scale → default 30.0
        let s1 = meta.sample(1).unwrap();
        assert_eq!(s1.sources[0].regions, vec![5, 6]);
        assert_eq!(s1.sources[0].scale, 30.0);
        assert_eq!(s1.sources[0].weights, vec![1.0, 0.5]);
    }

    #[test]
    fn nested_fields_resolve_per_slot() {
        let dir = tempfile::tempdir().unwrap();
        // 1 sample, 2 slots, patch width 1
        let path = write_meta(
            dir.path(),
            &[
                ("selected_region", arr(&[1, 2, 1], vec![2.0, 4.0])),
                ("nmm_idx", arr(&[1, 2], vec![5.0, 9.0])),
                ("scale_ratio", arr(&[1, 2], vec![10.0, 20.0])),
                ("mag_change", arr(&[1, 2, 1], vec![1.0, 1.0])),
            ],
        );
        let meta = DatasetMeta::open(&path, &ExtractConfig::default()).unwrap();
        let sm = meta.sample(0).unwrap();
        assert_eq!(sm.sources.len(), 2);
        assert_eq!(sm.sources[0].nmm_index, 5);
        assert_eq!(sm.sources[1].nmm_index, 9);
        assert_eq!(sm.sources[1].scale, 20.0);
    }

    #[test]
    fn scale_levels_use_level_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_meta(
            dir.path(),
            &[
                ("selected_region", arr(&[1, 1, 1], vec![0.0])),
                ("nmm_idx", arr(&[1], vec![0.0])),
                // (n=1, s=1, levels=3): level 0 must win
                ("scale_ratio", arr(&[1, 1, 3], vec![7.0, 8.0, 9.0])),
                ("mag_change", arr(&[1, 1, 1], vec![1.0])),
            ],
        );
        let meta = DatasetMeta::open(&path, &ExtractConfig::default()).unwrap();
        assert_eq!(meta.sample(0).unwrap().sources[0].scale, 7.0);
    }

    #[test]
    fn all_padding_slot_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_meta(
            dir.path(),
            &[
                (
                    "selected_region",
                    // slot 0 real, slot 1 entirely padding (15213 sentinel)
                    arr(&[1, 2, 2], vec![1.0, -1.0, 15213.0, 15213.0]),
                ),
                ("nmm_idx", arr(&[1, 2], vec![0.0, 1.0])),
                ("scale_ratio", arr(&[1, 2], vec![5.0, 5.0])),
                ("mag_change", arr(&[1, 2, 2], vec![1.0, -1.0, 1.0, 1.0])),
            ],
        );
        let meta = DatasetMeta::open(&path, &ExtractConfig::default()).unwrap();
        let sm = meta.sample(0).unwrap();
        assert_eq!(sm.sources.len(), 1);
        assert_eq!(sm.sources[0].regions, vec![1]);
    }

    #[test]
    fn missing_field_is_shape_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_meta(
            dir.path(),
            &[("selected_region", arr(&[1, 1], vec![0.0]))],
        );
        let err = DatasetMeta::open(&path, &ExtractConfig::default()).unwrap_err();
        assert!(matches!(err, ExtractError::ShapeMismatch { field: "nmm_idx", .. }));
    }

    #[test]
    fn wrong_rank_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_meta(
            dir.path(),
            &[
                ("selected_region", arr(&[1, 1, 1, 1], vec![0.0])),
                ("nmm_idx", arr(&[1], vec![0.0])),
                ("scale_ratio", arr(&[1], vec![1.0])),
                ("mag_change", arr(&[1, 1], vec![1.0])),
            ],
        );
        assert!(DatasetMeta::open(&path, &ExtractConfig::default()).is_err());
    }

    #[test]
    fn snr_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_meta(
            dir.path(),
            &[
                ("selected_region", arr(&[2, 1], vec![0.0, 1.0])),
                ("nmm_idx", arr(&[2], vec![0.0, 0.0])),
                ("scale_ratio", arr(&[2], vec![1.0, 1.0])),
                ("mag_change", arr(&[2, 1], vec![1.0, 1.0])),
                ("current_snr", arr(&[2], vec![f64::NAN, 6.0])),
            ],
        );
        let meta = DatasetMeta::open(&path, &ExtractConfig::default()).unwrap();
        assert_eq!(meta.sample(0).unwrap().snr_db, 20.0);
        assert_eq!(meta.sample(1).unwrap().snr_db, 6.0);
    }

    #[test]
    fn out_of_range_index_is_per_sample_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_meta(
            dir.path(),
            &[
                ("selected_region", arr(&[1, 1], vec![0.0])),
                ("nmm_idx", arr(&[1], vec![0.0])),
                ("scale_ratio", arr(&[1], vec![1.0])),
                ("mag_change", arr(&[1, 1], vec![1.0])),
            ],
        );
        let meta = DatasetMeta::open(&path, &ExtractConfig::default()).unwrap();
        assert!(meta.sample(5).is_err());
    }
}
