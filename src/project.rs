//! Forward-model projection and sensor-space synthesis.
//!
//! One call to [`project`] turns a source-space time series into a
//! physically plausible sensor recording:
//!
//! ```text
//! source [T, R] ─ zero inactive columns, apply patch weights
//!        │
//!        ├─ · fwdᵀ [R, S]      clean sensor signal [T, S]
//!        ├─ mean-center (time)
//!        ├─ + white noise      σ² = power / 10^(snr_db / 10)
//!        ├─ ÷ max |·|          eeg in [-1, 1]
//!        │
//!        └─ min-max over active columns → source in [0, 1]
//! ```
//!
//! Normalization is per-sample: each output is scaled by its own extrema,
//! never by dataset-wide statistics.
use std::path::Path;

use ndarray::{Array2, Axis};
use rand::Rng;
use rand_distr::StandardNormal;
use tracing::warn;

use crate::error::{ExtractError, Result};
use crate::mat::MatFile;

/// Variable names accepted for the forward matrix, in lookup order.
pub const FORWARD_NAMES: [&str; 4] = ["fwd", "forward", "leadfield", "L"];

// ── Forward-model lookup ──────────────────────────────────────────────────

/// Find the `(sensors, regions)` forward matrix in a loaded file.
///
/// Fails with [`ExtractError::ForwardModelNotFound`] when none of the
/// accepted names holds a 2-D array — fatal to the whole run, since
/// nothing can be projected without it.
pub fn find_forward_matrix(file: &MatFile, path: &Path) -> Result<Array2<f64>> {
    for name in FORWARD_NAMES {
        if let Some(arr) = file.get(name).and_then(|v| v.as_array()) {
            if arr.ndim() == 2 {
                let fwd = arr
                    .clone()
                    .into_dimensionality::<ndarray::Ix2>()
                    .expect("rank checked");
                if fwd.nrows() >= fwd.ncols() {
                    // Leadfields are wide (regions ≫ sensors); a tall one
                    // usually means the file was saved transposed.
                    warn!(
                        shape = ?fwd.dim(),
                        "forward matrix is taller than wide; check its orientation"
                    );
                }
                return Ok(fwd);
            }
        }
    }
    Err(ExtractError::ForwardModelNotFound {
        path: path.to_path_buf(),
        tried: &FORWARD_NAMES,
        found: file.names().iter().map(|s| s.to_string()).collect(),
    })
}

// ── Noise synthesis ───────────────────────────────────────────────────────

/// Mean squared amplitude over all elements.
pub fn signal_power(signal: &Array2<f64>) -> f64 {
    if signal.is_empty() {
        return 0.0;
    }
    signal.iter().map(|&v| v * v).sum::<f64>() / signal.len() as f64
}

/// Noise standard deviation that puts `power / σ²` at the target SNR.
pub fn noise_sigma(power: f64, snr_db: f64) -> f64 {
    (power / 10f64.powf(snr_db / 10.0)).sqrt()
}

/// Add zero-mean white Gaussian noise calibrated for `snr_db`.
///
/// The caller must have rejected zero-power signals; with `power == 0`
/// this returns the input unchanged.
pub fn add_white_noise<R: Rng>(
    signal: &Array2<f64>,
    snr_db: f64,
    rng: &mut R,
) -> Array2<f64> {
    let sigma = noise_sigma(signal_power(signal), snr_db);
    if sigma <= 0.0 || !sigma.is_finite() {
        return signal.clone();
    }
    signal.mapv(|v| {
        let n: f64 = rng.sample(StandardNormal);
        v + n * sigma
    })
}

// ── Projection ────────────────────────────────────────────────────────────

/// Project weighted source activity to sensor space and normalize both
/// views.
///
/// * `source` — `(time, regions)` raw source activity;
/// * `fwd` — `(sensors, regions)` forward operator;
/// * `active` / `weights` — region ids driving this sample and their
///   patch weights, aligned index-for-index;
/// * `snr_db` — sensor-space noise target;
/// * `index` — absolute sample index, for error attribution only.
///
/// Returns `(eeg, source)`: `eeg` is `(time, sensors)` in `[-1, 1]`,
/// `source` is `(time, regions)` in `[0, 1]` with every non-active column
/// exactly zero.
pub fn project<R: Rng>(
    source: &Array2<f64>,
    fwd: &Array2<f64>,
    active: &[usize],
    weights: &[f64],
    snr_db: f64,
    index: usize,
    rng: &mut R,
) -> Result<(Array2<f64>, Array2<f64>)> {
    let (n_time, n_regions) = source.dim();
    if fwd.ncols() != n_regions {
        return Err(ExtractError::ShapeMismatch {
            field: "forward",
            shape: fwd.shape().to_vec(),
            detail: format!("forward matrix wants {} regions, clip has {n_regions}", fwd.ncols()),
        });
    }

    // 1–2. Keep only the active columns, scaled by their patch weight.
    let mut weighted = Array2::<f64>::zeros((n_time, n_regions));
    for (&region, &w) in active.iter().zip(weights) {
        if region < n_regions {
            let col = source.column(region).mapv(|v| v * w);
            weighted.column_mut(region).assign(&col);
        }
    }

    // 3. Clean sensor signal.
    let mut eeg = weighted.dot(&fwd.t()); // (time, sensors)

    // 4. Mean-center each sensor over time.
    if let Some(means) = eeg.mean_axis(Axis(0)) {
        eeg -= &means;
    }

    // 5. Calibrated additive noise.
    let power = signal_power(&eeg);
    if power <= 0.0 || !power.is_finite() {
        return Err(ExtractError::DegenerateSample { index });
    }
    let mut noisy = add_white_noise(&eeg, snr_db, rng);

    // 6. Per-sample max-abs normalization into [-1, 1].
    let max_abs = noisy.iter().fold(0.0_f64, |m, &v| m.max(v.abs()));
    if max_abs > 0.0 {
        noisy.mapv_inplace(|v| v / max_abs);
    }

    // 7. Min-max over active-column values only → [0, 1]; non-active
    //    columns stay exactly zero.
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for &region in active {
        if region < n_regions {
            for &v in weighted.column(region) {
                lo = lo.min(v);
                hi = hi.max(v);
            }
        }
    }
    if hi > lo {
        let range = hi - lo;
        for &region in active {
            if region < n_regions {
                weighted
                    .column_mut(region)
                    .mapv_inplace(|v| (v - lo) / range);
            }
        }
    } else {
        // Constant active values carry no waveform; drop them to zero so
        // the output keeps its documented range.
        for &region in active {
            if region < n_regions {
                weighted.column_mut(region).fill(0.0);
            }
        }
    }

    Ok((noisy, weighted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mat::MatVar;
    use approx::assert_abs_diff_eq;
    use ndarray::{ArrayD, IxDyn};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(17)
    }

    fn ramp_source(t: usize, r: usize) -> Array2<f64> {
        Array2::from_shape_fn((t, r), |(i, j)| ((i + 1) * (j + 1)) as f64)
    }

    #[test]
    fn inactive_columns_are_exactly_zero() {
        let source = ramp_source(50, 5);
        let fwd = Array2::from_shape_fn((3, 5), |(i, j)| (i + j) as f64 * 0.1 + 0.05);
        let (_eeg, src) =
            project(&source, &fwd, &[1, 3], &[1.0, 0.5], 10.0, 0, &mut rng()).unwrap();
        for region in [0usize, 2, 4] {
            for &v in src.column(region) {
                assert_eq!(v, 0.0, "region {region} leaked into the output");
            }
        }
        // Active columns carry signal.
        assert!(src.column(1).iter().any(|&v| v != 0.0));
    }

    #[test]
    fn outputs_stay_in_documented_ranges() {
        let source = ramp_source(200, 4);
        let fwd = Array2::from_shape_fn((6, 4), |(i, j)| ((i * 4 + j) as f64).sin());
        let (eeg, src) =
            project(&source, &fwd, &[0, 2], &[1.0, 0.8], 5.0, 3, &mut rng()).unwrap();
        for &v in eeg.iter() {
            assert!((-1.0..=1.0).contains(&v), "eeg value {v} out of range");
        }
        for &v in src.iter() {
            assert!((0.0..=1.0).contains(&v), "source value {v} out of range");
        }
        // max-abs normalization touches the boundary
        let max = eeg.iter().fold(0.0_f64, |m, &v| m.max(v.abs()));
        assert_abs_diff_eq!(max, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn all_zero_source_is_degenerate() {
        let source = Array2::zeros((50, 4));
        let fwd = Array2::from_elem((3, 4), 1.0);
        let err = project(&source, &fwd, &[1], &[1.0], 10.0, 7, &mut rng()).unwrap_err();
        assert!(matches!(err, ExtractError::DegenerateSample { index: 7 }));
    }

    #[test]
    fn empty_active_set_is_degenerate() {
        let source = ramp_source(20, 3);
        let fwd = Array2::from_elem((2, 3), 1.0);
        let err = project(&source, &fwd, &[], &[], 10.0, 1, &mut rng()).unwrap_err();
        assert!(matches!(err, ExtractError::DegenerateSample { .. }));
    }

    #[test]
    fn weights_scale_active_columns() {
        // Two identical ramps, weights 1.0 and 0.5: the min-max runs over
        // both active columns, so the down-weighted one peaks below 0.5.
        let source = Array2::from_shape_fn((10, 2), |(i, _)| (i + 1) as f64);
        let fwd = Array2::from_elem((1, 2), 1.0);
        let (_e, src) =
            project(&source, &fwd, &[0, 1], &[1.0, 0.5], 40.0, 0, &mut rng()).unwrap();
        // lo = 0.5, hi = 10 over the weighted values
        assert_abs_diff_eq!(src[[9, 0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(src[[9, 1]], (5.0 - 0.5) / 9.5, epsilon = 1e-12);
        assert_abs_diff_eq!(src[[0, 1]], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn snr_calibration_matches_definition() {
        // Measured noise power must equal clean power / 10^(snr/10).
        let clean = Array2::from_shape_fn((400, 60), |(i, j)| {
            ((i as f64) * 0.21 + (j as f64) * 1.3).sin() * 4.0
        });
        let snr_db = 10.0;
        let mut r = rng();
        let noisy = add_white_noise(&clean, snr_db, &mut r);
        let noise = &noisy - &clean;
        let ratio = signal_power(&clean) / signal_power(&noise);
        let target = 10f64.powf(snr_db / 10.0);
        // 24 000 samples → a few percent of statistical jitter.
        assert!(
            (ratio - target).abs() / target < 0.05,
            "power ratio {ratio:.3} vs target {target:.3}"
        );
    }

    #[test]
    fn noise_sigma_formula() {
        assert_abs_diff_eq!(noise_sigma(4.0, 0.0), 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(noise_sigma(1.0, 20.0), 0.1, epsilon = 1e-12);
    }

    #[test]
    fn forward_lookup_tries_names_in_order() {
        let mut file = MatFile::default();
        let arr = ArrayD::from_shape_vec(IxDyn(&[2, 3]), vec![1.0; 6]).unwrap();
        file.vars.insert("leadfield".into(), MatVar::Array(arr));
        let fwd = find_forward_matrix(&file, Path::new("fwd.mat")).unwrap();
        assert_eq!(fwd.dim(), (2, 3));
    }

    #[test]
    fn forward_lookup_reports_candidates() {
        let mut file = MatFile::default();
        file.vars.insert("lf".into(), MatVar::Scalar(0.0));
        let err = find_forward_matrix(&file, Path::new("fwd.mat")).unwrap_err();
        match err {
            ExtractError::ForwardModelNotFound { found, .. } => {
                assert_eq!(found, vec!["lf".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
