//! Batch extraction driver.
//!
//! Loads the immutable run inputs once (forward model, dataset metadata,
//! clip-pool listing), then walks a contiguous index range.  Every
//! per-sample failure is caught at the loop boundary, logged with its
//! index, counted, and the batch moves on; only the up-front loads can
//! abort a run.  Output files are numbered by absolute dataset index, so
//! a resumed or partial run writes exactly the same filenames for the
//! same samples.
use std::path::{Path, PathBuf};

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::clips::ClipPool;
use crate::config::ExtractConfig;
use crate::error::{ExtractError, Result};
use crate::mat::{load_mat, v5::write_mat5, MatVar};
use crate::meta::DatasetMeta;
use crate::project::{find_forward_matrix, project};

// ── Job description ───────────────────────────────────────────────────────

/// Everything one extraction run needs.  Construct, then [`run`](Self::run).
#[derive(Debug, Clone)]
pub struct ExtractJob {
    /// Dataset metadata file (any supported matrix encoding).
    pub dataset: PathBuf,
    /// Root of the spike-clip group directories.
    pub clip_root: PathBuf,
    /// Forward-model (leadfield) file.
    pub forward_model: PathBuf,
    /// Directory for `sample_*.mat` outputs and the run summary.
    pub output_dir: PathBuf,
    /// First dataset index to extract.
    pub start_index: usize,
    /// Number of samples to extract; `None` means "through the end".
    pub count: Option<usize>,
    pub config: ExtractConfig,
}

/// Aggregate result of a run, also persisted as `extraction_metadata.mat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub start_index: usize,
}

/// Output filename for an absolute dataset index.
pub fn sample_filename(index: usize) -> String {
    format!("sample_{index:05}.mat")
}

impl ExtractJob {
    /// Run the batch.
    ///
    /// Fatal errors (unreadable metadata, missing forward matrix, empty
    /// clip pool, unwritable output directory) abort before any sample is
    /// attempted.  Everything after that is per-sample: the returned
    /// summary reports partial success instead of failing the run.
    pub fn run(&self) -> Result<RunSummary> {
        let fwd_file = load_mat(&self.forward_model)?;
        let fwd = find_forward_matrix(&fwd_file, &self.forward_model)?;
        info!(
            sensors = fwd.nrows(),
            regions = fwd.ncols(),
            path = %self.forward_model.display(),
            "forward model loaded"
        );

        let meta = DatasetMeta::open(&self.dataset, &self.config)?;
        info!(samples = meta.len(), path = %self.dataset.display(), "dataset metadata loaded");

        let pool = ClipPool::scan(&self.clip_root, &self.config)?;
        std::fs::create_dir_all(&self.output_dir)?;

        let requested = self.count.unwrap_or(meta.len());
        let end = (self.start_index + requested).min(meta.len());
        let mut summary = RunSummary {
            attempted: end.saturating_sub(self.start_index),
            succeeded: 0,
            failed: 0,
            start_index: self.start_index,
        };

        for index in self.start_index..end {
            match self.extract_one(index, &meta, &pool, &fwd) {
                Ok(()) => summary.succeeded += 1,
                Err(e) => {
                    warn!(index, error = %e, "sample failed; continuing batch");
                    summary.failed += 1;
                }
            }
        }

        self.write_summary(&summary, &fwd)?;
        info!(
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "extraction finished"
        );
        Ok(summary)
    }

    /// Steps 2–4 of the pipeline for one index: resolve metadata, resolve
    /// and combine clips, project, persist.
    fn extract_one(
        &self,
        index: usize,
        meta: &DatasetMeta,
        pool: &ClipPool,
        fwd: &Array2<f64>,
    ) -> Result<()> {
        let sm = meta.sample(index)?;
        let n_regions = fwd.ncols();
        let n_time = self.config.clip_samples;

        // Combine all usable source slots into one source matrix.  Each
        // slot contributes its clip's center-region waveform, peak-scaled
        // to the slot's amplitude, written into every region of the patch.
        let mut source = Array2::<f64>::zeros((n_time, n_regions));
        let mut active: Vec<usize> = Vec::new();
        let mut weights: Vec<f64> = Vec::new();

        for (slot_no, slot) in sm.sources.iter().enumerate() {
            let clip = pool.load(slot.nmm_index, n_regions)?;

            // Region ids past the forward matrix are padding from a
            // mismatched anatomy; drop them rather than projecting junk.
            let usable: Vec<(usize, f64)> = slot
                .regions
                .iter()
                .zip(&slot.weights)
                .filter(|(&r, _)| r < n_regions)
                .map(|(&r, &w)| (r, w))
                .collect();
            let Some(&(center, _)) = usable.first() else {
                debug!(index, slot_no, "slot has no region inside the forward model");
                continue;
            };

            let center_sig = clip.column(center);
            let peak = center_sig.iter().fold(f64::NEG_INFINITY, |m, &v| m.max(v));
            if !(peak > 0.0) {
                debug!(index, slot_no, "center waveform has no positive peak; slot skipped");
                continue;
            }
            let scaled = center_sig.mapv(|v| v / peak * slot.scale);

            for (region, weight) in usable {
                // Overlapping patches: waveforms add, first weight wins.
                if !active.contains(&region) {
                    active.push(region);
                    weights.push(weight);
                }
                let mut col = source.column_mut(region);
                col += &scaled;
            }
        }

        if active.is_empty() {
            return Err(ExtractError::DegenerateSample { index });
        }

        let mut rng = self.sample_rng(index);
        let (eeg, source_norm) =
            project(&source, fwd, &active, &weights, sm.snr_db, index, &mut rng)?;

        let out_path = self.output_dir.join(sample_filename(index));
        write_mat5(
            &out_path,
            &[
                ("eeg_data", MatVar::Array(eeg.into_dyn())),
                ("source_data", MatVar::Array(source_norm.into_dyn())),
                ("labels", MatVar::Array(sm.labels.into_dyn())),
                ("snr", MatVar::Scalar(sm.snr_db)),
                ("index", MatVar::Scalar(index as f64)),
            ],
        )?;
        Ok(())
    }

    /// Per-sample RNG: independent per index when seeded, so disjoint
    /// ranges of a resumed run reproduce the same noise.
    fn sample_rng(&self, index: usize) -> StdRng {
        match self.config.seed {
            Some(seed) => {
                StdRng::seed_from_u64(seed ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
            }
            None => StdRng::from_entropy(),
        }
    }

    fn write_summary(&self, summary: &RunSummary, fwd: &Array2<f64>) -> Result<()> {
        let shape = Array2::from_shape_vec(
            (1, 2),
            vec![fwd.nrows() as f64, fwd.ncols() as f64],
        )
        .expect("static shape");
        let path = self.output_dir.join("extraction_metadata.mat");
        write_mat5(
            &path,
            &[
                ("attempted", MatVar::Scalar(summary.attempted as f64)),
                ("total_extracted", MatVar::Scalar(summary.succeeded as f64)),
                ("failed", MatVar::Scalar(summary.failed as f64)),
                ("start_index", MatVar::Scalar(summary.start_index as f64)),
                ("dataset_path", MatVar::Text(self.dataset.display().to_string())),
                (
                    "forward_model_path",
                    MatVar::Text(self.forward_model.display().to_string()),
                ),
                ("forward_matrix_shape", MatVar::Array(shape.into_dyn())),
            ],
        )?;
        Ok(())
    }
}
