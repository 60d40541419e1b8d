//! verify: re-open extracted samples and check their invariants.
//!
//! Reads every `sample_*.mat` in a directory through the same polymorphic
//! loader the pipeline uses and checks:
//!   - the required variables are present,
//!   - `eeg_data` is within [-1, 1],
//!   - `source_data` is within [0, 1],
//!   - every region not named by `labels` is all-zero in `source_data`.
//!
//! Exits non-zero if any file fails a check.
use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};

use spikeeg::{load_mat, ExtractConfig, MatFile};

#[derive(Parser)]
#[command(name = "verify", about = "Verify extracted labeled-EEG samples")]
struct Args {
    /// Directory containing sample_*.mat files
    #[arg(long, default_value = "output/labeled_spikes_data")]
    data_dir: PathBuf,

    /// Region ids at/above this value are padding
    #[arg(long, default_value_t = 10000.0)]
    padding_threshold: f64,

    /// Print per-file details, not just failures
    #[arg(long)]
    verbose: bool,
}

const REQUIRED: [&str; 5] = ["eeg_data", "source_data", "labels", "snr", "index"];

fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = ExtractConfig {
        padding_threshold: args.padding_threshold,
        ..ExtractConfig::default()
    };

    let mut files: Vec<PathBuf> = std::fs::read_dir(&args.data_dir)
        .with_context(|| format!("listing {}", args.data_dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("sample_") && n.ends_with(".mat"))
        })
        .collect();
    files.sort();
    anyhow::ensure!(!files.is_empty(), "no sample_*.mat files in {}", args.data_dir.display());

    let mut passed = 0usize;
    let mut failed = 0usize;
    for path in &files {
        match check_sample(path, &cfg) {
            Ok(report) => {
                passed += 1;
                if args.verbose {
                    println!("OK   {}: {report}", path.display());
                }
            }
            Err(e) => {
                failed += 1;
                println!("FAIL {}: {e:#}", path.display());
            }
        }
    }

    println!("{passed} passed, {failed} failed of {} files", files.len());
    anyhow::ensure!(failed == 0, "{failed} sample file(s) failed verification");
    Ok(())
}

fn check_sample(path: &Path, cfg: &ExtractConfig) -> Result<String> {
    let file = load_mat(path)?;
    for name in REQUIRED {
        anyhow::ensure!(file.get(name).is_some(), "missing variable '{name}'");
    }

    let eeg = array2(&file, "eeg_data")?;
    let source = array2(&file, "source_data")?;
    let labels = file
        .get("labels")
        .and_then(|v| v.as_array())
        .context("'labels' is not an array")?;

    let (eeg_lo, eeg_hi) = min_max(eeg.iter().copied());
    anyhow::ensure!(
        eeg_lo >= -1.0 - 1e-9 && eeg_hi <= 1.0 + 1e-9,
        "eeg_data range [{eeg_lo:.4}, {eeg_hi:.4}] outside [-1, 1]"
    );

    let (src_lo, src_hi) = min_max(source.iter().copied());
    anyhow::ensure!(
        src_lo >= -1e-9 && src_hi <= 1.0 + 1e-9,
        "source_data range [{src_lo:.4}, {src_hi:.4}] outside [0, 1]"
    );

    // Zeroing invariant: only labeled (non-padding) regions may be
    // non-zero in the source output.
    let active: Vec<usize> = labels
        .iter()
        .filter(|&&v| v.is_finite() && !cfg.is_padding(v))
        .map(|&v| v as usize)
        .collect();
    for (region, col) in source.columns().into_iter().enumerate() {
        if !active.contains(&region) {
            anyhow::ensure!(
                col.iter().all(|&v| v == 0.0),
                "unlabeled region {region} has non-zero source values"
            );
        }
    }

    Ok(format!(
        "eeg {:?} in [{eeg_lo:.3}, {eeg_hi:.3}], {} active regions",
        eeg.dim(),
        active.len()
    ))
}

fn array2(file: &MatFile, name: &str) -> Result<ndarray::Array2<f64>> {
    file.get(name)
        .and_then(|v| v.as_array())
        .with_context(|| format!("'{name}' is not an array"))?
        .clone()
        .into_dimensionality()
        .with_context(|| format!("'{name}' is not 2-D"))
}

fn min_max(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    })
}
