//! Spike-clip pool: enumeration, cycling resolution, and clip loading.
//!
//! The simulation pipeline physically generates far fewer spike clips than
//! the metadata references: `nmm_idx` ranges over tens of thousands while
//! the pool holds a handful of files per group directory
//! (`a0/nmm_1.mat`, `a0/nmm_2.mat`, `a1/nmm_1.mat`, …).  The pool maps any
//! clip index onto the finite file list with a modulo rule, so resolution
//! is total and reproducible: `resolve(k)` and `resolve(k + pool_len)`
//! name the same file forever.
//!
//! [`ClipPool`] owns the directory listing, built exactly once per batch
//! run; nothing here caches behind the caller's back.
use std::path::{Path, PathBuf};

use ndarray::{s, Array2, Axis};
use tracing::{debug, info};

use crate::config::ExtractConfig;
use crate::error::{ExtractError, Result};
use crate::mat::{load_mat, MatVar};

// ── Pool ──────────────────────────────────────────────────────────────────

/// One clip file in the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipEntry {
    /// Group directory name (e.g. `a0`).
    pub group: String,
    /// File path on disk.
    pub path: PathBuf,
}

/// The enumerated spike-clip pool for one extraction run.
#[derive(Debug, Clone)]
pub struct ClipPool {
    entries: Vec<ClipEntry>,
    clip_samples: usize,
}

impl ClipPool {
    /// List every clip under each group directory of `root`.
    ///
    /// Groups are visited in natural order (`a0`, `a1`, `a2`, …, `a10`)
    /// and files within a group in natural order of their numeric suffix
    /// (`nmm_1`, `nmm_2`, …, `nmm_13`), so the pool index of a clip is
    /// stable across runs on the same tree.  An empty pool is fatal: every
    /// sample of the run would fail.
    pub fn scan<P: AsRef<Path>>(root: P, cfg: &ExtractConfig) -> Result<Self> {
        let root = root.as_ref();
        let mut groups: Vec<PathBuf> = std::fs::read_dir(root)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        groups.sort_by_key(|p| natural_key(&name_of(p)));

        let mut entries = Vec::new();
        for group_dir in &groups {
            let group = name_of(group_dir);
            let mut files: Vec<PathBuf> = std::fs::read_dir(group_dir)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file())
                .collect();
            files.sort_by_key(|p| natural_key(&name_of(p)));
            for path in files {
                entries.push(ClipEntry { group: group.clone(), path });
            }
        }

        if entries.is_empty() {
            return Err(ExtractError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("clip pool {} contains no files", root.display()),
            )));
        }
        info!(
            pool = entries.len(),
            groups = groups.len(),
            root = %root.display(),
            "spike-clip pool enumerated"
        );
        Ok(Self { entries, clip_samples: cfg.clip_samples })
    }

    /// Number of physically available clips.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deterministic cycling rule: any non-negative clip index resolves to
    /// a pool entry.
    pub fn resolve(&self, nmm_index: usize) -> &ClipEntry {
        &self.entries[nmm_index % self.entries.len()]
    }

    /// Load the clip for `nmm_index` and conform it to
    /// `(clip_samples, n_regions)`.
    ///
    /// Region columns beyond `n_regions` are dropped, missing ones are
    /// zero-filled; the time axis is decimated when it is an exact
    /// multiple of the target length and linearly resampled otherwise.
    pub fn load(&self, nmm_index: usize, n_regions: usize) -> Result<Array2<f64>> {
        let entry = self.resolve(nmm_index);
        let file = load_mat(&entry.path).map_err(|e| match e {
            // Listed at scan time but gone now: the directory changed
            // under us, which skips this one sample, not the batch.
            ExtractError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                ExtractError::ClipNotFound { path: entry.path.clone() }
            }
            other => other,
        })?;

        let clip = match file.get("data") {
            Some(MatVar::Array(a)) if a.ndim() == 2 => a
                .clone()
                .into_dimensionality::<ndarray::Ix2>()
                .expect("rank checked"),
            Some(MatVar::Array(a)) if a.ndim() == 1 => {
                // Single-region clip: treat as one column.
                let n = a.len();
                Array2::from_shape_vec((n, 1), a.iter().copied().collect())
                    .expect("length matches")
            }
            Some(other) => {
                return Err(ExtractError::ShapeMismatch {
                    field: "data",
                    shape: other.as_array().map(|a| a.shape().to_vec()).unwrap_or_default(),
                    detail: format!("clip {} is not a (time, regions) matrix", entry.path.display()),
                })
            }
            None => {
                return Err(ExtractError::ShapeMismatch {
                    field: "data",
                    shape: vec![],
                    detail: format!("clip {} has no 'data' variable", entry.path.display()),
                })
            }
        };

        Ok(self.fit(clip, n_regions))
    }

    /// Conform a raw clip to `(clip_samples, n_regions)`.
    fn fit(&self, clip: Array2<f64>, n_regions: usize) -> Array2<f64> {
        let (t, r) = clip.dim();

        let clip = if r == n_regions {
            clip
        } else if r > n_regions {
            debug!(have = r, want = n_regions, "truncating clip region axis");
            clip.slice(s![.., ..n_regions]).to_owned()
        } else {
            debug!(have = r, want = n_regions, "zero-padding clip region axis");
            let mut padded = Array2::zeros((t, n_regions));
            padded.slice_mut(s![.., ..r]).assign(&clip);
            padded
        };

        let t = clip.nrows();
        if t == self.clip_samples {
            clip
        } else if t > self.clip_samples && t % self.clip_samples == 0 {
            let step = t / self.clip_samples;
            debug!(from = t, to = self.clip_samples, step, "decimating clip time axis");
            clip.slice(s![..;step, ..]).to_owned()
        } else {
            debug!(from = t, to = self.clip_samples, "linearly resampling clip time axis");
            resample_linear(&clip, self.clip_samples)
        }
    }
}

/// Linear time-axis resampling, column by column.
fn resample_linear(clip: &Array2<f64>, target: usize) -> Array2<f64> {
    let (t, r) = clip.dim();
    let mut out = Array2::zeros((target, r));
    if t == 0 || target == 0 {
        return out;
    }
    if t == 1 {
        for mut row in out.axis_iter_mut(Axis(0)) {
            row.assign(&clip.row(0));
        }
        return out;
    }
    for j in 0..target {
        let pos = if target == 1 {
            0.0
        } else {
            j as f64 * (t - 1) as f64 / (target - 1) as f64
        };
        let lo = pos.floor() as usize;
        let hi = (lo + 1).min(t - 1);
        let frac = pos - lo as f64;
        for c in 0..r {
            out[[j, c]] = clip[[lo, c]] * (1.0 - frac) + clip[[hi, c]] * frac;
        }
    }
    out
}

/// Natural sort key: trailing digit run parsed numerically, so `a2` sorts
/// before `a10` and `nmm_9` before `nmm_13`.
fn natural_key(name: &str) -> (String, u64) {
    let stem = name.split('.').next().unwrap_or(name);
    let digits: String = stem
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    let prefix = stem[..stem.len() - digits.len()].to_string();
    (prefix, digits.parse().unwrap_or(0))
}

fn name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
