//! # spikeeg — labeled synthetic-EEG sample extraction
//!
//! `spikeeg` turns simulated cortical spike activity into labeled
//! sensor-space EEG training samples.  It reads the heterogeneous
//! MATLAB/Octave files produced by the simulation pipeline — three
//! mutually incompatible encodings, several generations of metadata
//! layout — projects source activity through a forward (leadfield) model,
//! injects SNR-calibrated noise, and writes one normalized, labeled MAT
//! file per sample.
//!
//! ## Pipeline overview
//!
//! ```text
//! train_sample_source1.mat
//!   │
//!   ├─ mat::load_mat()        v5 │ HDF5 (v7.3) │ Octave text — first match wins
//!   ├─ meta::DatasetMeta      rank/NaN/padding skew resolved once at load
//!   │        │  (per sample)
//!   ├─ clips::ClipPool        nmm_idx mod pool_len → a?/nmm_?.mat, shape-fitted
//!   ├─ project::project()     · fwdᵀ → mean-center → +noise @ SNR → normalize
//!   └─ extract::ExtractJob    sample_{index:05}.mat × N + extraction_metadata.mat
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use spikeeg::{ExtractConfig, ExtractJob};
//!
//! let job = ExtractJob {
//!     dataset: "source/train_sample_source1.mat".into(),
//!     clip_root: "source/nmm_spikes".into(),
//!     forward_model: "anatomy/leadfield_75_20k.mat".into(),
//!     output_dir: "output/labeled_spikes_data".into(),
//!     start_index: 0,
//!     count: Some(100),
//!     config: ExtractConfig::default(),
//! };
//! let summary = job.run().unwrap();
//! println!("{} of {} samples extracted", summary.succeeded, summary.attempted);
//! ```
//!
//! ## Failure model
//!
//! A malformed clip, a degenerate all-zero source, or one bad metadata
//! record skips that sample and the batch keeps going; only run-level
//! problems (unreadable metadata, no forward matrix, empty clip pool)
//! abort.  See [`error::ExtractError`] for the full taxonomy.

pub mod clips;
pub mod config;
pub mod error;
pub mod extract;
pub mod mat;
pub mod meta;
pub mod project;

// ── Crate-root re-exports ─────────────────────────────────────────────────
//
// Everything a downstream user is likely to need is available directly as
// `spikeeg::Foo` without having to know the internal module layout.

// config
pub use config::ExtractConfig;

// error
pub use error::ExtractError;

// mat — polymorphic loader, value types, output writer
pub use mat::{load_mat, v5::write_mat5, MatFile, MatVar};

// meta
pub use meta::{DatasetMeta, SampleMeta, SourceSlot};

// clips
pub use clips::{ClipEntry, ClipPool};

// project
pub use project::{
    add_white_noise, find_forward_matrix, noise_sigma, project, signal_power, FORWARD_NAMES,
};

// extract
pub use extract::{sample_filename, ExtractJob, RunSummary};
