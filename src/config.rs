//! Extraction configuration.
//!
//! [`ExtractConfig`] holds every tunable constant of the pipeline.  The
//! defaults reproduce the reference datasets; override individual fields
//! with struct-update syntax when a dataset version deviates.

/// Configuration for one extraction run.
///
/// All fields are `pub` so you can construct one with struct-update syntax:
///
/// ```
/// use spikeeg::ExtractConfig;
///
/// let cfg = ExtractConfig {
///     padding_threshold: 20000.0,  // newer dataset uses a larger sentinel
///     ..ExtractConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ExtractConfig {
    /// Substitute amplitude scale used when a sample's `scale_ratio` is NaN.
    ///
    /// NaN scale ratios are expected for the majority of records in some
    /// dataset versions; substitution is logged but is never an error.
    ///
    /// Default: `30.0`.
    pub default_scale: f64,

    /// Region-id values at or above this threshold are padding.
    ///
    /// Together with negative values this covers the two padding
    /// conventions seen across dataset versions (`-1` fill and the `15213`
    /// sentinel written by the Octave post-processing).  The threshold is
    /// an empirical constant from one dataset generation, not a format
    /// guarantee, which is why it lives here and not in the code.
    ///
    /// Default: `10000.0`.
    pub padding_threshold: f64,

    /// Sensor-space SNR in dB used when the metadata has no `current_snr`
    /// field, or when the stored value is NaN.
    ///
    /// Default: `20.0`.
    pub default_snr_db: f64,

    /// Time samples every spike clip is conformed to before projection.
    ///
    /// Clips whose length is an exact multiple are decimated; anything
    /// else is linearly resampled.
    ///
    /// Default: `500`.
    pub clip_samples: usize,

    /// Base seed for the sensor-noise generator.
    ///
    /// When set, the per-sample RNG is derived from this seed and the
    /// absolute sample index, so a resumed run regenerates bit-identical
    /// noise for every index.  `None` draws from OS entropy.
    ///
    /// Default: `None`.
    pub seed: Option<u64>,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            default_scale: 30.0,
            padding_threshold: 10000.0,
            default_snr_db: 20.0,
            clip_samples: 500,
            seed: None,
        }
    }
}

impl ExtractConfig {
    /// Padding predicate for region-id and weight vectors.
    ///
    /// A value is padding when it is negative or at/above
    /// [`padding_threshold`](Self::padding_threshold).
    ///
    /// # Examples
    ///
    /// ```
    /// use spikeeg::ExtractConfig;
    /// let cfg = ExtractConfig::default();
    /// assert!(cfg.is_padding(-1.0));
    /// assert!(cfg.is_padding(15213.0));
    /// assert!(!cfg.is_padding(0.0));
    /// assert!(!cfg.is_padding(993.0));
    /// ```
    #[inline]
    pub fn is_padding(&self, v: f64) -> bool {
        v < 0.0 || v >= self.padding_threshold
    }
}
