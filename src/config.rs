//! Tunable parameters for every stage of the pipeline.
//!
//! All structs deserialize from JSON with per-field defaults, so a config file
//! only needs to mention the values it overrides.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::error::{RecognitionError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    /// Upper bound on keypoints kept per image, strongest first.
    pub max_features: usize,
    /// FAST-9 intensity threshold.
    pub fast_threshold: u8,
    /// Number of pyramid levels (1 = original size only).
    pub pyramid_levels: u32,
    /// Downscale factor between pyramid levels.
    pub scale_factor: f32,
    /// Gaussian sigma applied before sampling descriptor tests.
    pub smoothing_sigma: f32,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            max_features: 500,
            fast_threshold: 20,
            pyramid_levels: 3,
            scale_factor: 1.2,
            smoothing_sigma: 1.2,
        }
    }
}

impl FingerprintConfig {
    /// Digest identifying this parameterization. Fingerprints are only
    /// comparable (and cacheable) between identical digests.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(crate::fingerprint::DESCRIPTOR_PATTERN_SEED.to_le_bytes());
        hasher.update((self.max_features as u64).to_le_bytes());
        hasher.update([self.fast_threshold]);
        hasher.update(self.pyramid_levels.to_le_bytes());
        hasher.update(self.scale_factor.to_le_bytes());
        hasher.update(self.smoothing_sigma.to_le_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    pub blur_sigma: f32,
    pub canny_low: f32,
    pub canny_high: f32,
    /// Sigma of the Gaussian window used as the local mean.
    pub adaptive_sigma: f32,
    /// A pixel is marked when it is darker than its local mean by more than this.
    pub adaptive_offset: i16,
    pub open_radius: u8,
    pub close_radius: u8,
    /// Largest contours considered, by area.
    pub max_candidates: usize,
    /// Minimum region area as a fraction of the photo area.
    pub min_area_fraction: f64,
    /// Douglas-Peucker tolerance as a fraction of the contour perimeter.
    pub approx_epsilon: f64,
    pub min_vertices: usize,
    pub max_vertices: usize,
    pub min_aspect: f64,
    pub max_aspect: f64,
    /// Candidates overlapping an accepted region above this IoU are dropped.
    pub duplicate_iou: f64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            blur_sigma: 1.0,
            canny_low: 30.0,
            canny_high: 100.0,
            adaptive_sigma: 3.0,
            adaptive_offset: 2,
            open_radius: 1,
            close_radius: 1,
            max_candidates: 15,
            min_area_fraction: 0.03,
            approx_epsilon: 0.03,
            min_vertices: 4,
            max_vertices: 6,
            min_aspect: 1.1,
            max_aspect: 2.2,
            duplicate_iou: 0.7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Lowe's ratio: best distance must be below `ratio * second_best`.
    pub ratio: f32,
    /// Absolute Hamming distance ceiling for the best neighbour (of 256 bits).
    pub max_distance: u32,
    /// Top score must be at least this multiple of the runner-up.
    pub ambiguity_ratio: f32,
    pub min_score: u32,
    pub top_k: usize,
    /// References scored per batch before pruning.
    pub batch_size: usize,
    /// Candidates retained from each batch.
    pub batch_keep: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            ratio: 0.75,
            max_distance: 64,
            ambiguity_ratio: 1.2,
            min_score: 10,
            top_k: 10,
            batch_size: 20,
            batch_keep: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Where snapshot artifacts live. `None` uses the platform cache dir.
    pub cache_dir: Option<PathBuf>,
    /// Snapshots older than this are rebuilt regardless of signature.
    pub max_age_days: i64,
    /// Read and write snapshots. When false every load is a full in-memory build.
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            max_age_days: 30,
            enabled: true,
        }
    }
}

impl CacheConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        match &self.cache_dir {
            Some(dir) => dir.clone(),
            None => dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("card-match"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionMode {
    /// Fingerprint the whole photo as one card.
    SingleCard,
    /// Segment the photo into card regions first.
    #[default]
    MultiCard,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub mode: RecognitionMode,
    pub fingerprint: FingerprintConfig,
    pub segment: SegmentConfig,
    pub matching: MatchConfig,
    pub cache: CacheConfig,
}

impl PipelineConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| RecognitionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| RecognitionError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let m = &self.matching;
        if !(0.0..=1.0).contains(&m.ratio) {
            return Err(RecognitionError::Config(format!("ratio must be in [0, 1], got {}", m.ratio)));
        }
        if m.ambiguity_ratio < 1.0 {
            return Err(RecognitionError::Config(format!(
                "ambiguity_ratio must be >= 1, got {}",
                m.ambiguity_ratio
            )));
        }
        if m.top_k == 0 || m.batch_size == 0 || m.batch_keep == 0 {
            return Err(RecognitionError::Config("top_k, batch_size and batch_keep must be positive".into()));
        }
        let f = &self.fingerprint;
        if f.max_features < 2 || f.pyramid_levels == 0 || f.scale_factor <= 1.0 {
            return Err(RecognitionError::Config(
                "max_features >= 2, pyramid_levels >= 1 and scale_factor > 1 are required".into(),
            ));
        }
        let s = &self.segment;
        if f.smoothing_sigma <= 0.0 || s.blur_sigma <= 0.0 || s.adaptive_sigma <= 0.0 {
            return Err(RecognitionError::Config("blur sigmas must be positive".into()));
        }
        if s.min_aspect > s.max_aspect || s.min_vertices > s.max_vertices {
            return Err(RecognitionError::Config("segment bounds are inverted".into()));
        }
        Ok(())
    }
}

/// Run-level settings handed over by the command line.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub reference_root: PathBuf,
    pub output_root: Option<PathBuf>,
    pub metadata_db: Option<PathBuf>,
    pub worker_count: usize,
    pub use_cache: bool,
    pub verbose: bool,
}

impl BatchConfig {
    pub fn new(reference_root: impl Into<PathBuf>) -> Self {
        Self {
            reference_root: reference_root.into(),
            output_root: None,
            metadata_db: None,
            worker_count: 4,
            use_cache: true,
            verbose: false,
        }
    }

    /// Default tracing filter when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "card_match=debug"
        } else {
            "card_match=info"
        }
    }
}
