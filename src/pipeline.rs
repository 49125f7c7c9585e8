//! Per-photo recognition: optional segmentation, fingerprinting, ranking.

use image::GrayImage;
use serde::{Serialize, Serializer};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{PipelineConfig, RecognitionMode};
use crate::error::Result;
use crate::fingerprint::{load_grayscale, Fingerprinter};
use crate::matcher::{DescriptorMatcher, MatchResult, Ranking};
use crate::reference::ReferenceSet;
use crate::segment::{CardRegion, Segmenter};

/// What became of one region (or of the whole photo in single-card mode).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum RegionVerdict {
    Matched,
    /// Top two candidates scored too close together to name either.
    Ambiguous { best: u32, runner_up: u32 },
    NoMatch,
    /// Too little texture to fingerprint.
    Unmatchable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionRecognition {
    /// `None` in single-card mode.
    pub region: Option<CardRegion>,
    #[serde(flatten)]
    pub verdict: RegionVerdict,
    /// Best first; empty unless the verdict is `Matched`.
    pub matches: Vec<MatchResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recognition {
    pub mode: RecognitionMode,
    /// Empty in multi-card mode when no card outline was found.
    pub regions: Vec<RegionRecognition>,
    #[serde(rename = "processing_time", serialize_with = "as_secs")]
    pub elapsed: Duration,
}

impl Recognition {
    pub fn no_cards_detected(&self) -> bool {
        self.regions.is_empty()
    }

    /// Highest-scoring match across all regions.
    pub fn best(&self) -> Option<&MatchResult> {
        self.regions
            .iter()
            .filter_map(|r| r.matches.first())
            .max_by_key(|m| m.score)
    }
}

pub(crate) fn as_secs<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Recognises photos against a fixed reference set. Cheap to share between
/// worker threads by reference.
pub struct Recognizer {
    mode: RecognitionMode,
    segmenter: Segmenter,
    fingerprinter: Fingerprinter,
    matcher: DescriptorMatcher,
    references: Arc<ReferenceSet>,
}

impl Recognizer {
    pub fn new(config: &PipelineConfig, references: Arc<ReferenceSet>) -> Self {
        Self {
            mode: config.mode,
            segmenter: Segmenter::new(config.segment.clone()),
            fingerprinter: Fingerprinter::new(config.fingerprint.clone()),
            matcher: DescriptorMatcher::new(config.matching.clone()),
            references,
        }
    }

    pub fn mode(&self) -> RecognitionMode {
        self.mode
    }

    pub fn references(&self) -> &ReferenceSet {
        &self.references
    }

    pub fn recognize_path(&self, path: &Path) -> Result<Recognition> {
        let started = Instant::now();
        let gray = load_grayscale(path)?;
        let mut recognition = self.recognize_image(&gray);
        recognition.elapsed = started.elapsed();
        tracing::debug!(
            file = %path.display(),
            regions = recognition.regions.len(),
            elapsed_ms = recognition.elapsed.as_millis() as u64,
            "recognised photo"
        );
        Ok(recognition)
    }

    pub fn recognize_image(&self, gray: &GrayImage) -> Recognition {
        let started = Instant::now();
        let regions = match self.mode {
            RecognitionMode::SingleCard => vec![self.recognize_region(gray, None)],
            RecognitionMode::MultiCard => self
                .segmenter
                .segment(gray)
                .into_iter()
                .map(|region| {
                    let crop = region.crop(gray);
                    self.recognize_region(&crop, Some(region))
                })
                .collect(),
        };
        Recognition {
            mode: self.mode,
            regions,
            elapsed: started.elapsed(),
        }
    }

    fn recognize_region(&self, gray: &GrayImage, region: Option<CardRegion>) -> RegionRecognition {
        let Some(query) = self.fingerprinter.fingerprint(gray) else {
            return RegionRecognition {
                region,
                verdict: RegionVerdict::Unmatchable,
                matches: Vec::new(),
            };
        };
        let (verdict, matches) = match self.matcher.rank(&query, self.references.as_ref()) {
            Ranking::Confident(matches) => (RegionVerdict::Matched, matches),
            Ranking::Ambiguous { best, runner_up } => (RegionVerdict::Ambiguous { best, runner_up }, Vec::new()),
            Ranking::NoMatch => (RegionVerdict::NoMatch, Vec::new()),
        };
        RegionRecognition {
            region,
            verdict,
            matches,
        }
    }
}
