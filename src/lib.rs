//! Identify photographed trading cards by matching local image features
//! against a folder of reference card images.

pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod matcher;
pub mod metadata;
pub mod pipeline;
pub mod reference;
pub mod report;
pub mod segment;

pub use batch::{batch_recognize, BatchReport, ImageOutcome, ImageReport};
pub use cache::{LoadPath, LoadReport, RebuildReason, ReferenceCache};
pub use config::{BatchConfig, PipelineConfig, RecognitionMode};
pub use error::{CacheError, PoolError, RecognitionError, Result};
pub use fingerprint::{Fingerprinter, ImageFingerprint};
pub use matcher::{DescriptorMatcher, MatchResult, Ranking};
pub use metadata::{CardCatalog, CardMetadata, MetadataPool};
pub use pipeline::{Recognition, Recognizer, RegionRecognition, RegionVerdict};
pub use reference::{collect_test_images, ReferenceEntry, ReferenceSet};
pub use segment::{CardRegion, Segmenter};
