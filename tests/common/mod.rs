#![allow(dead_code)]

use card_match::{BatchConfig, PipelineConfig, RecognitionMode};
use image::{GrayImage, Luma};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::path::{Path, PathBuf};

pub const CARD_WIDTH: u32 = 160;
pub const CARD_HEIGHT: u32 = 224;

/// Card-sized image of random 8px blocks: plenty of corners, unique per seed.
pub fn card_image(seed: u64) -> GrayImage {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let cols = CARD_WIDTH / 8;
    let blocks: Vec<u8> = (0..cols * (CARD_HEIGHT / 8)).map(|_| rng.gen()).collect();
    GrayImage::from_fn(CARD_WIDTH, CARD_HEIGHT, |x, y| {
        Luma([blocks[((y / 8) * cols + x / 8) as usize]])
    })
}

pub fn write_card(path: &Path, seed: u64) -> PathBuf {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    card_image(seed).save(path).unwrap();
    path.to_path_buf()
}

pub fn single_card_pipeline(cache_dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig {
        mode: RecognitionMode::SingleCard,
        ..PipelineConfig::default()
    };
    config.cache.cache_dir = Some(cache_dir.to_path_buf());
    config
}

pub fn batch_config(ref_root: &Path, workers: usize, use_cache: bool) -> BatchConfig {
    BatchConfig {
        worker_count: workers,
        use_cache,
        ..BatchConfig::new(ref_root)
    }
}
