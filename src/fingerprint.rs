//! Feature fingerprinting: FAST-9 keypoints plus 256-bit steered binary
//! descriptors, computed over a small scale pyramid.

use image::imageops::{self, FilterType};
use image::GrayImage;
use imageproc::corners::{corners_fast9, Corner};
use imageproc::filter::gaussian_blur_f32;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::path::Path;
use std::sync::OnceLock;

use crate::config::FingerprintConfig;
use crate::error::{RecognitionError, Result};

pub const DESCRIPTOR_BYTES: usize = 32;
pub const DESCRIPTOR_BITS: u32 = (DESCRIPTOR_BYTES * 8) as u32;

/// Seed of the binary test pattern. Part of the fingerprint digest.
pub const DESCRIPTOR_PATTERN_SEED: u64 = 0x0c4d_5eed;

/// Test offsets stay inside this radius, so any rotation of them does too.
const PATTERN_RADIUS: i32 = 12;
/// Radius of the patch used for the intensity-centroid orientation.
const ORIENTATION_RADIUS: i32 = 15;
/// Keypoints closer than this to an image edge are skipped.
const BORDER: u32 = ORIENTATION_RADIUS as u32 + 2;
/// Non-maximum suppression radius, in pixels of the pyramid level.
const SUPPRESSION_RADIUS: u32 = 3;

pub type Descriptor = [u8; DESCRIPTOR_BYTES];

/// A detected salient point, in original image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Downscale factor of the pyramid level the point was found on.
    pub scale: f32,
    /// Radians, intensity-centroid direction.
    pub orientation: f32,
    /// FAST corner score.
    pub strength: f32,
}

/// Keypoints and their descriptors for one image. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFingerprint {
    width: u32,
    height: u32,
    keypoints: Vec<Keypoint>,
    descriptors: Vec<Descriptor>,
}

impl ImageFingerprint {
    /// Returns `None` when the fingerprint would be unmatchable (fewer than two
    /// descriptors) or when keypoints and descriptors are not aligned.
    pub fn new(
        width: u32,
        height: u32,
        keypoints: Vec<Keypoint>,
        descriptors: Vec<Descriptor>,
    ) -> Option<Self> {
        if descriptors.len() < 2 || keypoints.len() != descriptors.len() {
            return None;
        }
        Some(Self {
            width,
            height,
            keypoints,
            descriptors,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn keypoints(&self) -> &[Keypoint] {
        &self.keypoints
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

pub fn hamming_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

#[derive(Debug, Clone, Copy)]
struct TestPair {
    a: (i32, i32),
    b: (i32, i32),
}

fn test_pattern() -> &'static [TestPair] {
    static PATTERN: OnceLock<Vec<TestPair>> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let mut rng = ChaCha8Rng::seed_from_u64(DESCRIPTOR_PATTERN_SEED);
        let mut sample = move || loop {
            let x = rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS);
            let y = rng.gen_range(-PATTERN_RADIUS..=PATTERN_RADIUS);
            if x * x + y * y <= PATTERN_RADIUS * PATTERN_RADIUS {
                return (x, y);
            }
        };
        (0..DESCRIPTOR_BITS)
            .map(|_| TestPair {
                a: sample(),
                b: sample(),
            })
            .collect()
    })
}

struct Candidate {
    level: usize,
    corner: Corner,
}

/// Turns grayscale images into fingerprints. Cheap to clone and share.
#[derive(Debug, Clone, Default)]
pub struct Fingerprinter {
    config: FingerprintConfig,
}

impl Fingerprinter {
    pub fn new(config: FingerprintConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FingerprintConfig {
        &self.config
    }

    /// Decode an image file and fingerprint it. `Ok(None)` means the image
    /// decoded fine but has too little texture to be matched.
    pub fn fingerprint_path(&self, path: &Path) -> Result<Option<ImageFingerprint>> {
        let gray = load_grayscale(path)?;
        Ok(self.fingerprint(&gray))
    }

    pub fn fingerprint(&self, gray: &GrayImage) -> Option<ImageFingerprint> {
        let (width, height) = gray.dimensions();
        let levels = self.build_pyramid(gray);

        let mut candidates = Vec::new();
        for (level, (_, raw, _)) in levels.iter().enumerate() {
            let (w, h) = raw.dimensions();
            let mut corners: Vec<Corner> = corners_fast9(raw, self.config.fast_threshold)
                .into_iter()
                .filter(|c| c.x >= BORDER && c.y >= BORDER && c.x < w - BORDER && c.y < h - BORDER)
                .collect();
            sort_corners(&mut corners);
            for corner in suppress_neighbours(&corners, w, h) {
                candidates.push(Candidate { level, corner });
            }
        }

        // 最强的角点优先，分数相同时按层级和坐标排序以保证确定性
        candidates.sort_by(|a, b| {
            b.corner
                .score
                .total_cmp(&a.corner.score)
                .then(a.level.cmp(&b.level))
                .then(a.corner.y.cmp(&b.corner.y))
                .then(a.corner.x.cmp(&b.corner.x))
        });
        candidates.truncate(self.config.max_features);

        let pattern = test_pattern();
        let mut keypoints = Vec::with_capacity(candidates.len());
        let mut descriptors = Vec::with_capacity(candidates.len());
        for Candidate { level, corner } in candidates {
            let (scale, _, smoothed) = &levels[level];
            let orientation = intensity_centroid_angle(smoothed, corner.x, corner.y);
            descriptors.push(steered_descriptor(smoothed, corner.x, corner.y, orientation, pattern));
            keypoints.push(Keypoint {
                x: corner.x as f32 * scale,
                y: corner.y as f32 * scale,
                scale: *scale,
                orientation,
                strength: corner.score,
            });
        }

        ImageFingerprint::new(width, height, keypoints, descriptors)
    }

    /// (scale, raw level, smoothed level) for every level large enough to
    /// hold at least one keypoint.
    fn build_pyramid(&self, gray: &GrayImage) -> Vec<(f32, GrayImage, GrayImage)> {
        let (width, height) = gray.dimensions();
        let min_side = 2 * BORDER + 1;
        let mut levels = Vec::new();
        let mut scale = 1.0f32;
        for level in 0..self.config.pyramid_levels {
            if level > 0 {
                scale *= self.config.scale_factor;
            }
            let w = (width as f32 / scale).round() as u32;
            let h = (height as f32 / scale).round() as u32;
            if w < min_side || h < min_side {
                break;
            }
            let raw = if level == 0 {
                gray.clone()
            } else {
                imageops::resize(gray, w, h, FilterType::Triangle)
            };
            let smoothed = gaussian_blur_f32(&raw, self.config.smoothing_sigma);
            levels.push((scale, raw, smoothed));
        }
        levels
    }
}

pub fn load_grayscale(path: &Path) -> Result<GrayImage> {
    // 先读字节再解码，避免非 ASCII 路径的问题
    let bytes = std::fs::read(path).map_err(|source| RecognitionError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let img = image::load_from_memory(&bytes).map_err(|source| RecognitionError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(img.to_luma8())
}

fn sort_corners(corners: &mut [Corner]) {
    corners.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.y.cmp(&b.y))
            .then(a.x.cmp(&b.x))
    });
}

/// Greedy suppression over corners already sorted strongest first.
fn suppress_neighbours(sorted: &[Corner], width: u32, height: u32) -> Vec<Corner> {
    let mut taken = vec![false; (width * height) as usize];
    let mut kept = Vec::new();
    for corner in sorted {
        let idx = (corner.y * width + corner.x) as usize;
        if taken[idx] {
            continue;
        }
        kept.push(*corner);
        let x0 = corner.x.saturating_sub(SUPPRESSION_RADIUS);
        let y0 = corner.y.saturating_sub(SUPPRESSION_RADIUS);
        let x1 = (corner.x + SUPPRESSION_RADIUS).min(width - 1);
        let y1 = (corner.y + SUPPRESSION_RADIUS).min(height - 1);
        for y in y0..=y1 {
            for x in x0..=x1 {
                taken[(y * width + x) as usize] = true;
            }
        }
    }
    kept
}

fn intensity_centroid_angle(img: &GrayImage, cx: u32, cy: u32) -> f32 {
    let (cx, cy) = (cx as i32, cy as i32);
    let mut m01 = 0i64;
    let mut m10 = 0i64;
    for dy in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
        for dx in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
            if dx * dx + dy * dy > ORIENTATION_RADIUS * ORIENTATION_RADIUS {
                continue;
            }
            let v = img.get_pixel((cx + dx) as u32, (cy + dy) as u32)[0] as i64;
            m10 += dx as i64 * v;
            m01 += dy as i64 * v;
        }
    }
    (m01 as f32).atan2(m10 as f32)
}

fn steered_descriptor(
    img: &GrayImage,
    cx: u32,
    cy: u32,
    angle: f32,
    pattern: &[TestPair],
) -> Descriptor {
    let (sin, cos) = angle.sin_cos();
    let sample = |(dx, dy): (i32, i32)| {
        let rx = (cos * dx as f32 - sin * dy as f32).round() as i32;
        let ry = (sin * dx as f32 + cos * dy as f32).round() as i32;
        img.get_pixel((cx as i32 + rx) as u32, (cy as i32 + ry) as u32)[0]
    };
    let mut desc = [0u8; DESCRIPTOR_BYTES];
    for (i, pair) in pattern.iter().enumerate() {
        if sample(pair.a) < sample(pair.b) {
            desc[i / 8] |= 1 << (i % 8);
        }
    }
    desc
}
