//! Card region segmentation for photos that may contain several cards.

use image::{imageops, GrayImage, Luma};
use imageproc::contours::find_contours;
use imageproc::distance_transform::Norm;
use imageproc::edges::canny;
use imageproc::filter::gaussian_blur_f32;
use imageproc::geometry::{approximate_polygon_dp, arc_length, min_area_rect};
use imageproc::morphology::{close, open};
use imageproc::point::Point;
use serde::{Deserialize, Serialize};

use crate::config::SegmentConfig;

/// Axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Bounds {
    fn of_points(points: &[Point<i32>], img_w: u32, img_h: u32) -> Self {
        let min_x = points.iter().map(|p| p.x).min().unwrap_or(0).max(0) as u32;
        let min_y = points.iter().map(|p| p.y).min().unwrap_or(0).max(0) as u32;
        let max_x = (points.iter().map(|p| p.x).max().unwrap_or(0).max(0) as u32).min(img_w - 1);
        let max_y = (points.iter().map(|p| p.y).max().unwrap_or(0).max(0) as u32).min(img_h - 1);
        Self {
            x: min_x,
            y: min_y,
            width: max_x.saturating_sub(min_x) + 1,
            height: max_y.saturating_sub(min_y) + 1,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn iou(&self, other: &Bounds) -> f64 {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = (self.x + self.width).min(other.x + other.width);
        let y1 = (self.y + self.height).min(other.y + other.height);
        if x1 <= x0 || y1 <= y0 {
            return 0.0;
        }
        let inter = (x1 - x0) as f64 * (y1 - y0) as f64;
        inter / ((self.area() + other.area()) as f64 - inter).max(f64::EPSILON)
    }
}

/// One candidate card location within a photo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardRegion {
    /// Approximated outline, 4 to 6 vertices.
    pub polygon: Vec<(i32, i32)>,
    pub bounds: Bounds,
    /// Contour area in pixels.
    pub area: f64,
    /// Long side over short side of the minimum-area rectangle.
    pub aspect: f64,
}

impl CardRegion {
    pub fn crop(&self, img: &GrayImage) -> GrayImage {
        let b = self.bounds;
        imageops::crop_imm(img, b.x, b.y, b.width, b.height).to_image()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Segmenter {
    config: SegmentConfig,
}

impl Segmenter {
    pub fn new(config: SegmentConfig) -> Self {
        Self { config }
    }

    /// Combined gradient + adaptive-threshold map after opening and closing.
    /// This is the binary image contours are traced on.
    pub fn edge_map(&self, gray: &GrayImage) -> GrayImage {
        let c = &self.config;
        let blurred = gaussian_blur_f32(gray, c.blur_sigma);
        let edges = canny(&blurred, c.canny_low, c.canny_high);

        // 自适应阈值：比局部均值暗 offset 以上的像素视为前景，纯色图因此为空
        let local_mean = gaussian_blur_f32(&blurred, c.adaptive_sigma);
        let combined = GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
            let v = blurred.get_pixel(x, y)[0] as i16;
            let mean = local_mean.get_pixel(x, y)[0] as i16;
            let edge = edges.get_pixel(x, y)[0] > 0;
            if edge || v < mean - c.adaptive_offset {
                Luma([255u8])
            } else {
                Luma([0u8])
            }
        });

        let opened = if c.open_radius > 0 {
            open(&combined, Norm::LInf, c.open_radius)
        } else {
            combined
        };
        if c.close_radius > 0 {
            close(&opened, Norm::LInf, c.close_radius)
        } else {
            opened
        }
    }

    /// Candidate card regions, largest first. An empty result means no cards
    /// were found, which is a normal outcome.
    pub fn segment(&self, gray: &GrayImage) -> Vec<CardRegion> {
        let (w, h) = gray.dimensions();
        if w < 3 || h < 3 {
            return Vec::new();
        }
        let c = &self.config;
        let binary = self.edge_map(gray);

        let mut contours: Vec<(f64, Vec<Point<i32>>)> = find_contours::<i32>(&binary)
            .into_iter()
            .filter(|contour| contour.points.len() >= 3)
            .map(|contour| (shoelace_area(&contour.points), contour.points))
            .collect();
        contours.sort_by(|a, b| b.0.total_cmp(&a.0));
        contours.truncate(c.max_candidates);

        let min_area = (w as f64 * h as f64) * c.min_area_fraction;
        let mut regions: Vec<CardRegion> = Vec::new();
        for (area, points) in contours {
            if area < min_area {
                // sorted by area, nothing further can pass
                break;
            }
            let perimeter = arc_length(&points, true);
            if perimeter <= 0.0 {
                continue;
            }
            let mut approx = approximate_polygon_dp(&points, c.approx_epsilon * perimeter, true);
            while approx.len() > 1 && approx.first() == approx.last() {
                approx.pop();
            }
            if approx.len() < c.min_vertices || approx.len() > c.max_vertices {
                tracing::trace!(vertices = approx.len(), "rejected contour: vertex count");
                continue;
            }
            let aspect = rect_aspect(&min_area_rect(&approx));
            if !(c.min_aspect..=c.max_aspect).contains(&aspect) {
                tracing::trace!(aspect, "rejected contour: aspect ratio");
                continue;
            }
            let bounds = Bounds::of_points(&approx, w, h);
            if regions.iter().any(|r| r.bounds.iou(&bounds) > c.duplicate_iou) {
                continue;
            }
            regions.push(CardRegion {
                polygon: approx.iter().map(|p| (p.x, p.y)).collect(),
                bounds,
                area,
                aspect,
            });
        }

        tracing::debug!(regions = regions.len(), "segmentation finished");
        regions
    }
}

fn shoelace_area(points: &[Point<i32>]) -> f64 {
    let n = points.len();
    let twice: i64 = (0..n)
        .map(|i| {
            let p = points[i];
            let q = points[(i + 1) % n];
            p.x as i64 * q.y as i64 - q.x as i64 * p.y as i64
        })
        .sum();
    twice.abs() as f64 / 2.0
}

fn rect_aspect(corners: &[Point<i32>; 4]) -> f64 {
    let side = |a: Point<i32>, b: Point<i32>| {
        let dx = (a.x - b.x) as f64;
        let dy = (a.y - b.y) as f64;
        (dx * dx + dy * dy).sqrt()
    };
    let w = side(corners[0], corners[1]);
    let h = side(corners[1], corners[2]);
    let (long, short) = if w > h { (w, h) } else { (h, w) };
    if short > 0.0 {
        long / short
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn photo_with_cards(cards: &[(u32, u32, u32, u32)]) -> GrayImage {
        GrayImage::from_fn(400, 300, |x, y| {
            let inside = cards
                .iter()
                .any(|&(cx, cy, cw, ch)| x >= cx && x < cx + cw && y >= cy && y < cy + ch);
            if inside {
                Luma([215u8])
            } else {
                Luma([40u8])
            }
        })
    }

    #[test]
    fn blank_photo_has_no_regions() {
        let img = GrayImage::from_pixel(400, 300, Luma([128]));
        assert!(Segmenter::default().segment(&img).is_empty());
    }

    #[test]
    fn single_card_yields_one_region() {
        let img = photo_with_cards(&[(140, 70, 110, 154)]);
        let regions = Segmenter::default().segment(&img);
        assert_eq!(regions.len(), 1, "{regions:?}");
        let region = &regions[0];
        assert!(region.aspect > 1.1 && region.aspect < 2.2);
        assert!((4..=6).contains(&region.polygon.len()));
        // the outline hugs the card
        assert!(region.bounds.x <= 140 && region.bounds.x + 20 >= 140);
        assert!(region.bounds.y <= 70 && region.bounds.y + 20 >= 70);
    }

    #[test]
    fn two_cards_yield_two_regions() {
        let img = photo_with_cards(&[(30, 60, 100, 140), (240, 80, 100, 140)]);
        let regions = Segmenter::default().segment(&img);
        assert_eq!(regions.len(), 2, "{regions:?}");
        let mut xs: Vec<u32> = regions.iter().map(|r| r.bounds.x).collect();
        xs.sort();
        assert!(xs[0] < 40 && xs[1] > 200);
    }

    #[test]
    fn square_is_rejected() {
        let img = photo_with_cards(&[(140, 80, 130, 130)]);
        assert!(Segmenter::default().segment(&img).is_empty());
    }

    #[test]
    fn small_card_is_noise() {
        // 20x30 is 0.5% of the photo
        let img = photo_with_cards(&[(100, 100, 20, 30)]);
        assert!(Segmenter::default().segment(&img).is_empty());
    }

    #[test]
    fn crop_matches_bounds() {
        let img = photo_with_cards(&[(140, 70, 110, 154)]);
        let region = Segmenter::default().segment(&img).remove(0);
        let crop = region.crop(&img);
        assert_eq!(crop.dimensions(), (region.bounds.width, region.bounds.height));
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = Bounds { x: 0, y: 0, width: 10, height: 10 };
        let b = Bounds { x: 20, y: 20, width: 10, height: 10 };
        assert_eq!(a.iou(&b), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-9);
    }
}
