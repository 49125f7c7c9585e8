//! Human-readable and JSON batch reports, plus annotated copies of
//! multi-card photos.

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_line_segment_mut;
use std::fmt::Write as _;
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use crate::batch::{BatchReport, ImageOutcome};
use crate::error::{RecognitionError, Result};
use crate::pipeline::{Recognition, RegionRecognition, RegionVerdict};

pub const TEXT_REPORT: &str = "report.txt";
pub const JSON_REPORT: &str = "report.json";

const MATCHED: Rgb<u8> = Rgb([0, 200, 0]);
const UNRESOLVED: Rgb<u8> = Rgb([220, 40, 40]);

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> RecognitionError + '_ {
    move |source| RecognitionError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Report text, one block per photo, photos in path order.
pub fn render_text(report: &BatchReport) -> String {
    let mut out = String::new();
    for (path, outcome) in report.to_map() {
        let _ = writeln!(out, "Results for {}:", display_name(path));
        match outcome {
            ImageOutcome::Failed { error } => {
                let _ = writeln!(out, "  Error: {error}");
            }
            ImageOutcome::Recognized(recognition) => render_recognition(&mut out, recognition),
        }
        out.push('\n');
    }
    let _ = writeln!(
        out,
        "{} photos, {} failed, {:.2} seconds with {} workers",
        report.results.len(),
        report.failures(),
        report.elapsed.as_secs_f64(),
        report.workers
    );
    out
}

fn render_recognition(out: &mut String, recognition: &Recognition) {
    let _ = writeln!(out, "Processing time: {:.2} seconds", recognition.elapsed.as_secs_f64());
    if recognition.no_cards_detected() {
        let _ = writeln!(out, "  No cards detected");
        return;
    }
    let multi = recognition.regions.len() > 1 || recognition.regions.iter().any(|r| r.region.is_some());
    for (i, region) in recognition.regions.iter().enumerate() {
        let indent = if multi {
            let _ = writeln!(out, "  Card {}:", i + 1);
            "    "
        } else {
            "  "
        };
        render_region(out, region, indent);
    }
}

fn render_region(out: &mut String, region: &RegionRecognition, indent: &str) {
    match &region.verdict {
        RegionVerdict::Matched => {
            for (rank, m) in region.matches.iter().enumerate() {
                let label = match &m.metadata {
                    Some(meta) => format!("{} - {}", m.reference_path, meta.summary()),
                    None => m.reference_path.clone(),
                };
                let _ = writeln!(out, "{indent}{}. {label} ({} matches)", rank + 1, m.score);
            }
        }
        RegionVerdict::Ambiguous { best, runner_up } => {
            let _ = writeln!(out, "{indent}Ambiguous match ({best} vs {runner_up} matches)");
        }
        RegionVerdict::NoMatch => {
            let _ = writeln!(out, "{indent}No reliable match");
        }
        RegionVerdict::Unmatchable => {
            let _ = writeln!(out, "{indent}Not enough detail to match");
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

pub fn write_text(report: &BatchReport, path: &Path) -> Result<()> {
    fs::write(path, render_text(report)).map_err(io_error(path))
}

pub fn write_json(report: &BatchReport, path: &Path) -> Result<()> {
    let file = fs::File::create(path).map_err(io_error(path))?;
    serde_json::to_writer_pretty(BufWriter::new(file), report)
        .map_err(|e| io_error(path)(std::io::Error::other(e)))
}

/// Copy of the photo with every detected region outlined, green when
/// matched and red otherwise.
pub fn annotate(photo: &Path, recognition: &Recognition) -> Result<RgbImage> {
    let bytes = fs::read(photo).map_err(io_error(photo))?;
    let mut canvas = image::load_from_memory(&bytes)
        .map_err(|source| RecognitionError::Decode {
            path: photo.to_path_buf(),
            source,
        })?
        .to_rgb8();

    for region in &recognition.regions {
        let Some(card) = &region.region else { continue };
        let color = if region.verdict == RegionVerdict::Matched {
            MATCHED
        } else {
            UNRESOLVED
        };
        let n = card.polygon.len();
        for i in 0..n {
            let (x0, y0) = card.polygon[i];
            let (x1, y1) = card.polygon[(i + 1) % n];
            // 画两遍加粗
            for d in [0.0f32, 1.0] {
                draw_line_segment_mut(
                    &mut canvas,
                    (x0 as f32 + d, y0 as f32 + d),
                    (x1 as f32 + d, y1 as f32 + d),
                    color,
                );
            }
        }
    }
    Ok(canvas)
}

/// Where the annotated copy of `photo` goes: `annotated_<name>` under the
/// same subfolder it has below `photo_root`.
pub fn annotated_path(output_dir: &Path, photo_root: &Path, photo: &Path) -> PathBuf {
    let dir = match photo.strip_prefix(photo_root).ok().and_then(Path::parent) {
        Some(sub) => output_dir.join(sub),
        None => output_dir.to_path_buf(),
    };
    dir.join(format!("annotated_{}", display_name(photo)))
}

/// Write `report.txt`, `report.json` and an annotated copy of every
/// recognised multi-card photo into `output_dir`. Annotation failures are
/// logged and skipped.
pub fn write_outputs(report: &BatchReport, photo_root: &Path, output_dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(output_dir).map_err(io_error(output_dir))?;
    let mut written = Vec::new();

    let text = output_dir.join(TEXT_REPORT);
    write_text(report, &text)?;
    written.push(text);
    let json = output_dir.join(JSON_REPORT);
    write_json(report, &json)?;
    written.push(json);

    for (path, outcome) in report.to_map() {
        let ImageOutcome::Recognized(recognition) = outcome else {
            continue;
        };
        if recognition.regions.iter().all(|r| r.region.is_none()) {
            continue;
        }
        let target = annotated_path(output_dir, photo_root, path);
        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir).map_err(io_error(dir))?;
        }
        match annotate(path, recognition).and_then(|img| {
            img.save(&target).map_err(|source| RecognitionError::Encode {
                path: target.clone(),
                source,
            })
        }) {
            Ok(()) => written.push(target),
            Err(e) => tracing::warn!(file = %path.display(), error = %e, "failed to write annotated photo"),
        }
    }
    Ok(written)
}
