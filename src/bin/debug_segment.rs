use anyhow::{Context, Result};
use card_match::fingerprint::load_grayscale;
use card_match::{PipelineConfig, Segmenter};
use clap::Parser;
use image::Rgb;
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::path::PathBuf;
use std::time::Instant;

/// Dump the segmentation edge map and detected card regions for one photo
#[derive(Parser, Debug)]
#[command(author, version, about = "Debug card segmentation on a single photo", long_about = None)]
struct Args {
    /// Photo to segment
    image: PathBuf,

    /// Output directory for edges.png and regions.png
    #[arg(short, long, default_value = "segment_debug")]
    out: PathBuf,

    /// JSON file with pipeline parameters
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    std::fs::create_dir_all(&args.out).with_context(|| format!("creating {}", args.out.display()))?;

    println!("=== 分割调试 ===\n");
    let gray = load_grayscale(&args.image)?;
    println!("图片尺寸: {}x{}", gray.width(), gray.height());

    let segmenter = Segmenter::new(config.segment);
    let start = Instant::now();
    let edges = segmenter.edge_map(&gray);
    let regions = segmenter.segment(&gray);
    println!("[Timer] 分割耗时: {:?}", start.elapsed());

    let edges_path = args.out.join("edges.png");
    edges.save(&edges_path).with_context(|| format!("saving {}", edges_path.display()))?;

    let mut canvas = image::DynamicImage::ImageLuma8(gray).to_rgb8();
    println!("找到 {} 个候选区域", regions.len());
    for (i, region) in regions.iter().enumerate() {
        let b = region.bounds;
        println!(
            "  #{}: x={} y={} {}x{} 面积={:.0} 长宽比={:.2} 顶点={}",
            i + 1,
            b.x,
            b.y,
            b.width,
            b.height,
            region.area,
            region.aspect,
            region.polygon.len()
        );
        draw_hollow_rect_mut(
            &mut canvas,
            Rect::at(b.x as i32, b.y as i32).of_size(b.width.max(1), b.height.max(1)),
            Rgb([0, 200, 0]),
        );
    }
    let regions_path = args.out.join("regions.png");
    canvas.save(&regions_path).with_context(|| format!("saving {}", regions_path.display()))?;
    println!("\n输出: {} / {}", edges_path.display(), regions_path.display());
    Ok(())
}
