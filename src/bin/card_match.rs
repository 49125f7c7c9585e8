use anyhow::{bail, Context, Result};
use card_match::{
    batch, collect_test_images, report, BatchConfig, Fingerprinter, PipelineConfig, RecognitionMode, ReferenceCache,
};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Identify photographed cards against a folder of reference images
#[derive(Parser, Debug)]
#[command(author, version, about = "Match card photos against reference images", long_about = None)]
struct Args {
    /// Directory of photos to recognise
    #[arg(short, long)]
    test_dir: PathBuf,

    /// Reference image root (subfolders allowed)
    #[arg(short, long)]
    ref_dir: PathBuf,

    /// Write report.txt, report.json and annotated photos here
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// SQLite card catalogue used to label matches
    #[arg(long)]
    db: Option<PathBuf>,

    /// Worker threads for the batch
    #[arg(short, long, default_value_t = 4)]
    workers: usize,

    /// Fingerprint references in memory without reading or writing the cache
    #[arg(long, default_value_t = false)]
    no_cache: bool,

    /// Delete the cached snapshot for --ref-dir before loading
    #[arg(long, default_value_t = false)]
    clear_cache: bool,

    /// Override the cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Treat each photo as a single card instead of segmenting it
    #[arg(long, default_value_t = false)]
    single_card: bool,

    /// JSON file with pipeline parameters
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn init_logging(batch: &BatchConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(batch.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    let batch_config = BatchConfig {
        output_root: args.output_dir.clone(),
        metadata_db: args.db.clone(),
        worker_count: args.workers,
        use_cache: !args.no_cache,
        verbose: args.verbose,
        ..BatchConfig::new(&args.ref_dir)
    };
    init_logging(&batch_config);

    let mut pipeline = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if args.single_card {
        pipeline.mode = RecognitionMode::SingleCard;
    }
    if args.cache_dir.is_some() {
        pipeline.cache.cache_dir = args.cache_dir.clone();
    }

    if args.clear_cache {
        let cache = ReferenceCache::new(pipeline.cache.clone(), Fingerprinter::new(pipeline.fingerprint.clone()));
        let removed = cache.clear(&args.ref_dir).context("clearing reference cache")?;
        tracing::info!(removed, "reference cache cleared");
    }

    let photos = collect_test_images(&args.test_dir)
        .with_context(|| format!("listing photos in {}", args.test_dir.display()))?;
    if photos.is_empty() {
        bail!("no valid images found in {}", args.test_dir.display());
    }

    let (recognizer, load) = batch::prepare(&batch_config, &pipeline).context("preparing reference set")?;
    println!(
        "[Timer] 参考库加载: {} entries in {:.2}s ({:?})",
        load.entries,
        load.elapsed.as_secs_f64(),
        load.path
    );

    let result = batch::batch_recognize(&photos, &recognizer, batch_config.worker_count)?;
    print!("{}", report::render_text(&result));

    if let Some(out) = &batch_config.output_root {
        let written = report::write_outputs(&result, &args.test_dir, out)
            .with_context(|| format!("writing outputs to {}", out.display()))?;
        println!("Wrote {} files to {}", written.len(), out.display());
    }
    Ok(())
}
