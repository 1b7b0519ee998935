//! CLI binary for cardflat.
//!
//! A thin shim over the library crate: reads frames from disk, runs them
//! through `UploadPipeline`, and prints one response per frame.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use cardflat::{
    CornerDetector, FixedCorners, FrameCorners, OutputSize, PipelineConfig, Point, ResponseMode,
    RetentionStore, UploadPipeline, UploadResponse,
};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Flatten a photo of a card using manually picked corners
  cardflat photo.jpg --corners "112,80 930,140 870,690 60,600"

  # Keep the result inline instead of in the store
  cardflat photo.jpg --corners "..." --inline --json

  # Frames captured by the browser as base64 text
  cardflat --base64 frame1.txt frame2.txt --corners "..."

  # Document profile: 1600 px wide, height from the frame aspect ratio
  cardflat scan.png --width 1600 --aspect

Without --corners the whole frame is treated as the document.

ENVIRONMENT VARIABLES:
  CARDFLAT_STORE_DIR      Directory for rectified images
  CARDFLAT_CAPACITY       Number of images to keep
  RUST_LOG                Log filter (overrides -v / -q)
"#;

/// Flatten photographed cards and documents.
#[derive(Parser, Debug)]
#[command(
    name = "cardflat",
    version,
    about = "Detect, rectify and retain photographed cards and documents",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Frames to process: image files, or base64 text files with --base64.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Inputs are text files holding (optionally data-URI prefixed) base64.
    #[arg(long)]
    base64: bool,

    /// Four corners "x,y x,y x,y x,y": top-left, top-right, bottom-right, bottom-left.
    #[arg(long, env = "CARDFLAT_CORNERS")]
    corners: Option<String>,

    /// Directory for rectified images.
    #[arg(long, env = "CARDFLAT_STORE_DIR", default_value = "images")]
    store_dir: PathBuf,

    /// Also keep every input frame in this directory.
    #[arg(long, env = "CARDFLAT_ARCHIVE_DIR")]
    archive_dir: Option<PathBuf>,

    /// Number of images kept in each directory.
    #[arg(long, env = "CARDFLAT_CAPACITY", default_value_t = 30)]
    capacity: usize,

    /// JPEG quality for stored images (1–100).
    #[arg(long, env = "CARDFLAT_QUALITY", default_value_t = 98,
          value_parser = clap::value_parser!(u8).range(1..=100))]
    quality: u8,

    /// JPEG quality for inline results (1–100).
    #[arg(long, env = "CARDFLAT_INLINE_QUALITY", default_value_t = 95,
          value_parser = clap::value_parser!(u8).range(1..=100))]
    inline_quality: u8,

    /// Output width in pixels.
    #[arg(long, env = "CARDFLAT_WIDTH", default_value_t = 860)]
    width: u32,

    /// Output height in pixels (ignored with --aspect).
    #[arg(long, env = "CARDFLAT_HEIGHT", default_value_t = 540)]
    height: u32,

    /// Derive the output height from the frame's aspect ratio.
    #[arg(long, env = "CARDFLAT_ASPECT")]
    aspect: bool,

    /// Return results inline as data-URIs instead of storing them.
    #[arg(long)]
    inline: bool,

    /// URL prefix for stored results.
    #[arg(long, env = "CARDFLAT_PUBLIC_PREFIX", default_value = "/images")]
    public_prefix: String,

    /// Frames processed at once.
    #[arg(short, long, env = "CARDFLAT_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Print the JSON response for every frame.
    #[arg(long)]
    json: bool,

    /// Disable the progress spinner.
    #[arg(long)]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "CARDFLAT_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "CARDFLAT_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build pipeline ───────────────────────────────────────────────────
    let pipeline = build_pipeline(&cli)?;

    // ── Read frames ──────────────────────────────────────────────────────
    let mut payloads = Vec::with_capacity(cli.inputs.len());
    for path in &cli.inputs {
        payloads.push(read_frame(path, cli.base64).await?);
    }

    // ── Run ──────────────────────────────────────────────────────────────
    let bar = show_progress.then(|| {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]),
        );
        bar.set_prefix("Rectifying");
        bar.set_message(format!("{} frame(s)…", payloads.len()));
        bar.enable_steady_tick(Duration::from_millis(80));
        bar
    });

    let start = Instant::now();
    let results = pipeline.process_batch(&payloads, cli.concurrency).await;
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }

    // ── Report ───────────────────────────────────────────────────────────
    let mut failed = 0usize;
    for (path, result) in cli.inputs.iter().zip(&results) {
        let response = UploadResponse::from_result(result);
        if !response.success {
            failed += 1;
        }
        if cli.json {
            println!("{}", response.to_json());
        } else if !cli.quiet {
            print_summary(path, &response);
        }
    }

    if !cli.quiet && !cli.json {
        eprintln!(
            "{}  {}/{} frames  {}ms",
            if failed == 0 { green("✔") } else { red("✘") },
            results.len() - failed,
            results.len(),
            start.elapsed().as_millis(),
        );
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} frames failed", results.len());
    }
    Ok(())
}

/// Map CLI args to an `UploadPipeline`.
fn build_pipeline(cli: &Cli) -> Result<UploadPipeline> {
    let output_size = if cli.aspect {
        OutputSize::AspectWidth { width: cli.width }
    } else {
        OutputSize::Fixed {
            width: cli.width,
            height: cli.height,
        }
    };
    let mode = if cli.inline {
        ResponseMode::Inline
    } else {
        ResponseMode::Stored
    };

    let config = PipelineConfig::builder()
        .capacity(cli.capacity)
        .store_quality(cli.quality)
        .inline_quality(cli.inline_quality)
        .output_size(output_size)
        .response_mode(mode)
        .public_prefix(cli.public_prefix.clone())
        .build()
        .context("Invalid configuration")?;

    let detector: Arc<dyn CornerDetector> = match cli.corners {
        Some(ref corners) => Arc::new(FixedCorners::new(parse_corners(corners)?)),
        None => Arc::new(FrameCorners),
    };

    let store = match mode {
        ResponseMode::Stored => Some(
            RetentionStore::from_config(&cli.store_dir, &config)
                .with_context(|| format!("Failed to open store at {:?}", cli.store_dir))?,
        ),
        ResponseMode::Inline => None,
    };

    let mut pipeline = UploadPipeline::new(config.clone(), detector, store)?;
    if let Some(ref dir) = cli.archive_dir {
        let archive = RetentionStore::from_config(dir, &config)
            .with_context(|| format!("Failed to open archive at {:?}", dir))?
            .with_prefix("frame_");
        pipeline = pipeline.with_frame_archive(archive);
    }
    Ok(pipeline)
}

/// Load one input as base64 text.
async fn read_frame(path: &PathBuf, is_base64: bool) -> Result<String> {
    if is_base64 {
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {:?}", path))
    } else {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {:?}", path))?;
        Ok(STANDARD.encode(bytes))
    }
}

/// Parse `--corners "x,y x,y x,y x,y"`.
///
/// Any point count is accepted here; the pipeline reports a wrong count.
fn parse_corners(s: &str) -> Result<Vec<Point>> {
    s.split_whitespace()
        .map(|pair| {
            let (x, y) = pair
                .split_once(',')
                .with_context(|| format!("Corner '{pair}' is not of the form x,y"))?;
            let x: f32 = x.trim().parse().context(format!("Invalid x in '{pair}'"))?;
            let y: f32 = y.trim().parse().context(format!("Invalid y in '{pair}'"))?;
            Ok(Point::new(x, y))
        })
        .collect()
}

fn print_summary(path: &PathBuf, response: &UploadResponse) {
    let name = path.display().to_string();
    if response.success {
        let target = response
            .result_image_url
            .clone()
            .unwrap_or_else(|| "inline".to_string());
        println!(
            "  {} {}  →  {}  {}",
            green("✓"),
            bold(&name),
            target,
            dim(&format!(
                "{} → {}",
                response.input_size.as_deref().unwrap_or("?"),
                response.output_size.as_deref().unwrap_or("?")
            )),
        );
    } else {
        println!(
            "  {} {}  {}",
            red("✗"),
            bold(&name),
            red(response.error.as_deref().unwrap_or("unknown error")),
        );
    }
}
