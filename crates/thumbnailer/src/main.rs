use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use thumbnail_pipeline::{
    exif, Bound, ChannelDelivery, ImageLoader, OutputFormat, PipelineConfig, Priority, RequestOutcome,
    ResultCache, Rotation, ScaleQuality, TargetId, Thumbnail, ThumbnailRequest, ThumbnailService,
};
use tracing::{info, warn};

/// Extensions picked up when a directory is given as input.
const IMAGE_EXTENSIONS: [&str; 14] = [
    "jpg", "jpeg", "png", "gif", "webp", "bmp", "tif", "tiff", "ico", "pnm", "ppm", "hdr", "exr", "qoi",
];

#[derive(Parser)]
#[command(name = "thumbnailer")]
#[command(about = "Generate and cache rotation-aware image thumbnails")]
struct Cli {
    #[command(flatten)]
    pipeline: PipelineArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct PipelineArgs {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Number of worker threads
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Disk cache directory
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Keep thumbnails in memory only
    #[arg(long, global = true)]
    no_disk_cache: bool,
}

#[derive(Args)]
struct ScaleArgs {
    /// Longest edge of the generated thumbnails
    #[arg(short, long)]
    size: Option<u32>,

    /// Rotation in degrees, or "auto" to follow EXIF orientation
    #[arg(short, long, default_value = "auto")]
    rotation: String,

    /// Resampling quality: fast or quality
    #[arg(long)]
    scale_quality: Option<ScaleQuality>,

    /// Never enlarge images smaller than the requested size
    #[arg(long)]
    dont_enlarge: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build thumbnails through the scheduler and write them to a folder
    Generate {
        /// Image files or folders
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Output folder
        #[arg(short, long)]
        out: PathBuf,

        #[command(flatten)]
        scale: ScaleArgs,

        /// Number of leading inputs treated as visible (highest priority)
        #[arg(long, default_value = "12")]
        visible: usize,

        /// Write PNG instead of JPEG
        #[arg(long)]
        png: bool,

        /// Ignore cached thumbnails
        #[arg(long)]
        force: bool,

        /// Give up waiting for results after this many seconds
        #[arg(long, default_value = "300")]
        timeout_secs: u64,
    },

    /// Fill the disk cache in parallel without writing output files
    Warm {
        /// Image files or folders
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        #[command(flatten)]
        scale: ScaleArgs,
    },

    /// Compose a folder thumbnail from the first pictures in the inputs
    Folder {
        /// Image files or folders
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Output file
        #[arg(short, long)]
        out: PathBuf,

        /// Rotation in degrees for every member, or "auto"
        #[arg(short, long, default_value = "auto")]
        rotation: String,

        /// Canvas edge in pixels
        #[arg(long)]
        canvas: Option<u32>,
    },

    /// Show decoder, dimensions and EXIF details for an image
    Info {
        /// Image file
        path: PathBuf,

        /// Print the EXIF summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete every cached thumbnail
    ClearCache,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("thumbnail_pipeline=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.pipeline)?;

    match cli.command {
        Commands::Generate { inputs, out, scale, visible, png, force, timeout_secs } => {
            generate(config, &inputs, &out, &scale, visible, png, force, Duration::from_secs(timeout_secs))
        }
        Commands::Warm { inputs, scale } => warm(config, &inputs, &scale),
        Commands::Folder { inputs, out, rotation, canvas } => folder(config, &inputs, &out, &rotation, canvas),
        Commands::Info { path, json } => show_info(&path, json),
        Commands::ClearCache => clear_cache(&config),
    }
}

fn load_config(args: &PipelineArgs) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(dir) = &args.cache_dir {
        config.cache_dir = Some(dir.clone());
    }
    if args.no_disk_cache {
        config.disk_cache = false;
    }
    Ok(config.normalized())
}

impl ScaleArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(quality) = self.scale_quality {
            config.scale_quality = quality;
        }
        if self.dont_enlarge {
            config.dont_enlarge = true;
        }
    }

    fn bound(&self, config: &PipelineConfig) -> Bound {
        self.size.map(Bound::square).unwrap_or(config.default_bound)
    }

    fn rotation(&self) -> Result<Rotation> {
        parse_rotation(&self.rotation)
    }
}

fn parse_rotation(text: &str) -> Result<Rotation> {
    if text.eq_ignore_ascii_case("auto") {
        return Ok(Rotation::FromExif);
    }
    let degrees: f64 = text
        .parse()
        .with_context(|| format!("Invalid rotation: {}", text))?;
    Ok(Rotation::Degrees(degrees))
}

/// Expand folders (non-recursively) into the image files they contain
fn collect_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut found = Vec::new();
            for entry in std::fs::read_dir(input)
                .with_context(|| format!("Failed to read directory: {}", input.display()))?
            {
                let path = entry?.path();
                let is_image = path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
                    .unwrap_or(false);
                if is_image {
                    found.push(path);
                }
            }
            found.sort();
            files.extend(found);
        } else {
            files.push(input.clone());
        }
    }
    Ok(files)
}

fn output_path(out: &Path, index: usize, source: &Path, png: bool) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("image-{}", index));
    let ext = if png { "png" } else { "jpg" };
    out.join(format!("{:04}-{}.{}", index, stem, ext))
}

#[allow(clippy::too_many_arguments)]
fn generate(
    mut config: PipelineConfig,
    inputs: &[PathBuf],
    out: &Path,
    scale: &ScaleArgs,
    visible: usize,
    png: bool,
    force: bool,
    timeout: Duration,
) -> Result<()> {
    scale.apply(&mut config);
    let files = collect_inputs(inputs)?;
    if files.is_empty() {
        println!("No image files found");
        return Ok(());
    }

    let bound = scale.bound(&config);
    let rotation = scale.rotation()?;
    let format = if png {
        OutputFormat::Png
    } else {
        OutputFormat::Jpeg { quality: config.jpeg_quality }
    };
    std::fs::create_dir_all(out)
        .with_context(|| format!("Failed to create output directory: {}", out.display()))?;

    let service = ThumbnailService::new(config)?;
    let delivery = ChannelDelivery::new();
    let started = Instant::now();

    println!("Generating {} thumbnails ({}) into {}", files.len(), bound, out.display());

    let mut outstanding: HashMap<TargetId, PathBuf> = HashMap::new();
    let mut written = 0usize;
    let mut failed = 0usize;

    for (index, source) in files.iter().enumerate() {
        let target = TargetId::new(index.to_string());
        let destination = output_path(out, index, source, png);
        let priority = if index < visible { Priority::Highest } else { Priority::Low };
        let request = ThumbnailRequest::new(target.clone(), source.clone(), bound, delivery.callback())
            .with_rotation(rotation)
            .with_priority(priority)
            .force_rebuild(force);

        match service.request(request) {
            RequestOutcome::Ready(thumbnail) => {
                thumbnail.save(&destination, format)?;
                written += 1;
            }
            RequestOutcome::Scheduled(_) => {
                outstanding.insert(target, destination);
            }
        }
    }

    let deadline = started + timeout;
    while !outstanding.is_empty() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let Some(ready) = delivery.recv_timeout(remaining) else {
            warn!(missing = outstanding.len(), "timed out waiting for thumbnails");
            break;
        };
        let Some(destination) = outstanding.remove(&ready.target) else {
            continue;
        };

        let thumbnail = match ready.result {
            Ok(thumbnail) => {
                written += 1;
                thumbnail
            }
            Err(e) => {
                warn!(source = %files_label(&files, &ready.target), error = %e, "using placeholder");
                failed += 1;
                Thumbnail::broken()
            }
        };
        thumbnail.save(&destination, format)?;
    }

    service.shutdown();
    let stats = service.cache_stats();
    println!(
        "Done in {:.1}s: {} written, {} failed, cache hit rate {:.0}%",
        started.elapsed().as_secs_f64(),
        written,
        failed,
        stats.hit_rate() * 100.0
    );

    if !outstanding.is_empty() {
        bail!("{} thumbnails did not finish in time", outstanding.len());
    }
    Ok(())
}

fn files_label(files: &[PathBuf], target: &TargetId) -> String {
    target
        .as_str()
        .parse::<usize>()
        .ok()
        .and_then(|index| files.get(index))
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| target.to_string())
}

fn warm(mut config: PipelineConfig, inputs: &[PathBuf], scale: &ScaleArgs) -> Result<()> {
    scale.apply(&mut config);
    let files = collect_inputs(inputs)?;
    let bound = scale.bound(&config);
    let rotation = scale.rotation()?;

    let service = ThumbnailService::new(config)?;
    let results = service.factory().build_batch(&files, rotation, bound, |done, total| {
        if done % 50 == 0 || done == total {
            info!(done, total, "warming cache");
        }
    });
    service.shutdown();

    let failed: Vec<_> = results.iter().filter(|(_, result)| result.is_err()).collect();
    for (path, result) in &failed {
        if let Err(e) = result {
            println!("Failed: {}: {}", path.display(), e);
        }
    }
    println!("Warmed {} of {} thumbnails", results.len() - failed.len(), results.len());
    Ok(())
}

fn folder(mut config: PipelineConfig, inputs: &[PathBuf], out: &Path, rotation: &str, canvas: Option<u32>) -> Result<()> {
    if let Some(edge) = canvas {
        config.group_layout.canvas = Bound::square(edge);
    }
    let rotation = parse_rotation(rotation)?;
    let files = collect_inputs(inputs)?;
    if files.is_empty() {
        bail!("No images found");
    }
    let config = config.normalized();
    let (layout, quality) = (config.group_layout, config.jpeg_quality);
    let members: Vec<(PathBuf, Rotation)> = files.into_iter().map(|path| (path, rotation)).collect();

    let service = ThumbnailService::new(config)?;
    let thumbnail = service.group_thumbnail_with(&members, &layout)?;
    service.shutdown();

    let format = if out.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("png")) {
        OutputFormat::Png
    } else {
        OutputFormat::Jpeg { quality }
    };
    thumbnail.save(out, format)?;
    println!(
        "Wrote {} ({} of {} pictures shown)",
        out.display(),
        members.len().min(layout.capacity()),
        members.len()
    );
    Ok(())
}

fn show_info(path: &Path, json: bool) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let summary = exif::read_summary(&bytes).unwrap_or_default();
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let loader = ImageLoader::default();
    let image = loader.load(path, summary.rotation)?;

    println!("File:       {}", path.display());
    println!("Decoder:    {}", image.codec());
    println!("Decoded:    {}x{}", image.decoded_width(), image.decoded_height());
    println!("Rotation:   {}°", image.applied_rotation());
    println!("Effective:  {}x{}", image.effective_width(), image.effective_height());
    if let Some(make) = &summary.make {
        println!("Make:       {}", make);
    }
    if let Some(model) = &summary.model {
        println!("Model:      {}", model);
    }
    if let Some(captured) = &summary.captured_at {
        println!("Captured:   {}", captured);
    }
    Ok(())
}

fn clear_cache(config: &PipelineConfig) -> Result<()> {
    let Some(dir) = config.resolved_cache_dir() else {
        println!("Disk cache is disabled");
        return Ok(());
    };
    let cache = ResultCache::new(config)?;
    cache.clear_all()?;
    println!("Cleared thumbnail cache at {}", dir.display());
    Ok(())
}
