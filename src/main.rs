use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use adaf::grid::DEFAULT_TILE_SIZE;
use adaf::{DetectionKind, GridBuilder, PipelineContext, VectorOutput, VectorWriter, VectorizeOptions, Vectorizer};

#[derive(Parser)]
#[command(name = "adaf")]
#[command(about = "Turn tiled ML predictions into cleaned GIS polygons")]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "ADAF_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the tiles of a raster that overlap valid data, as JSON
    Grid {
        #[arg(value_name = "RASTER")]
        raster: PathBuf,

        #[arg(long, default_value_t = DEFAULT_TILE_SIZE, env = "ADAF_TILE_SIZE")]
        tile_size: u32,
    },
    /// Vectorize existing prediction directories into a GeoPackage
    Vectorize {
        /// "object detection" or "segmentation"
        #[arg(long)]
        mode: String,

        /// Label and prediction directory, as name=dir (repeatable)
        #[arg(long = "label", value_name = "NAME=DIR", required = true, value_parser = parse_label)]
        labels: Vec<(String, PathBuf)>,

        #[arg(long, default_value_t = 0.5)]
        threshold: f64,

        /// Drop polygons whose roundness is not above this (segmentation)
        #[arg(long)]
        roundness: Option<f64>,

        /// Drop polygons whose area is not above this (segmentation)
        #[arg(long)]
        min_area: Option<f64>,

        /// Record the source prediction file of every feature
        #[arg(long)]
        keep_paths: bool,

        /// Fuse overlapping features of the same label
        #[arg(long)]
        merge_overlaps: bool,

        #[arg(long, env = "ADAF_WORKERS")]
        workers: Option<usize>,

        /// Output directory (default: parent of the first prediction directory)
        #[arg(long, value_name = "DIR")]
        out_dir: Option<PathBuf>,

        /// Save the collection after each post-processing step as GeoJSON
        #[arg(long, value_name = "DIR")]
        debug_out: Option<PathBuf>,
    },
}

fn parse_label(s: &str) -> Result<(String, PathBuf), String> {
    match s.split_once('=') {
        Some((name, dir)) if !name.is_empty() && !dir.is_empty() => Ok((name.to_string(), PathBuf::from(dir))),
        _ => Err(format!("expected NAME=DIR, got {:?}", s)),
    }
}

fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "adaf=info" } else { "adaf=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    init_logging(args.verbose, args.log_json);
    let context = PipelineContext::new(args.verbose);

    match args.command {
        Command::Grid { raster, tile_size } => {
            let builder = GridBuilder::new(tile_size)?;
            let (_, grid) = builder.build_from_path(&raster, &context).await?;
            println!("{}", serde_json::to_string_pretty(&grid)?);
        }
        Command::Vectorize {
            mode,
            labels,
            threshold,
            roundness,
            min_area,
            keep_paths,
            merge_overlaps,
            workers,
            out_dir,
            debug_out,
        } => {
            let kind: DetectionKind = mode.parse()?;
            let mut options = VectorizeOptions::new(kind)
                .with_threshold(threshold)
                .with_roundness(roundness)
                .with_min_area(min_area)
                .with_provenance(keep_paths)
                .with_merge_overlaps(merge_overlaps);
            if let Some(workers) = workers {
                options = options.with_workers(workers);
            }
            let out_dir = match out_dir {
                Some(dir) => dir,
                None => labels[0]
                    .1
                    .parent()
                    .map(PathBuf::from)
                    .context("Cannot derive an output directory from the first prediction directory")?,
            };

            let context = match debug_out {
                Some(debug_dir) => context.with_debug(debug_dir)?,
                None => context,
            };
            let vectorizer = Vectorizer::new(options)?;
            let vectorized = vectorizer.vectorize(&labels, &context).await?;
            let output = VectorWriter::write(&vectorized.aggregate.into_collection(), &out_dir, kind).await?;
            match output {
                VectorOutput::Written(path) => println!("{}", path.display()),
                VectorOutput::NoFeatures => println!("No features detected."),
            }
            if !vectorized.skipped.is_empty() {
                eprintln!("Skipped {} unreadable prediction file(s)", vectorized.skipped.len());
            }
        }
    }

    Ok(())
}
