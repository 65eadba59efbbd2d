//! CLI for atlas-stats - region statistics over tiled map layers
//!
//! This is a thin wrapper around the atlas-stats-core library.

mod progress;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use atlas_stats_core::geometry::validate_ring;
use atlas_stats_core::input::{read_region, CoordOrder};
use atlas_stats_core::runner::{JobState, WorkerCommand};
use atlas_stats_core::tile_source::FsTileSource;
use atlas_stats_core::worker::{execute, run_worker};
use atlas_stats_core::{
    CountOptions, InProcessLauncher, JobKind, JobLauncher, JobRequest, JobRunner, MapContext,
    Region, RegionAnalyzer,
};
use clap::{Args, Parser, Subcommand};

use crate::progress::{create_progress_bar, LayerBars, TileBar};

#[derive(Parser, Debug)]
#[command(
    name = "atlas-stats",
    about = "Count points and sum pixels of tiled map layers inside a region",
    version
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute the statistics of a region over the layers of a map
    Stats(StatsArgs),
    /// Run one layer's counter in this process and print its aggregate
    Count(CountArgs),
    /// Serve one job: request on stdin, messages on stdout
    #[command(hide = true)]
    Worker,
}

#[derive(Args, Debug)]
struct StatsArgs {
    /// Map configuration file
    #[arg(long, value_name = "JSON")]
    map: PathBuf,

    /// Region file: GeoJSON polygon or raw coordinate ring
    #[arg(long, value_name = "JSON")]
    region: PathBuf,

    /// Region positions are lat/lng of the map's simple CRS
    #[arg(long)]
    lat_lng: bool,

    /// Run jobs on threads instead of worker processes
    #[arg(long)]
    in_process: bool,

    /// Fail a job that has not finished after this many seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<f64>,

    /// Only compute these layers (repeatable)
    #[arg(long = "layer", value_name = "NAME")]
    layers: Vec<String>,

    /// Region identifier used in logs
    #[arg(long, default_value = "region")]
    id: String,
}

#[derive(Args, Debug)]
struct CountArgs {
    /// Map configuration file
    #[arg(long, value_name = "JSON")]
    map: PathBuf,

    /// Layer to count
    #[arg(long, value_name = "NAME")]
    layer: String,

    /// Region file; the whole layer is counted without one
    #[arg(long, value_name = "JSON")]
    region: Option<PathBuf>,

    /// Region positions are lat/lng of the map's simple CRS
    #[arg(long)]
    lat_lng: bool,

    /// Visit at most this many tiles
    #[arg(long, value_name = "N")]
    max_tiles: Option<usize>,
}

fn coord_order(lat_lng: bool) -> CoordOrder {
    if lat_lng {
        CoordOrder::LatLng
    } else {
        CoordOrder::Xy
    }
}

fn load_map(path: &Path) -> Result<MapContext> {
    MapContext::from_path(path)
        .with_context(|| format!("Failed to load map configuration {}", path.display()))
}

fn run_stats(args: StatsArgs) -> Result<()> {
    let mut map = load_map(&args.map)?;
    if !args.layers.is_empty() {
        map = map.select(&args.layers).context("Failed to select layers")?;
    }

    let ring = read_region(&args.region, coord_order(args.lat_lng))
        .with_context(|| format!("Failed to read region {}", args.region.display()))?;
    let region = Region::new(args.id.clone(), ring);

    let launcher: Arc<dyn JobLauncher> = if args.in_process {
        Arc::new(InProcessLauncher::default())
    } else {
        let command = WorkerCommand::current_exe().context("Failed to locate worker executable")?;
        let mut runner = JobRunner::new(command);
        if let Some(secs) = args.timeout {
            if !(secs.is_finite() && secs > 0.0) {
                anyhow::bail!("Invalid timeout: {}", secs);
            }
            runner = runner.with_timeout(Duration::from_secs_f64(secs));
        }
        Arc::new(runner)
    };

    let bars = Arc::new(LayerBars::new(&map)?);
    let analyzer = RegionAnalyzer::new(launcher).with_listener(bars);

    let computation = analyzer
        .compute_region_stats(&region, &map)
        .context("Failed to compute region statistics")?;

    let mut failed: Vec<String> = computation
        .launch_errors()
        .iter()
        .map(|(layer, _)| layer.clone())
        .collect();
    for (layer, state) in computation.wait() {
        if state != JobState::Completed {
            log::warn!("Layer '{}' ended as {:?}", layer, state);
            failed.push(layer);
        }
    }

    println!("{}", serde_json::to_string_pretty(&region.stats())?);

    if !failed.is_empty() {
        anyhow::bail!(
            "{} of {} layers failed: {}",
            failed.len(),
            map.layers.len(),
            failed.join(", ")
        );
    }
    Ok(())
}

fn run_count(args: CountArgs) -> Result<()> {
    let map = load_map(&args.map)?;
    let layer = map
        .layer(&args.layer)
        .with_context(|| format!("Unknown layer '{}'", args.layer))?;

    let ring = match &args.region {
        Some(path) => {
            let ring = read_region(path, coord_order(args.lat_lng))
                .with_context(|| format!("Failed to read region {}", path.display()))?;
            validate_ring(&ring)?;
            Some(ring)
        }
        None => None,
    };

    let mut request = JobRequest::prepare(
        JobKind::for_layer(layer.kind),
        ring.as_ref(),
        layer,
        map.reference_size,
    )?;
    if let Some(max) = args.max_tiles {
        request = request.with_max_tiles(max);
    }

    let mut bar = TileBar(create_progress_bar(0, layer.name.clone())?);
    let result = execute(&request, &FsTileSource, &CountOptions::new(), &mut bar)
        .with_context(|| format!("Failed to count layer '{}'", layer.name))?;
    bar.0.finish();

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn run_worker_command() -> Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    run_worker(stdin.lock(), stdout.lock(), &FsTileSource)
        .context("Lost connection to the job runner")?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging; stdout is reserved for results and worker messages
    let log_level = match (&cli.command, cli.verbose) {
        (_, true) => "debug",
        (Command::Worker, false) => "warn",
        _ => "info",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .init();

    match cli.command {
        Command::Stats(args) => run_stats(args),
        Command::Count(args) => run_count(args),
        Command::Worker => run_worker_command(),
    }
}
