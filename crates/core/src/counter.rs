//! Tiled point counting and pixel summation.
//!
//! Both counters share one batch engine: the tiles a region touches are
//! loaded and evaluated in parallel on the rayon pool, and every per-tile
//! outcome is sent back over a channel to the calling thread. The calling
//! thread owns the observer and a [`TileBarrier`]; it reports progress for
//! each tile as it arrives, in any order, and produces the aggregate only
//! once every tile has reported. A tile that fails to load or parse still
//! reports, so one bad tile never stalls or aborts the batch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use geo::{Coord, LineString};
use rayon::prelude::*;

use crate::config::{LayerDescriptor, PixelRole};
use crate::geometry::contains;
use crate::tile::{tiles_for, Bounds, TileRef};
use crate::tile_source::{parse_pixels, parse_points, TileSource};
use crate::{Error, Result};

/// Options of one counting batch.
#[derive(Debug, Clone, Default)]
pub struct CountOptions {
    /// Visit only the first `max_tiles` tiles (quick previews)
    pub max_tiles: Option<usize>,
    /// Forward every matched point to [`CountObserver::on_point`]
    pub forward_points: bool,
    /// Set to abandon the batch; remaining tiles are skipped
    pub cancel: Option<Arc<AtomicBool>>,
}

impl CountOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_tiles(mut self, max_tiles: usize) -> Self {
        self.max_tiles = Some(max_tiles);
        self
    }

    pub fn with_forward_points(mut self, forward: bool) -> Self {
        self.forward_points = forward;
        self
    }

    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::Acquire))
            .unwrap_or(false)
    }
}

/// Receives the incremental output of a counting batch.
///
/// All methods are called on the thread that started the batch.
pub trait CountObserver {
    /// `processed` of `total` tiles have reported.
    fn on_progress(&mut self, _processed: usize, _total: usize) {}

    /// A tile failed to load or parse.
    fn on_tile_error(&mut self, _tile: &TileRef, _error: &Error) {}

    /// A point matched the region, in layer coordinates.
    fn on_point(&mut self, _point: Coord<f64>) {}
}

/// Observer that ignores everything.
impl CountObserver for () {}

/// Aggregate of a point counting batch.
#[derive(Debug, Clone, PartialEq)]
pub struct PointCount {
    /// Points inside the region, over successfully read tiles
    pub count: u64,
    /// Tiles visited
    pub total: usize,
    /// Tiles that failed
    pub failed: usize,
    pub elapsed: Duration,
}

/// Aggregate of a pixel summation batch.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelSum {
    pub sum: f64,
    pub role: PixelRole,
    pub total: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

/// Counts tiles down to zero; the batch completes when the last one arrives.
#[derive(Debug)]
pub struct TileBarrier {
    total: usize,
    remaining: usize,
}

impl TileBarrier {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            remaining: total,
        }
    }

    /// Record one tile report. Returns true for the report that releases
    /// the barrier; reports past that point are ignored.
    pub fn arrive(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        self.remaining == 0
    }

    pub fn processed(&self) -> usize {
        self.total - self.remaining
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_released(&self) -> bool {
        self.remaining == 0
    }
}

struct TileOutcome<T> {
    tile: TileRef,
    result: Result<T>,
}

struct BatchSummary<A> {
    acc: A,
    total: usize,
    failed: usize,
    elapsed: Duration,
}

/// Evaluate every tile on the rayon pool, folding successful outcomes into
/// `acc` on the calling thread.
fn run_batch<T, A, W, F>(
    tiles: Vec<TileRef>,
    options: &CountOptions,
    observer: &mut dyn CountObserver,
    mut acc: A,
    work: W,
    mut fold: F,
) -> Result<BatchSummary<A>>
where
    T: Send,
    W: Fn(&TileRef) -> Result<T> + Sync,
    F: FnMut(&mut A, T, &mut dyn CountObserver),
{
    let started = Instant::now();
    let mut barrier = TileBarrier::new(tiles.len());
    let mut failed = 0;

    if tiles.is_empty() {
        return Ok(BatchSummary {
            acc,
            total: 0,
            failed: 0,
            elapsed: started.elapsed(),
        });
    }

    let (tx, rx) = crossbeam_channel::unbounded::<TileOutcome<T>>();

    std::thread::scope(|scope| {
        let work = &work;
        let tiles = &tiles;
        scope.spawn(move || {
            tiles.par_iter().for_each_with(tx, |tx, tile| {
                let result = if options.is_cancelled() {
                    Err(Error::Cancelled)
                } else {
                    work(tile)
                };
                // The receiver only goes away once the batch is abandoned
                let _ = tx.send(TileOutcome {
                    tile: *tile,
                    result,
                });
            });
        });

        for outcome in rx.iter() {
            if options.is_cancelled() {
                break;
            }
            match outcome.result {
                Ok(value) => fold(&mut acc, value, &mut *observer),
                Err(error) => {
                    failed += 1;
                    log::warn!(
                        "Tile ({}, {}) failed: {}",
                        outcome.tile.col,
                        outcome.tile.row,
                        error
                    );
                    observer.on_tile_error(&outcome.tile, &error);
                }
            }
            let released = barrier.arrive();
            observer.on_progress(barrier.processed(), barrier.total());
            if released {
                break;
            }
        }
        drop(rx);
    });

    if !barrier.is_released() {
        return Err(Error::Cancelled);
    }

    Ok(BatchSummary {
        acc,
        total: barrier.total(),
        failed,
        elapsed: started.elapsed(),
    })
}

/// Tiles of `layer` touched by `ring` (all tiles without a ring), capped to
/// `options.max_tiles`.
pub fn plan_tiles(
    ring: Option<&LineString<f64>>,
    layer: &LayerDescriptor,
    options: &CountOptions,
) -> Vec<TileRef> {
    let bounds = ring.and_then(Bounds::of_ring);
    let mut tiles = tiles_for(bounds.as_ref(), &layer.grid());
    if let Some(max) = options.max_tiles {
        tiles.truncate(max);
    }
    tiles
}

struct PointTile {
    count: u64,
    matched: Vec<Coord<f64>>,
}

/// Count the points of `layer` inside `ring`.
///
/// `ring` is in layer coordinates; `None` counts every point of the visited
/// tiles. Fails only for an invalid layer or a cancelled batch; tile errors
/// go to the observer.
pub fn count_points(
    ring: Option<&LineString<f64>>,
    layer: &LayerDescriptor,
    source: &dyn TileSource,
    options: &CountOptions,
    observer: &mut dyn CountObserver,
) -> Result<PointCount> {
    layer.validate()?;
    let template = layer.template()?;
    let vertices: &[Coord<f64>] = ring.map(|r| r.0.as_slice()).unwrap_or(&[]);
    let tiles = plan_tiles(ring, layer, options);

    log::info!(
        "Counting points of layer '{}' over {} tiles",
        layer.name,
        tiles.len()
    );

    let forward = options.forward_points;
    let summary = run_batch(
        tiles,
        options,
        observer,
        0u64,
        |tile| {
            let path = tile.resolve_url(template);
            let bytes = source.load(&path)?;
            let points = parse_points(&path, &bytes)?;

            let mut result = PointTile {
                count: 0,
                matched: Vec::new(),
            };
            for p in points {
                let global = Coord {
                    x: p.x + tile.x,
                    y: p.y + tile.y,
                };
                if contains(global, vertices) {
                    result.count += 1;
                    if forward {
                        result.matched.push(global);
                    }
                }
            }
            log::debug!("Tile {}: {} points inside", path, result.count);
            Ok(result)
        },
        |count, tile: PointTile, observer| {
            *count += tile.count;
            for point in tile.matched {
                observer.on_point(point);
            }
        },
    )?;

    log::info!(
        "Layer '{}': {} points in {:.2?} ({} of {} tiles failed)",
        layer.name,
        summary.acc,
        summary.elapsed,
        summary.failed,
        summary.total
    );

    Ok(PointCount {
        count: summary.acc,
        total: summary.total,
        failed: summary.failed,
        elapsed: summary.elapsed,
    })
}

/// Sum the values of `layer` whose cell centers fall inside `ring`.
///
/// One cell covers one layer unit; cell `(c, r)` of a tile is centered on
/// `(tile.x + c + 0.5, tile.y + r + 0.5)`.
pub fn sum_pixels(
    ring: Option<&LineString<f64>>,
    layer: &LayerDescriptor,
    source: &dyn TileSource,
    options: &CountOptions,
    observer: &mut dyn CountObserver,
) -> Result<PixelSum> {
    layer.validate()?;
    let template = layer.template()?;
    let role = layer
        .role
        .ok_or_else(|| Error::Config(format!("pixels layer '{}' has no role", layer.name)))?;
    let vertices: &[Coord<f64>] = ring.map(|r| r.0.as_slice()).unwrap_or(&[]);
    let tiles = plan_tiles(ring, layer, options);

    log::info!(
        "Summing pixels of layer '{}' ({}) over {} tiles",
        layer.name,
        role,
        tiles.len()
    );

    let summary = run_batch(
        tiles,
        options,
        observer,
        0f64,
        |tile| {
            let path = tile.resolve_url(template);
            let bytes = source.load(&path)?;
            let grid = parse_pixels(&path, &bytes)?;

            let sum: f64 = grid
                .cells()
                .filter(|&(col, row, _)| {
                    let center = Coord {
                        x: tile.x + col as f64 + 0.5,
                        y: tile.y + row as f64 + 0.5,
                    };
                    contains(center, vertices)
                })
                .map(|(_, _, value)| value)
                .sum();
            log::debug!("Tile {}: sum {}", path, sum);
            Ok(sum)
        },
        |total, sum: f64, _| *total += sum,
    )?;

    Ok(PixelSum {
        sum: summary.acc,
        role,
        total: summary.total,
        failed: summary.failed,
        elapsed: summary.elapsed,
    })
}
