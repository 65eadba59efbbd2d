//! Core library for Atlas region statistics.
//!
//! Given a region polygon drawn over a tiled map, this crate counts the points
//! of tiled point layers that fall inside the region and sums the values of
//! tiled pixel layers, one job per layer. Jobs run in isolated worker
//! processes (or threads) and report progress, per-tile errors and a single
//! final aggregate. Results are merged into the region's statistics record
//! together with calibrated area and volume.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use atlas_stats_core::config::MapContext;
//! use atlas_stats_core::region::{Region, RegionAnalyzer};
//! use atlas_stats_core::runner::{JobRunner, WorkerCommand};
//! use geo::line_string;
//!
//! let map = MapContext::from_path("map.json").unwrap();
//! let region = Region::new(
//!     "r1",
//!     line_string![(x: 0.0, y: 0.0), (x: 100.0, y: 0.0), (x: 100.0, y: 100.0), (x: 0.0, y: 100.0)],
//! );
//!
//! let runner = JobRunner::new(WorkerCommand::current_exe().unwrap());
//! let analyzer = RegionAnalyzer::new(Arc::new(runner));
//! analyzer.compute_region_stats(&region, &map).unwrap().wait();
//!
//! println!("{:?}", region.stats());
//! ```

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub mod config;
pub mod counter;
pub mod geometry;
pub mod input;
pub mod message;
pub mod region;
pub mod roles;
pub mod runner;
pub mod tile;
pub mod tile_source;
pub mod worker;

pub use config::{Calibration, LayerDescriptor, LayerKind, MapContext, PixelRole};
pub use counter::{count_points, sum_pixels, CountObserver, CountOptions, PixelSum, PointCount};
pub use message::{JobKind, JobMessage, JobRequest, JobResult};
pub use region::{Region, RegionAnalyzer, RegionStats};
pub use runner::{InProcessLauncher, JobHandle, JobLauncher, JobObserver, JobRunner};

/// Errors that can occur while computing region statistics
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid region: {0}")]
    Region(String),

    #[error("Failed to read tile {path}: {source}")]
    TileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse tile {path} at line {line}: {reason}")]
    TileParse {
        path: String,
        line: u64,
        reason: String,
    },

    #[error("Worker failed: {0}")]
    Worker(String),

    #[error("Malformed worker message: {0}")]
    Protocol(String),

    #[error("No result from worker within {0:?}")]
    Timeout(Duration),

    #[error("Job was cancelled")]
    Cancelled,

    #[error("Failed to read {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_tile() {
        let err = Error::TileParse {
            path: "/tiles/0_0.csv".to_string(),
            line: 3,
            reason: "field 1 is not a number".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to parse tile /tiles/0_0.csv at line 3: field 1 is not a number"
        );

        let err = Error::TileRead {
            path: "/tiles/1_0.csv".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert!(err.to_string().starts_with("Failed to read tile /tiles/1_0.csv"));
    }
}
