//! Messages exchanged with counting workers.
//!
//! The runner writes one [`JobRequest`] as JSON to the worker's stdin. The
//! worker answers with newline-delimited [`JobMessage`]s on stdout: any
//! number of `step`/`tileError` messages, then exactly one `complete` or
//! `error`.

use std::time::Duration;

use geo::{Coord, LineString};
use serde::{Deserialize, Serialize};

use crate::config::{LayerDescriptor, LayerKind, PixelRole};
use crate::geometry::scale_ring;
use crate::{Error, Result};

/// Which counter a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Points,
    Pixels,
}

impl JobKind {
    /// The job kind that queries a layer of `kind`.
    pub fn for_layer(kind: LayerKind) -> Self {
        match kind {
            LayerKind::Points => Self::Points,
            LayerKind::Pixels => Self::Pixels,
        }
    }
}

/// A counting job as sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub kind: JobKind,
    /// Region ring, already scaled into layer coordinates. `None` counts the
    /// whole layer.
    pub polygon: Option<Vec<[f64; 2]>>,
    pub layer: LayerDescriptor,
    /// Visit at most this many tiles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tiles: Option<usize>,
}

impl JobRequest {
    /// Build a request for `layer`, scaling a reference-space ring by
    /// `layer.size / reference_size`.
    pub fn prepare(
        kind: JobKind,
        polygon: Option<&LineString<f64>>,
        layer: &LayerDescriptor,
        reference_size: f64,
    ) -> Result<Self> {
        if JobKind::for_layer(layer.kind) != kind {
            return Err(Error::Config(format!(
                "cannot run a {:?} job on layer '{}' of kind {:?}",
                kind, layer.name, layer.kind
            )));
        }
        if !(reference_size.is_finite() && reference_size > 0.0) {
            return Err(Error::Config(format!(
                "invalid reference size {}",
                reference_size
            )));
        }

        let factor = layer.size / reference_size;
        Ok(Self {
            kind,
            polygon: polygon.map(|ring| {
                scale_ring(ring, factor)
                    .coords()
                    .map(|c| [c.x, c.y])
                    .collect()
            }),
            layer: layer.clone(),
            max_tiles: None,
        })
    }

    /// Cap the number of visited tiles.
    pub fn with_max_tiles(mut self, max_tiles: usize) -> Self {
        self.max_tiles = Some(max_tiles);
        self
    }

    /// The region ring in layer coordinates.
    pub fn ring(&self) -> Option<LineString<f64>> {
        self.polygon.as_ref().map(|vertices| {
            vertices
                .iter()
                .map(|&[x, y]| Coord { x, y })
                .collect()
        })
    }
}

/// Final aggregate of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobResult {
    #[serde(rename_all = "camelCase")]
    Points {
        count: u64,
        /// Number of tiles visited
        total: usize,
        elapsed_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    Pixels {
        sum: f64,
        role: PixelRole,
        elapsed_ms: u64,
    },
}

impl JobResult {
    pub fn elapsed(&self) -> Duration {
        match self {
            Self::Points { elapsed_ms, .. } | Self::Pixels { elapsed_ms, .. } => {
                Duration::from_millis(*elapsed_ms)
            }
        }
    }
}

/// One line of worker output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum JobMessage {
    /// `progress` of `total` tiles have reported
    Step { progress: usize, total: usize },
    /// A tile failed; the job goes on
    TileError { message: String },
    /// Terminal success
    Complete { result: JobResult },
    /// Terminal failure
    Error { message: String },
}

impl JobMessage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    /// Encode as one JSON line, without the newline.
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_line(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim())
            .map_err(|e| Error::Protocol(format!("{}: {:?}", e, line)))
    }
}

/// Step progress as a percentage; an empty batch is complete.
pub fn percent(progress: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        progress as f64 / total as f64 * 100.0
    }
}
