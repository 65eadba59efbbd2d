//! Map configuration: layer descriptors and calibration.
//!
//! The map configuration is the JSON document the map viewer is driven by.
//! Only the parts region statistics need are read here: the reference tile
//! size, calibration factors and the tiled point/pixel layers. Layers of any
//! other type (image tiles, overlays) are ignored.
//!
//! ```json
//! {
//!   "tileSize": 256,
//!   "sizeCal": 1000, "depthCal": 5, "unitCal": "um",
//!   "layers": [
//!     { "name": "cells", "type": "pointsLayer",
//!       "pointsUrlTemplate": "cells/{x}_{y}.csv", "size": 1024, "tileSize": 256 },
//!     { "name": "vessels", "type": "pixelsLayer", "role": "area",
//!       "pixelsUrlTemplate": "vessels/{x}_{y}.png", "size": 512, "tileSize": 256 }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::tile::TileGrid;
use crate::{Error, Result};

/// Kind of tiled dataset a layer holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerKind {
    #[serde(rename = "pointsLayer")]
    Points,
    #[serde(rename = "pixelsLayer")]
    Pixels,
}

impl LayerKind {
    fn from_type_name(name: &str) -> Option<Self> {
        match name {
            "pointsLayer" => Some(Self::Points),
            "pixelsLayer" => Some(Self::Pixels),
            _ => None,
        }
    }
}

/// How the values of a pixel layer are interpreted once summed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelRole {
    Holes,
    Area,
    Density,
    Probability,
}

impl PixelRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Holes => "holes",
            Self::Area => "area",
            Self::Density => "density",
            Self::Probability => "probability",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "holes" => Some(Self::Holes),
            "area" => Some(Self::Area),
            "density" => Some(Self::Density),
            "probability" => Some(Self::Probability),
            _ => None,
        }
    }
}

impl fmt::Display for PixelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tiled dataset queried against regions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerDescriptor {
    /// Unique layer name within a map
    pub name: String,
    #[serde(rename = "type")]
    pub kind: LayerKind,
    /// Tile path template with `{x}` and `{y}` placeholders
    pub url_template: Option<String>,
    /// Full extent of the layer, in layer units
    pub size: f64,
    /// Edge length of one tile, in layer units
    pub tile_size: f64,
    #[serde(rename = "tilex0", default)]
    pub tile_x0: i64,
    #[serde(rename = "tiley0", default)]
    pub tile_y0: i64,
    /// Interpretation of summed values (pixel layers)
    #[serde(default)]
    pub role: Option<PixelRole>,
}

impl LayerDescriptor {
    /// Create a points layer descriptor.
    pub fn points(
        name: impl Into<String>,
        url_template: impl Into<String>,
        size: f64,
        tile_size: f64,
    ) -> Self {
        Self {
            name: name.into(),
            kind: LayerKind::Points,
            url_template: Some(url_template.into()),
            size,
            tile_size,
            tile_x0: 0,
            tile_y0: 0,
            role: None,
        }
    }

    /// Create a pixels layer descriptor.
    pub fn pixels(
        name: impl Into<String>,
        url_template: impl Into<String>,
        size: f64,
        tile_size: f64,
        role: PixelRole,
    ) -> Self {
        Self {
            kind: LayerKind::Pixels,
            role: Some(role),
            ..Self::points(name, url_template, size, tile_size)
        }
    }

    /// Set the tile template origin.
    pub fn with_origin(mut self, x0: i64, y0: i64) -> Self {
        self.tile_x0 = x0;
        self.tile_y0 = y0;
        self
    }

    /// Tiling parameters of this layer.
    pub fn grid(&self) -> TileGrid {
        TileGrid::new(self.size, self.tile_size).with_origin(self.tile_x0, self.tile_y0)
    }

    /// URL template, or a configuration error when the layer has none.
    pub fn template(&self) -> Result<&str> {
        match self.url_template.as_deref() {
            Some(t) if !t.trim().is_empty() => Ok(t),
            _ => Err(Error::Config(format!(
                "layer '{}' has no tile URL template",
                self.name
            ))),
        }
    }

    /// Check the descriptor can drive a counting job.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("layer has an empty name".to_string()));
        }
        self.template()?;
        if !(self.tile_size.is_finite() && self.tile_size > 0.0) {
            return Err(Error::Config(format!(
                "layer '{}' has invalid tile size {}",
                self.name, self.tile_size
            )));
        }
        if !(self.size.is_finite() && self.size > 0.0) {
            return Err(Error::Config(format!(
                "layer '{}' has invalid size {}",
                self.name, self.size
            )));
        }
        if self.kind == LayerKind::Pixels && self.role.is_none() {
            return Err(Error::Config(format!(
                "pixels layer '{}' has no role",
                self.name
            )));
        }
        Ok(())
    }
}

/// Factors converting reference-space measurements to physical units.
#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    /// Physical length of the full reference extent
    pub size_cal: f64,
    /// Physical depth of the imaged section
    pub depth_cal: f64,
    /// Unit suffix used in stat keys
    pub unit: String,
}

impl Calibration {
    pub fn new(size_cal: f64, depth_cal: f64, unit: impl Into<String>) -> Self {
        Self {
            size_cal,
            depth_cal,
            unit: unit.into(),
        }
    }

    /// Identity calibration for a map of the given reference size.
    pub fn uncalibrated(reference_size: f64) -> Self {
        Self::new(reference_size, 1.0, "px")
    }

    pub fn area_key(&self) -> String {
        format!("area_cal_{}", self.unit)
    }

    pub fn volume_key(&self) -> String {
        format!("volume_cal_{}", self.unit)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMapConfig {
    tile_size: f64,
    size_cal: Option<f64>,
    depth_cal: Option<f64>,
    unit_cal: Option<String>,
    #[serde(default)]
    layers: Vec<RawLayer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLayer {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    url_template: Option<String>,
    tiles_url_template: Option<String>,
    points_url_template: Option<String>,
    pixels_url_template: Option<String>,
    size: Option<f64>,
    tile_size: Option<f64>,
    #[serde(rename = "tilex0", default)]
    tile_x0: i64,
    #[serde(rename = "tiley0", default)]
    tile_y0: i64,
    role: Option<String>,
}

impl RawLayer {
    fn into_descriptor(
        self,
        kind: LayerKind,
        reference_size: f64,
        base_dir: Option<&Path>,
    ) -> Result<LayerDescriptor> {
        let specific = match kind {
            LayerKind::Points => self.points_url_template,
            LayerKind::Pixels => self.pixels_url_template,
        };
        let url_template = specific
            .or(self.url_template)
            .or(self.tiles_url_template)
            .map(|t| resolve_template(&t, base_dir));

        let role = match (kind, self.role) {
            (LayerKind::Pixels, Some(role)) => Some(PixelRole::parse(&role).ok_or_else(|| {
                Error::Config(format!("layer '{}' has unknown role '{}'", self.name, role))
            })?),
            _ => None,
        };

        let size = self.size.unwrap_or(reference_size);
        Ok(LayerDescriptor {
            name: self.name,
            kind,
            url_template,
            size,
            tile_size: self.tile_size.unwrap_or(size),
            tile_x0: self.tile_x0,
            tile_y0: self.tile_y0,
            role,
        })
    }
}

/// Join relative file templates onto the configuration directory.
fn resolve_template(template: &str, base_dir: Option<&Path>) -> String {
    match base_dir {
        Some(dir) if !template.contains("://") && Path::new(template).is_relative() => {
            dir.join(template).to_string_lossy().into_owned()
        }
        _ => template.to_string(),
    }
}

/// Everything region statistics need to know about a map.
#[derive(Debug, Clone, PartialEq)]
pub struct MapContext {
    /// Native tile size of the map; regions are drawn in this space
    pub reference_size: f64,
    pub calibration: Calibration,
    pub layers: Vec<LayerDescriptor>,
}

impl MapContext {
    pub fn new(reference_size: f64, calibration: Calibration) -> Self {
        Self {
            reference_size,
            calibration,
            layers: Vec::new(),
        }
    }

    /// Add a layer.
    pub fn with_layer(mut self, layer: LayerDescriptor) -> Self {
        self.layers.push(layer);
        self
    }

    /// Load a map configuration file; relative templates resolve against
    /// the file's directory.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| Error::File {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path.parent().map(PathBuf::from);
        Self::from_json_str(&content, base_dir.as_deref())
    }

    /// Parse a map configuration document.
    pub fn from_json_str(json: &str, base_dir: Option<&Path>) -> Result<Self> {
        let raw: RawMapConfig = serde_json::from_str(json)?;

        if !(raw.tile_size.is_finite() && raw.tile_size > 0.0) {
            return Err(Error::Config(format!(
                "map tileSize must be positive, got {}",
                raw.tile_size
            )));
        }

        let calibration = Calibration::new(
            raw.size_cal.unwrap_or(raw.tile_size),
            raw.depth_cal.unwrap_or(1.0),
            raw.unit_cal.unwrap_or_else(|| "px".to_string()),
        );

        let mut seen = HashSet::new();
        let mut layers = Vec::new();
        for raw_layer in raw.layers {
            if !seen.insert(raw_layer.name.clone()) {
                return Err(Error::Config(format!(
                    "duplicate layer name '{}'",
                    raw_layer.name
                )));
            }
            let Some(kind) = LayerKind::from_type_name(&raw_layer.kind) else {
                log::debug!(
                    "Ignoring layer '{}' of type '{}'",
                    raw_layer.name,
                    raw_layer.kind
                );
                continue;
            };
            layers.push(raw_layer.into_descriptor(kind, raw.tile_size, base_dir)?);
        }

        Ok(Self {
            reference_size: raw.tile_size,
            calibration,
            layers,
        })
    }

    pub fn layer(&self, name: &str) -> Option<&LayerDescriptor> {
        self.layers.iter().find(|l| l.name == name)
    }

    pub fn points_layers(&self) -> impl Iterator<Item = &LayerDescriptor> {
        self.layers.iter().filter(|l| l.kind == LayerKind::Points)
    }

    pub fn pixels_layers(&self) -> impl Iterator<Item = &LayerDescriptor> {
        self.layers.iter().filter(|l| l.kind == LayerKind::Pixels)
    }

    /// Restrict the map to the named layers.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Self> {
        let mut layers = Vec::with_capacity(names.len());
        for name in names {
            let layer = self
                .layer(name.as_ref())
                .ok_or_else(|| Error::Config(format!("unknown layer '{}'", name.as_ref())))?;
            layers.push(layer.clone());
        }
        Ok(Self {
            layers,
            ..self.clone()
        })
    }

    /// Factor mapping reference-space coordinates into `layer` space.
    pub fn scale_for(&self, layer: &LayerDescriptor) -> f64 {
        layer.size / self.reference_size
    }
}
