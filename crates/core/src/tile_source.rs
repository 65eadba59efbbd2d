//! Loading and decoding layer tiles.
//!
//! Point tiles are delimited text whose first two fields are the `x, y`
//! offset of a point inside its tile. Pixel tiles are either grayscale
//! images or delimited grids of numbers. Files ending in `.gz` are
//! decompressed before parsing.

use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use geo::Coord;

use crate::{Error, Result};

/// Where tile bytes come from.
pub trait TileSource: Send + Sync {
    /// Load the raw (decompressed) contents of the tile at `path`.
    fn load(&self, path: &str) -> Result<Vec<u8>>;
}

/// Reads tiles from the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsTileSource;

impl TileSource for FsTileSource {
    fn load(&self, path: &str) -> Result<Vec<u8>> {
        let read_err = |source| Error::TileRead {
            path: path.to_string(),
            source,
        };

        let bytes = std::fs::read(path).map_err(read_err)?;
        if !path.ends_with(".gz") {
            return Ok(bytes);
        }

        let mut decoded = Vec::with_capacity(bytes.len() * 4);
        GzDecoder::new(bytes.as_slice())
            .read_to_end(&mut decoded)
            .map_err(read_err)?;
        Ok(decoded)
    }
}

/// Path with a trailing `.gz` removed, for format detection.
fn logical_path(path: &str) -> &str {
    path.strip_suffix(".gz").unwrap_or(path)
}

fn delimiter_for(path: &str) -> u8 {
    let lower = logical_path(path).to_ascii_lowercase();
    if lower.ends_with(".tsv") || lower.ends_with(".txt") {
        b'\t'
    } else {
        b','
    }
}

fn csv_reader<'a>(path: &str, bytes: &'a [u8]) -> csv::Reader<&'a [u8]> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .delimiter(delimiter_for(path))
        .from_reader(bytes)
}

fn parse_field(field: &str) -> Option<f64> {
    field.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Column names: both coordinate fields present and neither a number.
fn is_header(record: &csv::StringRecord) -> bool {
    match (record.get(0), record.get(1)) {
        (Some(x), Some(y)) => [x, y]
            .iter()
            .all(|f| !f.is_empty() && f.parse::<f64>().is_err()),
        _ => false,
    }
}

/// Parse a point tile into in-tile coordinates.
///
/// A first row of column names (two non-numeric fields) is skipped. Any
/// other row without numeric x,y fails the whole tile.
pub fn parse_points(path: &str, bytes: &[u8]) -> Result<Vec<Coord<f64>>> {
    let mut reader = csv_reader(path, bytes);
    let mut points = Vec::new();

    for (index, record) in reader.records().enumerate() {
        let record = record.map_err(|e| Error::TileParse {
            path: path.to_string(),
            line: e.position().map(|p| p.line()).unwrap_or(0),
            reason: e.to_string(),
        })?;
        let line = record.position().map(|p| p.line()).unwrap_or(index as u64 + 1);

        if record.iter().all(|f| f.is_empty()) {
            continue;
        }

        let x = record.get(0).and_then(parse_field);
        let y = record.get(1).and_then(parse_field);
        match (x, y) {
            (Some(x), Some(y)) => points.push(Coord { x, y }),
            _ if index == 0 && is_header(&record) => {
                log::debug!("Skipping header row of {}", path);
            }
            _ => {
                return Err(Error::TileParse {
                    path: path.to_string(),
                    line,
                    reason: format!("expected numeric x,y, got {:?}", record),
                })
            }
        }
    }

    Ok(points)
}

/// A decoded pixel tile, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelGrid {
    pub width: usize,
    pub height: usize,
    values: Vec<f64>,
}

impl PixelGrid {
    pub fn new(width: usize, height: usize, values: Vec<f64>) -> Self {
        debug_assert_eq!(values.len(), width * height);
        Self {
            width,
            height,
            values,
        }
    }

    pub fn get(&self, col: usize, row: usize) -> f64 {
        self.values[row * self.width + col]
    }

    /// Iterate `(col, row, value)` over every cell.
    pub fn cells(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.values
            .iter()
            .enumerate()
            .map(move |(i, &v)| (i % self.width.max(1), i / self.width.max(1), v))
    }
}

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "tif", "tiff", "jpg", "jpeg"];

fn is_image(path: &str) -> bool {
    Path::new(logical_path(path))
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Decode a pixel tile: grayscale image or numeric text grid.
pub fn parse_pixels(path: &str, bytes: &[u8]) -> Result<PixelGrid> {
    if is_image(path) {
        parse_image(path, bytes)
    } else {
        parse_grid(path, bytes)
    }
}

fn parse_image(path: &str, bytes: &[u8]) -> Result<PixelGrid> {
    use image::DynamicImage;

    let image = image::load_from_memory(bytes).map_err(|e| Error::TileParse {
        path: path.to_string(),
        line: 0,
        reason: e.to_string(),
    })?;

    let (width, height) = (image.width() as usize, image.height() as usize);
    let values: Vec<f64> = match image {
        DynamicImage::ImageLuma16(buf) => buf.into_raw().into_iter().map(f64::from).collect(),
        DynamicImage::ImageLuma8(buf) => buf.into_raw().into_iter().map(f64::from).collect(),
        other => other.into_luma8().into_raw().into_iter().map(f64::from).collect(),
    };

    Ok(PixelGrid::new(width, height, values))
}

/// Rows of numbers; short rows are padded with zeros.
fn parse_grid(path: &str, bytes: &[u8]) -> Result<PixelGrid> {
    let mut reader = csv_reader(path, bytes);
    let mut rows: Vec<Vec<f64>> = Vec::new();

    for record in reader.records() {
        let record = record.map_err(|e| Error::TileParse {
            path: path.to_string(),
            line: e.position().map(|p| p.line()).unwrap_or(0),
            reason: e.to_string(),
        })?;
        if record.iter().all(|f| f.is_empty()) {
            continue;
        }

        let line = record.position().map(|p| p.line()).unwrap_or(0);
        let row = record
            .iter()
            .enumerate()
            .map(|(i, field)| {
                parse_field(field).ok_or_else(|| Error::TileParse {
                    path: path.to_string(),
                    line,
                    reason: format!("field {} is not a number: {:?}", i, field),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        rows.push(row);
    }

    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    let height = rows.len();
    let mut values = Vec::with_capacity(width * height);
    for mut row in rows {
        row.resize(width, 0.0);
        values.extend(row);
    }

    Ok(PixelGrid::new(width, height, values))
}
