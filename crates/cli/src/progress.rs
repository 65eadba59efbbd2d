use std::collections::HashMap;

use anyhow::Result;
use atlas_stats_core::counter::CountObserver;
use atlas_stats_core::region::AnalysisListener;
use atlas_stats_core::tile::TileRef;
use atlas_stats_core::{Error, JobResult, MapContext};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

pub fn create_progress_bar(len: u64, title: impl Into<String>) -> Result<ProgressBar> {
    Ok(ProgressBar::new(len).with_message(title.into()).with_style(
        ProgressStyle::default_bar()
            .template("{msg:<24} [{bar:40.cyan/blue}] {pos:>3}/{len} • {elapsed_precise}")?
            .progress_chars("=>-"),
    ))
}

/// One bar per layer, in percent.
pub struct LayerBars {
    _multi: MultiProgress,
    bars: HashMap<String, ProgressBar>,
}

impl LayerBars {
    pub fn new(map: &MapContext) -> Result<Self> {
        let multi = MultiProgress::new();
        let mut bars = HashMap::new();
        for layer in &map.layers {
            let bar = multi.add(create_progress_bar(100, layer.name.clone())?);
            bars.insert(layer.name.clone(), bar);
        }
        Ok(Self {
            _multi: multi,
            bars,
        })
    }
}

impl AnalysisListener for LayerBars {
    fn on_layer_progress(&self, layer: &str, percent: f64) {
        if let Some(bar) = self.bars.get(layer) {
            bar.set_position(percent.round().clamp(0.0, 100.0) as u64);
        }
    }

    fn on_layer_complete(&self, layer: &str, result: &JobResult) {
        if let Some(bar) = self.bars.get(layer) {
            bar.set_position(100);
            bar.finish_with_message(format!("{} ({:.2?})", layer, result.elapsed()));
        }
    }

    fn on_layer_error(&self, layer: &str, _error: &Error) {
        if let Some(bar) = self.bars.get(layer) {
            bar.abandon_with_message(format!("{} failed", layer));
        }
    }
}

/// Tile progress of a single in-process count.
pub struct TileBar(pub ProgressBar);

impl CountObserver for TileBar {
    fn on_progress(&mut self, processed: usize, total: usize) {
        self.0.set_length(total as u64);
        self.0.set_position(processed as u64);
    }

    fn on_tile_error(&mut self, tile: &TileRef, _error: &Error) {
        self.0
            .set_message(format!("tile ({}, {}) failed", tile.col, tile.row));
    }
}
