//! Region statistics orchestration.
//!
//! [`RegionAnalyzer::compute_region_stats`] measures a region's geometry and
//! launches one counting job per configured layer. Each job's completion is
//! merged into the region's [`RegionStats`]; when every job has reported,
//! the configured [`RoleDerivation`] adds role-specific metrics.
//!
//! Stat keys (`<unit>` is the calibration unit, `<layer>` the layer name):
//!
//! | key | value |
//! |-----|-------|
//! | `area_px` | shoelace area in reference units |
//! | `area_cal_<unit>` | calibrated area |
//! | `volume_cal_<unit>` | calibrated area times depth |
//! | `<layer>` | points inside the region |
//! | `area_cal_density_<layer>` | points per calibrated area |
//! | `volume_cal_density_<layer>` | points per calibrated volume |
//! | `<layer>_<role>_sum_raw` | summed pixel values |

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use geo::LineString;
use serde::Serialize;

use crate::config::{LayerDescriptor, MapContext, PixelRole};
use crate::geometry::{ring_from_lat_lng, shoelace_area, validate_ring};
use crate::message::{JobKind, JobResult};
use crate::roles::{CalibratedRoles, DerivationContext, RoleDerivation};
use crate::runner::{JobHandle, JobLauncher, JobObserver, JobState};
use crate::{Error, Result};

/// Metric name to value, ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RegionStats(BTreeMap<String, f64>);

impl RegionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: f64) {
        self.0.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<f64> {
        self.0.remove(key)
    }

    /// Copy every entry of `other` over this record.
    pub fn merge(&mut self, other: &RegionStats) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), *value);
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Key of a pixel layer's raw sum.
pub fn sum_key(layer: &str, role: PixelRole) -> String {
    format!("{}_{}_sum_raw", layer, role)
}

/// Area and volume of a region.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometryStats {
    /// Area in reference units
    pub area_px: f64,
    pub area_cal: f64,
    pub volume_cal: f64,
}

impl GeometryStats {
    pub fn compute(ring: &LineString<f64>, map: &MapContext) -> Self {
        let area_px = shoelace_area(ring);
        let scale = map.calibration.size_cal / map.reference_size;
        let area_cal = area_px * scale * scale;
        Self {
            area_px,
            area_cal,
            volume_cal: area_cal * map.calibration.depth_cal,
        }
    }

    fn write_to(&self, stats: &mut RegionStats, map: &MapContext) {
        stats.insert("area_px", self.area_px);
        stats.insert(map.calibration.area_key(), self.area_cal);
        stats.insert(map.calibration.volume_key(), self.volume_cal);
    }
}

fn lock_stats(stats: &Mutex<RegionStats>) -> MutexGuard<'_, RegionStats> {
    stats.lock().unwrap_or_else(|e| e.into_inner())
}

/// A user-drawn region and its statistics record.
#[derive(Debug, Clone)]
pub struct Region {
    id: String,
    ring: LineString<f64>,
    stats: Arc<Mutex<RegionStats>>,
}

impl Region {
    /// Create a region from a ring in reference coordinates.
    pub fn new(id: impl Into<String>, ring: LineString<f64>) -> Self {
        Self {
            id: id.into(),
            ring,
            stats: Arc::new(Mutex::new(RegionStats::new())),
        }
    }

    /// Create a region from `(lat, lng)` pairs of a simple map CRS.
    pub fn from_lat_lng(id: impl Into<String>, lat_lngs: &[(f64, f64)]) -> Self {
        Self::new(id, ring_from_lat_lng(lat_lngs))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ring(&self) -> &LineString<f64> {
        &self.ring
    }

    /// Snapshot of the statistics record.
    pub fn stats(&self) -> RegionStats {
        lock_stats(&self.stats).clone()
    }

    pub fn stat(&self, key: &str) -> Option<f64> {
        lock_stats(&self.stats).get(key)
    }
}

/// Notified as the jobs of a region computation progress.
///
/// Called from job threads; implementations must be thread safe.
pub trait AnalysisListener: Send + Sync {
    fn on_layer_progress(&self, _layer: &str, _percent: f64) {}

    fn on_layer_tile_error(&self, _layer: &str, _message: &str) {}

    fn on_layer_complete(&self, _layer: &str, _result: &JobResult) {}

    fn on_layer_error(&self, _layer: &str, _error: &Error) {}

    /// Every job has reported and derived metrics are in place.
    fn on_region_complete(&self, _region: &str, _stats: &RegionStats) {}
}

type CompletionHook = Box<dyn FnOnce() + Send>;

/// Outstanding-job counter; runs its hook when the last job reports.
struct Completion {
    remaining: AtomicUsize,
    hook: Mutex<Option<CompletionHook>>,
}

impl Completion {
    fn new(jobs: usize, hook: CompletionHook) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(jobs),
            hook: Mutex::new(Some(hook)),
        })
    }

    fn arrive(&self) {
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.run_hook();
        }
    }

    fn run_hook(&self) {
        let hook = self
            .hook
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

/// Merges one layer's job outcome into the region's record.
struct LayerObserver {
    layer: LayerDescriptor,
    stats: Arc<Mutex<RegionStats>>,
    geometry: GeometryStats,
    completion: Arc<Completion>,
    listener: Option<Arc<dyn AnalysisListener>>,
}

impl LayerObserver {
    fn merge(&self, result: &JobResult) {
        let name = &self.layer.name;
        let mut stats = lock_stats(&self.stats);

        match *result {
            JobResult::Points { count, .. } => {
                let count = count as f64;
                stats.insert(name.as_str(), count);

                let area_key = format!("area_cal_density_{}", name);
                let volume_key = format!("volume_cal_density_{}", name);
                if self.geometry.area_cal > 0.0 {
                    stats.insert(area_key, count / self.geometry.area_cal);
                } else {
                    stats.remove(&area_key);
                }
                if self.geometry.volume_cal > 0.0 {
                    stats.insert(volume_key, count / self.geometry.volume_cal);
                } else {
                    stats.remove(&volume_key);
                }
            }
            JobResult::Pixels { sum, role, .. } => {
                stats.insert(sum_key(name, role), sum);
            }
        }
    }
}

impl JobObserver for LayerObserver {
    fn on_progress(&mut self, percent: f64) {
        if let Some(listener) = &self.listener {
            listener.on_layer_progress(&self.layer.name, percent);
        }
    }

    fn on_tile_error(&mut self, message: &str) {
        log::warn!("Layer '{}': {}", self.layer.name, message);
        if let Some(listener) = &self.listener {
            listener.on_layer_tile_error(&self.layer.name, message);
        }
    }

    fn on_complete(&mut self, result: JobResult) {
        self.merge(&result);
        if let Some(listener) = &self.listener {
            listener.on_layer_complete(&self.layer.name, &result);
        }
        self.completion.arrive();
    }

    fn on_error(&mut self, error: Error) {
        log::error!("Layer '{}' failed: {}", self.layer.name, error);
        if let Some(listener) = &self.listener {
            listener.on_layer_error(&self.layer.name, &error);
        }
        self.completion.arrive();
    }
}

/// Jobs launched for one region.
pub struct RegionComputation {
    region: String,
    jobs: Vec<JobHandle>,
    launch_errors: Vec<(String, Error)>,
    completion: Arc<Completion>,
}

impl RegionComputation {
    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn jobs(&self) -> &[JobHandle] {
        &self.jobs
    }

    /// Layers whose job could not be started.
    pub fn launch_errors(&self) -> &[(String, Error)] {
        &self.launch_errors
    }

    /// Cancel the job of one layer; the others continue. The cancelled job
    /// counts as reported, so the region still completes once the others do.
    pub fn cancel_layer(&self, layer: &str) {
        for job in self.jobs.iter().filter(|j| j.layer() == layer) {
            if job.cancel() {
                self.completion.arrive();
            }
        }
    }

    /// Abandon the region: cancel every job. The completion hook does not run
    /// unless it already has.
    pub fn cancel(&self) {
        for job in &self.jobs {
            job.cancel();
        }
    }

    /// Block until every job has ended; returns each layer's final state.
    pub fn wait(self) -> Vec<(String, JobState)> {
        self.jobs
            .into_iter()
            .map(|job| {
                let layer = job.layer().to_string();
                (layer, job.wait())
            })
            .collect()
    }
}

/// Computes region statistics against a map's layers.
#[derive(Clone)]
pub struct RegionAnalyzer {
    launcher: Arc<dyn JobLauncher>,
    derivation: Arc<dyn RoleDerivation>,
    listener: Option<Arc<dyn AnalysisListener>>,
}

impl RegionAnalyzer {
    pub fn new(launcher: Arc<dyn JobLauncher>) -> Self {
        Self {
            launcher,
            derivation: Arc::new(CalibratedRoles),
            listener: None,
        }
    }

    /// Replace the per-role post-processing run once all jobs report.
    pub fn with_derivation(mut self, derivation: Arc<dyn RoleDerivation>) -> Self {
        self.derivation = derivation;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn AnalysisListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Measure `region` and launch one job per layer of `map`.
    ///
    /// Geometry stats are written before this returns; layer stats arrive as
    /// jobs complete. A layer whose job cannot start is recorded in
    /// [`RegionComputation::launch_errors`] and does not stop the others.
    pub fn compute_region_stats(
        &self,
        region: &Region,
        map: &MapContext,
    ) -> Result<RegionComputation> {
        validate_ring(region.ring())?;

        let geometry = GeometryStats::compute(region.ring(), map);
        geometry.write_to(&mut lock_stats(&region.stats), map);

        log::info!(
            "Region '{}': area {:.1} px, {} layers",
            region.id(),
            geometry.area_px,
            map.layers.len()
        );

        let hook: CompletionHook = {
            let stats = Arc::clone(&region.stats);
            let derivation = Arc::clone(&self.derivation);
            let listener = self.listener.clone();
            let map = map.clone();
            let region_id = region.id().to_string();
            Box::new(move || {
                let snapshot = {
                    let mut stats = lock_stats(&stats);
                    let ctx = DerivationContext {
                        geometry: &geometry,
                        map: &map,
                    };
                    derivation.derive(&ctx, &mut stats);
                    stats.clone()
                };
                log::info!("Region '{}' complete: {} stats", region_id, snapshot.len());
                if let Some(listener) = listener {
                    listener.on_region_complete(&region_id, &snapshot);
                }
            })
        };
        let completion = Completion::new(map.layers.len(), hook);
        if map.layers.is_empty() {
            completion.run_hook();
        }

        let mut jobs = Vec::with_capacity(map.layers.len());
        let mut launch_errors = Vec::new();

        for layer in &map.layers {
            let observer = LayerObserver {
                layer: layer.clone(),
                stats: Arc::clone(&region.stats),
                geometry,
                completion: Arc::clone(&completion),
                listener: self.listener.clone(),
            };

            let started = self.launcher.start(
                JobKind::for_layer(layer.kind),
                Some(region.ring()),
                layer,
                map.reference_size,
                Box::new(observer),
            );

            match started {
                Ok(job) => jobs.push(job),
                Err(error) => {
                    log::error!("Could not start job for layer '{}': {}", layer.name, error);
                    if let Some(listener) = &self.listener {
                        listener.on_layer_error(&layer.name, &error);
                    }
                    launch_errors.push((layer.name.clone(), error));
                    completion.arrive();
                }
            }
        }

        Ok(RegionComputation {
            region: region.id().to_string(),
            jobs,
            launch_errors,
            completion,
        })
    }
}
