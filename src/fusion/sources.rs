// src/fusion/sources.rs
//
// Candidate ingestion: collaborator input types, measurement→candidate
// conversions, and the latest-value hub.
//
// Each depth source runs at its own cadence (the range sensor at tens of Hz,
// neural inference at a few Hz, terrain casts at 1–2 Hz) and publishes its
// latest candidate asynchronously. The fusion step never blocks on a slow
// source: it snapshots the freshest candidate per source and treats anything
// older than that modality's staleness bound as absent. Freshest wins; there
// is no queue and no ordering guarantee across sources.

use crate::types::{DepthCandidate, SourceKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

// ============================================================================
// COLLABORATOR INPUTS
// ============================================================================

/// Near-range time-of-flight sample.
#[derive(Debug, Clone, Copy)]
pub struct SensorDepthSample {
    pub depth_m: f64,
    pub confidence: f32,
}

/// Raw inverse-depth network output for one inference cycle. Metric
/// conversion happens in the calibrator, not here.
#[derive(Debug, Clone, Copy)]
pub struct NeuralInferenceSample {
    pub raw_inverse_depth: f64,
}

/// Detection of an object with known real-world size at the aim point.
#[derive(Debug, Clone)]
pub struct ObjectDetectionSample {
    pub bbox_size_px: f64,
    pub known_size_m: f64,
    pub class_label: String,
    pub confidence: f32,
}

/// Ground-plane inputs: device height over ground and downward pitch.
#[derive(Debug, Clone, Copy)]
pub struct GeometricSample {
    pub device_height_m: f64,
    pub pitch_below_horizontal_deg: f64,
}

/// Device pose at the pose-producing cadence.
#[derive(Debug, Clone, Copy)]
pub struct PoseSample {
    pub position: [f64; 3],
    pub forward: [f64; 3],
    pub timestamp: f64,
}

/// User-confirmed stadiametric bracket.
#[derive(Debug, Clone, Copy)]
pub struct StadiametricReading {
    pub known_size_m: f64,
    pub pixel_separation: f64,
    pub focal_length_px: f64,
}

// ============================================================================
// MEASUREMENT → DEPTH CONVERSIONS
// ============================================================================

/// Stadiametric ranging: distance from a known size and its bracketed pixel
/// separation. A malformed reading is absent, not an error.
pub fn stadiametric_depth(reading: &StadiametricReading) -> Option<f64> {
    if reading.known_size_m <= 0.0
        || reading.pixel_separation <= 1e-6
        || reading.focal_length_px <= 0.0
    {
        return None;
    }
    let d = reading.known_size_m * reading.focal_length_px / reading.pixel_separation;
    d.is_finite().then_some(d)
}

/// Known-object pixel-size ranging.
pub fn object_size_depth(bbox_size_px: f64, known_size_m: f64, focal_length_px: f64) -> Option<f64> {
    if bbox_size_px <= 1e-6 || known_size_m <= 0.0 || focal_length_px <= 0.0 {
        return None;
    }
    let d = known_size_m * focal_length_px / bbox_size_px;
    d.is_finite().then_some(d)
}

/// Ground-plane trigonometry: slant range to where the view axis meets the
/// ground. Only meaningful when the device is actually pitched downward.
pub fn ground_plane_depth(sample: &GeometricSample) -> Option<f64> {
    if sample.device_height_m <= 0.0 {
        return None;
    }
    let pitch = sample.pitch_below_horizontal_deg;
    if !(0.5..=90.0).contains(&pitch) {
        return None;
    }
    let d = sample.device_height_m / pitch.to_radians().sin();
    d.is_finite().then_some(d)
}

// ============================================================================
// STALENESS
// ============================================================================

/// Per-modality staleness bounds. A candidate older than its bound is
/// treated as absent rather than reused indefinitely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StalenessConfig {
    pub lidar_s: f64,
    pub neural_s: f64,
    pub geometric_s: f64,
    pub dem_s: f64,
    pub object_s: f64,
    pub stadiametric_s: f64,
}

impl Default for StalenessConfig {
    fn default() -> Self {
        Self {
            lidar_s: 0.25,
            neural_s: 1.0,
            geometric_s: 1.0,
            dem_s: 3.0,
            object_s: 1.0,
            stadiametric_s: 5.0,
        }
    }
}

impl StalenessConfig {
    pub fn bound(&self, kind: SourceKind) -> f64 {
        match kind {
            SourceKind::Lidar => self.lidar_s,
            SourceKind::Neural => self.neural_s,
            SourceKind::Geometric => self.geometric_s,
            SourceKind::Dem => self.dem_s,
            SourceKind::ObjectSize => self.object_s,
            SourceKind::Stadiametric => self.stadiametric_s,
        }
    }
}

// ============================================================================
// CANDIDATE SET
// ============================================================================

/// The per-frame view of the hub: at most one fresh candidate per source.
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    slots: [Option<DepthCandidate>; 6],
    /// At least one candidate existed but exceeded its staleness bound.
    pub stale_dropped: bool,
}

impl CandidateSet {
    pub fn get(&self, kind: SourceKind) -> Option<DepthCandidate> {
        self.slots[kind.index()]
    }

    pub fn set(&mut self, candidate: DepthCandidate) {
        self.slots[candidate.kind.index()] = Some(candidate);
    }

    pub fn present_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// "LIDAR+DEM+NEURAL" style summary for diagnostics.
    pub fn summary(&self) -> String {
        let parts: Vec<&str> = SourceKind::ALL
            .iter()
            .filter(|k| self.slots[k.index()].is_some())
            .map(|k| k.as_str())
            .collect();
        if parts.is_empty() {
            "-".to_string()
        } else {
            parts.join("+")
        }
    }
}

// ============================================================================
// HUB
// ============================================================================

/// Latest-candidate-per-source slots. Producers publish at their own
/// cadence; the fusion step snapshots once per frame. Single mutex over six
/// slots — writes are a pointer-sized store, contention is negligible.
#[derive(Debug, Default)]
pub struct CandidateHub {
    slots: Mutex<[Option<DepthCandidate>; 6]>,
}

impl CandidateHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a candidate. Freshest wins: an older candidate never
    /// overwrites a newer one for the same source.
    pub fn publish(&self, candidate: DepthCandidate) {
        let mut slots = self.slots.lock();
        let slot = &mut slots[candidate.kind.index()];
        match slot {
            Some(existing) if existing.timestamp > candidate.timestamp => {}
            _ => *slot = Some(candidate),
        }
    }

    /// Remove a source's candidate (e.g. the stadiametric bracket was
    /// dismissed by the operator).
    pub fn retract(&self, kind: SourceKind) {
        self.slots.lock()[kind.index()] = None;
    }

    /// Copy out the fresh candidate per source, applying staleness bounds.
    pub fn snapshot(&self, now: f64, staleness: &StalenessConfig) -> CandidateSet {
        let slots = self.slots.lock();
        let mut set = CandidateSet::default();
        for kind in SourceKind::ALL {
            if let Some(c) = slots[kind.index()] {
                if c.age(now) <= staleness.bound(kind) {
                    set.set(c);
                } else {
                    set.stale_dropped = true;
                }
            }
        }
        set
    }

    pub fn clear(&self) {
        *self.slots.lock() = [None; 6];
    }
}

// ============================================================================
// TESTS
// ============================================================================
