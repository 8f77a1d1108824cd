// src/calibration.rs
//
// Neural inverse-depth calibration.
//
// The depth network emits raw inverse depth `n` in its own arbitrary scale.
// Metric depth is recovered as d = scale/n + shift, fit by weighted least
// squares over (1/n_i, d_i) overlap pairs collected while a trusted
// short-range source (the time-of-flight sensor) sees the same frame.
//
// Sample weights decay exponentially with age and scale with the reference
// source's confidence, so the fit follows recent optics/scene conditions.
// The window is bounded; the lowest-weight sample is evicted on overflow.
//
// Confidence is where the inverse-depth error model lives: the 1/n transform
// amplifies sensor noise quadratically with distance, so confidence decays
// toward zero approaching a hard range cap and is exactly zero at and beyond
// it. The distance ESTIMATE itself is never compressed or clamped below the
// cap — only confidence is suppressed.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Bounded sample window capacity.
    pub window_capacity: usize,
    /// Per-second exponential weight decay applied to sample age.
    pub decay_per_s: f64,
    /// Below this many samples the calibrator reports unavailable.
    pub min_samples: usize,
    /// Hard range cap: confidence is exactly 0 at and beyond this depth.
    pub hard_cap_m: f64,
    /// Calibration quality stays at 1.0 for this long after the most
    /// recent overlap sample.
    pub fresh_window_s: f64,
    /// Time constant of the quality decay once the fresh window expires.
    pub quality_decay_tau_s: f64,
    /// Quality never decays below this floor.
    pub quality_floor: f32,
    /// Raw network outputs at or below this are unusable (1/n blows up).
    pub min_raw_inverse: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            window_capacity: 64,
            decay_per_s: 0.97,
            min_samples: 1,
            hard_cap_m: 400.0,
            fresh_window_s: 10.0,
            quality_decay_tau_s: 120.0,
            quality_floor: 0.25,
            min_raw_inverse: 1e-6,
        }
    }
}

// ============================================================================
// MODEL
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct OverlapSample {
    /// 1/n — the regressor.
    inv_raw: f64,
    /// Trusted short-range depth for the same frame — the regressand.
    ref_depth: f64,
    confidence: f32,
    timestamp: f64,
}

impl OverlapSample {
    fn weight(&self, now: f64, decay_per_s: f64) -> f64 {
        let age = (now - self.timestamp).max(0.0);
        decay_per_s.powf(age) * f64::from(self.confidence)
    }
}

#[derive(Debug, Clone)]
pub struct NeuralDepthCalibrator {
    config: CalibrationConfig,
    window: Vec<OverlapSample>,
    scale: f64,
    shift: f64,
    calibrated: bool,
    last_sample_timestamp: f64,
    last_fit_timestamp: f64,
    total_samples: u64,
}

impl NeuralDepthCalibrator {
    pub fn new(config: CalibrationConfig) -> Self {
        Self {
            window: Vec::with_capacity(config.window_capacity),
            scale: 0.0,
            shift: 0.0,
            calibrated: false,
            last_sample_timestamp: 0.0,
            last_fit_timestamp: 0.0,
            total_samples: 0,
            config,
        }
    }

    /// Record one overlap pair (raw network output + trusted reference depth
    /// from the same frame) and refit.
    pub fn add_overlap_sample(
        &mut self,
        raw_inverse_depth: f64,
        reference_depth: f64,
        confidence: f32,
        timestamp: f64,
    ) {
        if !raw_inverse_depth.is_finite()
            || raw_inverse_depth <= self.config.min_raw_inverse
            || !reference_depth.is_finite()
            || reference_depth <= 0.0
            || confidence <= 0.0
        {
            return;
        }

        self.window.push(OverlapSample {
            inv_raw: 1.0 / raw_inverse_depth,
            ref_depth: reference_depth,
            confidence: confidence.min(1.0),
            timestamp,
        });
        self.total_samples += 1;
        self.last_sample_timestamp = timestamp;

        if self.window.len() > self.config.window_capacity {
            self.evict_lowest_weight(timestamp);
        }

        let was_calibrated = self.calibrated;
        self.fit(timestamp);
        if self.calibrated && !was_calibrated {
            info!(
                "📏 Neural calibration established: scale={:.3} shift={:.3} ({} samples)",
                self.scale,
                self.shift,
                self.window.len()
            );
        }
    }

    /// Weighted least squares over d = scale·(1/n) + shift.
    pub fn fit(&mut self, now: f64) -> bool {
        if self.window.len() < self.config.min_samples.max(1) {
            self.calibrated = false;
            return false;
        }

        let mut sw = 0.0f64;
        let mut swx = 0.0f64;
        let mut swy = 0.0f64;
        let mut swxx = 0.0f64;
        let mut swxy = 0.0f64;

        for s in &self.window {
            let w = s.weight(now, self.config.decay_per_s);
            if w <= 0.0 {
                continue;
            }
            sw += w;
            swx += w * s.inv_raw;
            swy += w * s.ref_depth;
            swxx += w * s.inv_raw * s.inv_raw;
            swxy += w * s.inv_raw * s.ref_depth;
        }

        if sw <= 0.0 || swxx <= 0.0 {
            self.calibrated = false;
            return false;
        }

        let denom = sw * swxx - swx * swx;
        if self.window.len() == 1 || denom.abs() < 1e-12 * sw * swxx {
            // Underdetermined (one sample, or all samples at one inverse
            // depth): scale-only fit through the origin, shift held at 0.
            self.scale = swxy / swxx;
            self.shift = 0.0;
        } else {
            self.scale = (sw * swxy - swx * swy) / denom;
            self.shift = (swy * swxx - swx * swxy) / denom;
        }

        self.calibrated = true;
        self.last_fit_timestamp = now;
        debug!(
            "📏 Calibration refit: scale={:.4} shift={:.4} over {} samples",
            self.scale,
            self.shift,
            self.window.len()
        );
        true
    }

    /// Metric depth for a raw network output. None while uncalibrated or
    /// when the output is unusable.
    pub fn metric_depth(&self, raw_inverse_depth: f64) -> Option<f64> {
        if !self.calibrated {
            return None;
        }
        if !raw_inverse_depth.is_finite() || raw_inverse_depth <= self.config.min_raw_inverse {
            return None;
        }
        let d = self.scale / raw_inverse_depth + self.shift;
        if d.is_finite() && d > 0.0 {
            Some(d)
        } else {
            None
        }
    }

    /// Confidence for a neural depth estimate: exactly 0 at and beyond the
    /// hard cap, quadratic decay approaching it (the inverse-depth transform
    /// amplifies sensor noise quadratically with distance), scaled by the
    /// calibration quality term.
    pub fn confidence(&self, depth_m: f64, now: f64) -> f32 {
        if !self.calibrated || !depth_m.is_finite() || depth_m <= 0.0 {
            return 0.0;
        }
        if depth_m >= self.config.hard_cap_m {
            return 0.0;
        }
        let ratio = depth_m / self.config.hard_cap_m;
        let base = (1.0 - ratio * ratio).max(0.0) as f32;
        (base * self.quality(now)).clamp(0.0, 1.0)
    }

    /// Full quality for a short window after the latest overlap sample, then
    /// decay toward a floor — calibration drifts once the device stops
    /// seeing short-range corroborating targets.
    pub fn quality(&self, now: f64) -> f32 {
        if !self.calibrated {
            return 0.0;
        }
        let age = (now - self.last_sample_timestamp).max(0.0);
        if age <= self.config.fresh_window_s {
            return 1.0;
        }
        let decayed =
            (-(age - self.config.fresh_window_s) / self.config.quality_decay_tau_s).exp() as f32;
        (self.config.quality_floor + (1.0 - self.config.quality_floor) * decayed).clamp(0.0, 1.0)
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn shift(&self) -> f64 {
        self.shift
    }

    pub fn sample_count(&self) -> usize {
        self.window.len()
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.scale = 0.0;
        self.shift = 0.0;
        self.calibrated = false;
        self.last_sample_timestamp = 0.0;
        self.last_fit_timestamp = 0.0;
    }

    fn evict_lowest_weight(&mut self, now: f64) {
        let mut min_idx = 0;
        let mut min_weight = f64::INFINITY;
        for (i, s) in self.window.iter().enumerate() {
            let w = s.weight(now, self.config.decay_per_s);
            if w < min_weight {
                min_weight = w;
                min_idx = i;
            }
        }
        self.window.remove(min_idx);
    }
}

// ============================================================================
// TESTS
// ============================================================================
