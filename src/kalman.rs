// src/kalman.rs
//
// Single-hypothesis depth tracker: a 1D constant-velocity Kalman filter
// over (depth, range-rate), one instance per hypothesis.
//
// The foreground and background hypotheses each own one KalmanTrack and the
// two never share state. The owning selector resets a track whenever its
// source switches — blending filter state across semantically different
// sources (a 2 m occluder vs 1600 m terrain) is exactly the failure mode
// this module exists to avoid.
//
// Measurement noise is confidence- and distance-scaled: inverse-depth
// calibration amplifies disparity noise quadratically with distance, so R
// grows quadratically past the handover band — but is capped, because an
// uncapped R collapses the gain and makes the filter unresponsive to valid
// new long-range measurements.

use crate::types::MotionState;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KalmanConfig {
    /// Base measurement variance (m²) at full confidence in the near band.
    pub base_noise: f64,

    /// Process noise intensity per motion classification.
    pub q_stationary: f64,
    pub q_tracking: f64,
    pub q_panning: f64,

    /// Below this elapsed time the update is a no-op (avoids near-zero dt).
    pub min_dt_s: f64,

    /// Above this elapsed time the filter reinitializes from the new
    /// measurement instead of extrapolating across the gap.
    pub max_gap_s: f64,

    /// Depth is floored to this after any update.
    pub min_depth_m: f64,

    /// Range-sensor band where the distance factor stays flat.
    pub near_band_max_m: f64,
    /// Handover band where the factor ramps up to `handover_factor`.
    pub handover_band_max_m: f64,
    /// Beyond this depth the factor grows quadratically.
    pub quad_growth_start_m: f64,
    /// Factor at the top of the handover band.
    pub handover_factor: f64,
    /// Cap on the distance factor.
    pub max_distance_factor: f64,

    /// Innovation covariance below this is treated as degenerate.
    pub innovation_eps: f64,

    /// Covariance diagonal used when (re)initializing from a measurement.
    pub initial_variance: f64,
}

impl Default for KalmanConfig {
    fn default() -> Self {
        Self {
            base_noise: 0.05,
            q_stationary: 0.05,
            q_tracking: 0.5,
            q_panning: 2.0,
            min_dt_s: 1e-3,
            max_gap_s: 2.0,
            min_depth_m: 0.1,
            near_band_max_m: 5.0,
            handover_band_max_m: 15.0,
            quad_growth_start_m: 50.0,
            handover_factor: 4.0,
            max_distance_factor: 600.0,
            innovation_eps: 1e-9,
            initial_variance: 1.0,
        }
    }
}

// ============================================================================
// COVARIANCE
// ============================================================================

/// Symmetric 2×2 covariance with named accessors. Replaces the original
/// tuple-of-fields representation to keep the filter algebra index-free.
#[derive(Debug, Clone, Copy)]
pub struct Cov2 {
    pub p00: f64,
    pub p01: f64,
    pub p11: f64,
}

impl Cov2 {
    fn diagonal(v: f64) -> Self {
        Self {
            p00: v,
            p01: 0.0,
            p11: v,
        }
    }
}

// ============================================================================
// TRACK
// ============================================================================

/// One tracked depth hypothesis.
#[derive(Debug, Clone)]
pub struct KalmanTrack {
    config: KalmanConfig,
    depth: f64,
    velocity: f64,
    cov: Cov2,
    last_timestamp: f64,
    initialized: bool,
}

impl KalmanTrack {
    pub fn new(config: KalmanConfig) -> Self {
        Self {
            config,
            depth: 0.0,
            velocity: 0.0,
            cov: Cov2::diagonal(1.0),
            last_timestamp: 0.0,
            initialized: false,
        }
    }

    /// Extrapolated depth at `at` without mutating state.
    /// None while uninitialized.
    pub fn predict(&self, at: f64) -> Option<f64> {
        if !self.initialized {
            return None;
        }
        let dt = (at - self.last_timestamp).max(0.0);
        Some((self.depth + self.velocity * dt).max(self.config.min_depth_m))
    }

    /// Predict-then-correct with a new measurement. The first call after
    /// construction or `reset()` initializes state directly from the
    /// measurement (velocity 0, unit covariance) — no filter equations run.
    pub fn update(
        &mut self,
        measurement: f64,
        confidence: f32,
        motion: MotionState,
        timestamp: f64,
    ) -> f64 {
        if !self.initialized {
            return self.initialize(measurement, timestamp);
        }

        let dt = timestamp - self.last_timestamp;
        if dt < self.config.min_dt_s {
            return self.depth;
        }
        if dt > self.config.max_gap_s {
            debug!(
                "⏱️ Track gap {:.2}s > {:.2}s — reinitializing from measurement",
                dt, self.config.max_gap_s
            );
            return self.initialize(measurement, timestamp);
        }

        // ── PREDICT ─────────────────────────────────────────────
        // Constant-velocity transition with discretized CV process noise.
        let q = self.process_noise(motion);
        let dt2 = dt * dt;
        self.depth += self.velocity * dt;
        let p00 = self.cov.p00 + 2.0 * dt * self.cov.p01 + dt2 * self.cov.p11 + q * dt2 * dt / 3.0;
        let p01 = self.cov.p01 + dt * self.cov.p11 + q * dt2 / 2.0;
        let p11 = self.cov.p11 + q * dt;
        self.cov = Cov2 { p00, p01, p11 };

        // ── CORRECT ─────────────────────────────────────────────
        let r = self.measurement_noise(measurement, confidence);
        let s = self.cov.p00 + r;
        if s <= self.config.innovation_eps {
            warn!("📉 Degenerate innovation covariance — skipping correction");
            self.last_timestamp = timestamp;
            self.depth = self.depth.max(self.config.min_depth_m);
            return self.depth;
        }

        let k0 = self.cov.p00 / s;
        let k1 = self.cov.p01 / s;
        let innovation = measurement - self.depth;

        self.depth += k0 * innovation;
        self.velocity += k1 * innovation;
        self.cov = Cov2 {
            p00: (1.0 - k0) * self.cov.p00,
            p01: (1.0 - k0) * self.cov.p01,
            p11: self.cov.p11 - k1 * self.cov.p01,
        };

        self.depth = self.depth.max(self.config.min_depth_m);
        self.last_timestamp = timestamp;
        self.depth
    }

    /// Clear to uninitialized. The next update initializes from scratch.
    pub fn reset(&mut self) {
        self.depth = 0.0;
        self.velocity = 0.0;
        self.cov = Cov2::diagonal(1.0);
        self.last_timestamp = 0.0;
        self.initialized = false;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn depth(&self) -> Option<f64> {
        if self.initialized {
            Some(self.depth)
        } else {
            None
        }
    }

    /// Tracking uncertainty: sqrt of the depth variance.
    pub fn uncertainty(&self) -> Option<f64> {
        if self.initialized {
            Some(self.cov.p00.max(0.0).sqrt())
        } else {
            None
        }
    }

    pub fn velocity(&self) -> f64 {
        self.velocity
    }

    pub fn covariance(&self) -> Cov2 {
        self.cov
    }

    fn initialize(&mut self, measurement: f64, timestamp: f64) -> f64 {
        self.depth = measurement.max(self.config.min_depth_m);
        self.velocity = 0.0;
        self.cov = Cov2::diagonal(self.config.initial_variance);
        self.last_timestamp = timestamp;
        self.initialized = true;
        self.depth
    }

    fn process_noise(&self, motion: MotionState) -> f64 {
        match motion {
            MotionState::Stationary => self.config.q_stationary,
            MotionState::Tracking => self.config.q_tracking,
            MotionState::Panning => self.config.q_panning,
        }
    }

    fn measurement_noise(&self, depth: f64, confidence: f32) -> f64 {
        let conf = f64::from(confidence.clamp(0.01, 1.0));
        self.config.base_noise * (1.0 / conf) * self.distance_factor(depth)
    }

    /// Piecewise distance factor: flat in the range-sensor band, ramping
    /// through the handover band, quadratic past `quad_growth_start_m`,
    /// capped so the gain never collapses at extreme range.
    fn distance_factor(&self, depth: f64) -> f64 {
        let c = &self.config;
        if depth <= c.near_band_max_m {
            1.0
        } else if depth <= c.handover_band_max_m {
            let t = (depth - c.near_band_max_m) / (c.handover_band_max_m - c.near_band_max_m);
            1.0 + t * (c.handover_factor - 1.0)
        } else if depth <= c.quad_growth_start_m {
            c.handover_factor
        } else {
            let ratio = depth / c.quad_growth_start_m;
            (c.handover_factor * ratio * ratio).min(c.max_distance_factor)
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn track() -> KalmanTrack {
        KalmanTrack::new(KalmanConfig::default())
    }

    #[test]
    fn test_first_update_initializes_exactly() {
        let mut t = track();
        assert!(t.predict(0.0).is_none());

        let d = t.update(12.5, 0.9, MotionState::Stationary, 1.0);
        assert_eq!(d, 12.5);
        assert!(t.is_initialized());
        assert_eq!(t.velocity(), 0.0);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut t = track();
        t.update(12.5, 0.9, MotionState::Stationary, 1.0);
        t.reset();
        assert!(!t.is_initialized());
        assert!(t.predict(2.0).is_none());

        // First post-reset update initializes from the new measurement —
        // no blending with pre-reset state.
        let d = t.update(400.0, 0.5, MotionState::Stationary, 2.0);
        assert_eq!(d, 400.0);
    }

    #[test]
    fn test_convergence_to_stationary_depth() {
        let mut t = track();
        let true_depth = 12.0;

        for i in 0..300 {
            let noise = (((i * 7 + 3) % 11) as f64 - 5.0) * 0.05; // deterministic
            let ts = i as f64 / 30.0;
            t.update(true_depth + noise, 0.9, MotionState::Stationary, ts);
        }

        let d = t.depth().unwrap();
        assert!(
            (d - true_depth).abs() < 0.2,
            "Expected ≈{}, got {}",
            true_depth,
            d
        );
    }

    #[test]
    fn test_uncertainty_decreases_until_steady_state() {
        let mut t = track();
        t.update(10.0, 0.9, MotionState::Stationary, 0.0);
        let mut prev = t.uncertainty().unwrap();

        for i in 1..=10 {
            let ts = i as f64 / 30.0;
            t.update(10.0, 0.9, MotionState::Stationary, ts);
            let u = t.uncertainty().unwrap();
            assert!(u < prev, "uncertainty should shrink: {} vs {}", u, prev);
            prev = u;
        }
        assert!(prev < 0.5);
    }

    #[test]
    fn test_predict_then_update_round_trip() {
        let mut t = track();
        for i in 0..20 {
            t.update(30.0, 0.8, MotionState::Tracking, i as f64 / 30.0);
        }

        let at = 20.0 / 30.0;
        let predicted = t.predict(at).unwrap();
        let updated = t.update(predicted, 0.8, MotionState::Tracking, at);

        // Perfect prediction → zero innovation → no spurious correction.
        assert!(
            (updated - predicted).abs() < 1e-9,
            "predicted {} vs updated {}",
            predicted,
            updated
        );
    }

    #[test]
    fn test_tiny_dt_is_noop() {
        let mut t = track();
        t.update(10.0, 0.9, MotionState::Stationary, 1.0);
        let d = t.update(50.0, 0.9, MotionState::Stationary, 1.0 + 1e-5);
        assert_eq!(d, 10.0);
    }

    #[test]
    fn test_long_gap_reinitializes() {
        let mut t = track();
        for i in 0..30 {
            t.update(10.0, 0.9, MotionState::Stationary, i as f64 / 30.0);
        }

        // App suspended for 10 s, scene changed entirely.
        let d = t.update(900.0, 0.5, MotionState::Stationary, 11.0);
        assert_eq!(d, 900.0, "should adopt the new measurement outright");
        assert_eq!(t.velocity(), 0.0);
    }

    #[test]
    fn test_depth_floor() {
        let mut t = track();
        t.update(0.5, 0.9, MotionState::Stationary, 0.0);
        let d = t.update(0.001, 0.9, MotionState::Stationary, 0.1);
        assert!(d >= KalmanConfig::default().min_depth_m);
    }

    #[test]
    fn test_distance_factor_shape() {
        let t = track();
        assert!((t.distance_factor(2.0) - 1.0).abs() < 1e-9);
        assert!(t.distance_factor(10.0) > 1.0);
        assert!(t.distance_factor(10.0) < t.distance_factor(40.0) + 1e-9);
        // Quadratic growth past 50 m...
        let f100 = t.distance_factor(100.0);
        let f200 = t.distance_factor(200.0);
        assert!((f200 / f100 - 4.0).abs() < 1e-6);
        // ...but capped so far measurements still move the filter.
        assert!(t.distance_factor(5000.0) <= KalmanConfig::default().max_distance_factor);
    }

    #[test]
    fn test_responds_to_real_motion() {
        let mut t = track();
        // Target closing at 3 m/s.
        for i in 0..120 {
            let ts = i as f64 / 30.0;
            let d = 100.0 - 3.0 * ts;
            t.update(d, 0.8, MotionState::Tracking, ts);
        }
        // Velocity estimate should have picked up the closing rate.
        assert!(
            (t.velocity() + 3.0).abs() < 1.0,
            "velocity {} should approach -3",
            t.velocity()
        );
    }
}
