// src/motion.rs
//
// Forward-displacement correction between depth measurements.
//
// Depth sources arrive at their own cadences (a neural inference every few
// hundred ms, a terrain cast every second); meanwhile the operator may be
// walking toward the target. This module converts device pose deltas into a
// forward-displacement correction that keeps the displayed depth moving
// between measurements: moving toward the target decreases depth.
//
// Displacement is measured along the PREVIOUS forward axis — the axis the
// last depth measurement was taken on — and accumulation is clamped so a
// long inference gap cannot run the correction away.

use serde::{Deserialize, Serialize};
use tracing::debug;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Clamp on accumulated forward displacement (m) between measurements.
    pub max_accumulation_m: f64,
    /// EMA smoothing factor for the forward-velocity estimate.
    pub velocity_alpha: f64,
    /// Floor applied by `predict` — depth never drops below this.
    pub min_depth_m: f64,
    /// A pose gap longer than this clears accumulation (tracking loss).
    pub max_pose_gap_s: f64,
    /// Pose deltas closer together than this are ignored (near-zero dt).
    pub min_dt_s: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            max_accumulation_m: 15.0,
            velocity_alpha: 0.3,
            min_depth_m: 0.3,
            max_pose_gap_s: 1.0,
            min_dt_s: 1e-3,
        }
    }
}

// ============================================================================
// PREDICTOR
// ============================================================================

#[derive(Debug, Clone)]
pub struct MotionPredictor {
    config: MotionConfig,
    last_position: Option<[f64; 3]>,
    last_forward: [f64; 3],
    last_timestamp: f64,
    accumulated_forward_m: f64,
    smoothed_velocity: f64,
}

impl MotionPredictor {
    pub fn new(config: MotionConfig) -> Self {
        Self {
            config,
            last_position: None,
            last_forward: [0.0, 0.0, 1.0],
            last_timestamp: 0.0,
            accumulated_forward_m: 0.0,
            smoothed_velocity: 0.0,
        }
    }

    /// Store the latest device pose. Called at the pose-producing cadence;
    /// cheap. Displacement is projected onto the previous forward axis and
    /// accumulated with a clamp.
    pub fn update_pose(&mut self, position: [f64; 3], forward: [f64; 3], timestamp: f64) {
        if let Some(prev) = self.last_position {
            let dt = timestamp - self.last_timestamp;

            if dt > self.config.max_pose_gap_s {
                debug!("🧭 Pose gap {:.2}s — clearing motion accumulation", dt);
                self.accumulated_forward_m = 0.0;
                self.smoothed_velocity = 0.0;
            } else if dt >= self.config.min_dt_s {
                let delta = [
                    position[0] - prev[0],
                    position[1] - prev[1],
                    position[2] - prev[2],
                ];
                let step = delta[0] * self.last_forward[0]
                    + delta[1] * self.last_forward[1]
                    + delta[2] * self.last_forward[2];

                self.accumulated_forward_m = (self.accumulated_forward_m + step)
                    .clamp(-self.config.max_accumulation_m, self.config.max_accumulation_m);

                let alpha = self.config.velocity_alpha;
                self.smoothed_velocity = alpha * (step / dt) + (1.0 - alpha) * self.smoothed_velocity;
            }
        }

        self.last_position = Some(position);
        if let Some(unit) = normalize(forward) {
            self.last_forward = unit;
        }
        self.last_timestamp = timestamp;
    }

    /// Correction to apply to the last measured depth. Moving toward the
    /// target decreases depth, hence the negation.
    pub fn depth_adjustment(&self) -> f64 {
        -self.accumulated_forward_m
    }

    /// Call once a new depth measurement has incorporated the correction;
    /// prediction restarts fresh between measurements.
    pub fn on_measurement_consumed(&mut self) {
        self.accumulated_forward_m = 0.0;
    }

    /// Depth predicted from `base_depth` plus the accumulated correction.
    pub fn predict(&self, base_depth: f64) -> f64 {
        (base_depth + self.depth_adjustment()).max(self.config.min_depth_m)
    }

    /// Smoothed forward velocity (m/s), for diagnostics.
    pub fn forward_velocity(&self) -> f64 {
        self.smoothed_velocity
    }

    pub fn reset(&mut self) {
        self.last_position = None;
        self.last_forward = [0.0, 0.0, 1.0];
        self.last_timestamp = 0.0;
        self.accumulated_forward_m = 0.0;
        self.smoothed_velocity = 0.0;
    }
}

fn normalize(v: [f64; 3]) -> Option<[f64; 3]> {
    let norm = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    if norm < 1e-9 {
        return None;
    }
    Some([v[0] / norm, v[1] / norm, v[2] / norm])
}

// ============================================================================
// TESTS
// ============================================================================
