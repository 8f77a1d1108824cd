// src/fusion/selector.rs
//
// Semantic source selection: exactly one authoritative depth source per
// frame, never a blended average. Averaging sources that measure physically
// different things (a 2 m occluder vs 1600 m terrain) is incoherent — no
// confidence weighting recovers a correct answer from an average of 2 and
// 1600. Selection is the only architecture that can return either extreme.
//
// The chain is strict and short-circuiting:
//
//   1. STADIAMETRIC  — manual bracket, overrides everything
//   2. LIDAR_PRIMARY — in-band range sensor, unless the occluder
//                      exception demotes it (see below)
//   3. OBJECT_PRIMARY— known-size detection at the aim point
//   4. DEM_PRIMARY   — terrain ray-cast hit
//   5. NEURAL_PRIMARY— calibrated neural depth strictly below the hard cap
//   6. GEO_PRIMARY   — ground-plane trigonometry
//   7. NONE          — a valid, displayed state, not an error
//
// Occluder exception: when the operator wants the FAR target, the scene is
// bimodal, terrain corroborates the far peak, and the range sensor reading
// sits in the near cluster, the sensor is demoted to the background
// hypothesis instead of winning step 2 — the operator keeps near-field
// context while the far answer becomes primary.
//
// Two independent Kalman tracks smooth the primary and background
// hypotheses. The foreground track resets whenever the primary source kind
// changes; the background track resets only when its own source changes.
// A frame with no primary leaves the foreground state intact — brief
// dropouts ride through on prediction, and the filter's own max-gap guard
// reinitializes after long ones.

use crate::fusion::sources::CandidateSet;
use crate::kalman::{KalmanConfig, KalmanTrack};
use crate::types::{
    BimodalResult, DecisionKind, DepthCandidate, MotionState, ReasonFlags, SemanticDecision,
    SourceKind, TargetPriority,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Valid near-range band for the time-of-flight sensor.
    pub lidar_min_m: f64,
    pub lidar_max_m: f64,
    /// Neural depth at or beyond this is never selected.
    pub neural_hard_cap_m: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            lidar_min_m: 0.3,
            lidar_max_m: 25.0,
            neural_hard_cap_m: 400.0,
        }
    }
}

// ============================================================================
// INPUT / OUTPUT
// ============================================================================

#[derive(Debug, Clone)]
pub struct SelectionInput<'a> {
    pub candidates: &'a CandidateSet,
    pub bimodal: BimodalResult,
    pub target_priority: TargetPriority,
    pub motion: MotionState,
    pub timestamp: f64,
}

#[derive(Debug, Clone)]
pub struct SelectorOutput {
    pub decision: SemanticDecision,
    /// Smoothed primary depth: fresh filter output when a primary was
    /// selected this frame, otherwise the track's extrapolation.
    pub foreground_depth: Option<f64>,
    pub foreground_sigma: Option<f64>,
    pub background_depth: Option<f64>,
    pub background_sigma: Option<f64>,
}

// ============================================================================
// SELECTOR
// ============================================================================

pub struct SemanticSelector {
    config: SelectorConfig,
    foreground: KalmanTrack,
    background: KalmanTrack,
    prev_primary: Option<SourceKind>,
    prev_background: Option<SourceKind>,
    frame_count: u64,
}

impl SemanticSelector {
    pub fn new(config: SelectorConfig, kalman: KalmanConfig) -> Self {
        Self {
            config,
            foreground: KalmanTrack::new(kalman.clone()),
            background: KalmanTrack::new(kalman),
            prev_primary: None,
            prev_background: None,
            frame_count: 0,
        }
    }

    /// One frame's decision step: pick primary + background, drive both
    /// tracks, emit the decision.
    pub fn update(&mut self, input: &SelectionInput) -> SelectorOutput {
        self.frame_count += 1;

        let mut reasons = ReasonFlags {
            stale_dropped: input.candidates.stale_dropped,
            ..ReasonFlags::default()
        };

        let (kind, primary, occluder_fired) = self.choose_primary(
            input.candidates,
            &input.bimodal,
            input.target_priority,
            &mut reasons,
        );

        let background =
            self.choose_background(primary.as_ref().map(|c| c.kind), input.candidates, occluder_fired);

        // ── FOREGROUND TRACK ────────────────────────────────────
        let (fg_depth, fg_sigma) = if let Some(p) = primary {
            if self.prev_primary.is_some() && self.prev_primary != Some(p.kind) {
                info!(
                    "🔀 Primary source switch: {} → {} at {:.2}s — foreground track reset",
                    self.prev_primary.map(|k| k.as_str()).unwrap_or("-"),
                    p.kind.as_str(),
                    input.timestamp
                );
                self.foreground.reset();
            }
            self.prev_primary = Some(p.kind);
            let smoothed = self
                .foreground
                .update(p.depth_m, p.confidence, input.motion, input.timestamp);
            (Some(smoothed), self.foreground.uncertainty())
        } else {
            (
                self.foreground.predict(input.timestamp),
                self.foreground.uncertainty(),
            )
        };

        // ── BACKGROUND TRACK ────────────────────────────────────
        // Never reset by a primary switch; only by its own source change.
        let (bg_depth, bg_sigma) = if let Some(b) = background {
            if self.prev_background.is_some() && self.prev_background != Some(b.kind) {
                debug!(
                    "🔀 Background source switch: {} → {} — background track reset",
                    self.prev_background.map(|k| k.as_str()).unwrap_or("-"),
                    b.kind.as_str()
                );
                self.background.reset();
            }
            self.prev_background = Some(b.kind);
            let smoothed = self
                .background
                .update(b.depth_m, b.confidence, input.motion, input.timestamp);
            (Some(smoothed), self.background.uncertainty())
        } else {
            (None, None)
        };

        let decision = SemanticDecision {
            kind,
            primary_kind: primary.map(|c| c.kind),
            primary_depth: primary.map(|c| c.depth_m),
            background_kind: background.map(|c| c.kind),
            background_depth: background.map(|c| c.depth_m),
            reasons,
            timestamp: input.timestamp,
        };

        if self.frame_count % 150 == 0 {
            info!(
                "📊 Selector F{}: {} [{}] fg={:?} bg={:?}",
                self.frame_count,
                decision.kind.as_str(),
                input.candidates.summary(),
                fg_depth.map(|d| (d * 10.0).round() / 10.0),
                bg_depth.map(|d| (d * 10.0).round() / 10.0),
            );
        }

        SelectorOutput {
            decision,
            foreground_depth: fg_depth,
            foreground_sigma: fg_sigma,
            background_depth: bg_depth,
            background_sigma: bg_sigma,
        }
    }

    pub fn reset(&mut self) {
        self.foreground.reset();
        self.background.reset();
        self.prev_primary = None;
        self.prev_background = None;
        self.frame_count = 0;
    }

    pub fn foreground_track(&self) -> &KalmanTrack {
        &self.foreground
    }

    pub fn background_track(&self) -> &KalmanTrack {
        &self.background
    }

    // ── PRIMARY SELECTION ────────────────────────────────────────

    fn choose_primary(
        &self,
        candidates: &CandidateSet,
        bimodal: &BimodalResult,
        priority: TargetPriority,
        reasons: &mut ReasonFlags,
    ) -> (DecisionKind, Option<DepthCandidate>, bool) {
        // 1. Manual stadiametric bracket bypasses all other gating.
        if let Some(stadia) = candidates.get(SourceKind::Stadiametric) {
            return (DecisionKind::Stadiametric, Some(stadia), false);
        }

        let mut occluder_fired = false;

        // 2. In-band range sensor, unless demoted by the occluder exception.
        if let Some(lidar) = candidates.get(SourceKind::Lidar) {
            if lidar.depth_m >= self.config.lidar_min_m && lidar.depth_m <= self.config.lidar_max_m
            {
                if self.occluder_exception(&lidar, bimodal, priority) {
                    occluder_fired = true;
                    reasons.occluder_override = true;
                    debug!(
                        "🌿 Occluder override: sensor {:.1} m in near cluster, far peak {:.0} m corroborated",
                        lidar.depth_m, bimodal.far_peak_m
                    );
                } else {
                    return (DecisionKind::LidarPrimary, Some(lidar), false);
                }
            }
        }

        // 3. Known-size object at the aim point.
        if let Some(obj) = candidates.get(SourceKind::ObjectSize) {
            return (DecisionKind::ObjectPrimary, Some(obj), occluder_fired);
        }

        // 4. Terrain ray-cast hit.
        if let Some(dem) = candidates.get(SourceKind::Dem) {
            return (DecisionKind::DemPrimary, Some(dem), occluder_fired);
        }

        // 5. Calibrated neural depth, strictly below the hard cap.
        if let Some(neural) = candidates.get(SourceKind::Neural) {
            if neural.depth_m < self.config.neural_hard_cap_m && neural.confidence > 0.0 {
                return (DecisionKind::NeuralPrimary, Some(neural), occluder_fired);
            }
            if neural.depth_m >= self.config.neural_hard_cap_m {
                reasons.neural_capped = true;
            }
        }

        // 6. Ground-plane estimate.
        if let Some(geo) = candidates.get(SourceKind::Geometric) {
            return (DecisionKind::GeoPrimary, Some(geo), occluder_fired);
        }

        // 7. No estimate — a legitimate terminal decision.
        (DecisionKind::None, None, occluder_fired)
    }

    /// All four conditions must hold simultaneously.
    fn occluder_exception(
        &self,
        lidar: &DepthCandidate,
        bimodal: &BimodalResult,
        priority: TargetPriority,
    ) -> bool {
        if priority != TargetPriority::Far {
            return false;
        }
        if !bimodal.is_bimodal || !bimodal.dem_agrees_with_far {
            return false;
        }
        // Sensor reading must sit in the near cluster: nearer than the
        // geometric midpoint between the two peaks.
        let split = (bimodal.near_peak_m * bimodal.far_peak_m).sqrt();
        lidar.depth_m < split
    }

    // ── BACKGROUND SELECTION ─────────────────────────────────────

    /// Fixed per-primary preference order, always a different source than
    /// the primary. When the occluder exception fired, the demoted sensor
    /// reading leads the list so the operator keeps near-field context.
    fn choose_background(
        &self,
        primary: Option<SourceKind>,
        candidates: &CandidateSet,
        occluder_fired: bool,
    ) -> Option<DepthCandidate> {
        let primary = primary?;

        let preferences: &[SourceKind] = match primary {
            SourceKind::Stadiametric => &[SourceKind::Lidar, SourceKind::Dem, SourceKind::Neural],
            SourceKind::Lidar => &[SourceKind::Dem, SourceKind::Neural, SourceKind::Geometric],
            SourceKind::ObjectSize => &[SourceKind::Dem, SourceKind::Neural, SourceKind::Geometric],
            SourceKind::Dem => &[SourceKind::Neural, SourceKind::Geometric],
            SourceKind::Neural => &[SourceKind::Dem, SourceKind::Geometric],
            SourceKind::Geometric => &[],
        };

        if occluder_fired && primary != SourceKind::Lidar {
            if let Some(lidar) = candidates.get(SourceKind::Lidar) {
                return Some(lidar);
            }
        }

        preferences
            .iter()
            .filter(|&&k| k != primary)
            .find_map(|&k| candidates.get(k))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn selector() -> SemanticSelector {
        SemanticSelector::new(SelectorConfig::default(), KalmanConfig::default())
    }

    fn cand(kind: SourceKind, depth: f64, ts: f64) -> DepthCandidate {
        DepthCandidate::new(kind, depth, 0.9, ts).unwrap()
    }

    fn set(cands: &[DepthCandidate]) -> CandidateSet {
        let mut s = CandidateSet::default();
        for &c in cands {
            s.set(c);
        }
        s
    }

    fn input<'a>(
        candidates: &'a CandidateSet,
        bimodal: BimodalResult,
        priority: TargetPriority,
        ts: f64,
    ) -> SelectionInput<'a> {
        SelectionInput {
            candidates,
            bimodal,
            target_priority: priority,
            motion: MotionState::Stationary,
            timestamp: ts,
        }
    }

    fn occluder_scene() -> BimodalResult {
        BimodalResult {
            is_bimodal: true,
            near_peak_m: 3.0,
            far_peak_m: 1600.0,
            near_fraction: 0.2,
            far_fraction: 0.7,
            dem_agrees_with_far: true,
        }
    }

    #[test]
    fn test_stadiametric_overrides_everything() {
        let mut sel = selector();
        let cands = set(&[
            cand(SourceKind::Stadiametric, 300.0, 1.0),
            cand(SourceKind::Lidar, 5.0, 1.0),
            cand(SourceKind::Dem, 1500.0, 1.0),
        ]);
        let out = sel.update(&input(&cands, BimodalResult::default(), TargetPriority::Near, 1.0));

        assert_eq!(out.decision.kind, DecisionKind::Stadiametric);
        assert_eq!(out.decision.primary_depth, Some(300.0));
    }

    #[test]
    fn test_priority_chain_order() {
        let mut sel = selector();

        // Everything but stadiametric present: the in-band sensor wins.
        let cands = set(&[
            cand(SourceKind::Lidar, 5.0, 1.0),
            cand(SourceKind::ObjectSize, 60.0, 1.0),
            cand(SourceKind::Dem, 900.0, 1.0),
            cand(SourceKind::Neural, 80.0, 1.0),
            cand(SourceKind::Geometric, 9.0, 1.0),
        ]);
        let out = sel.update(&input(&cands, BimodalResult::default(), TargetPriority::Near, 1.0));
        assert_eq!(out.decision.kind, DecisionKind::LidarPrimary);

        // Without the sensor: object-size ranging.
        let cands = set(&[
            cand(SourceKind::ObjectSize, 60.0, 2.0),
            cand(SourceKind::Dem, 900.0, 2.0),
            cand(SourceKind::Neural, 80.0, 2.0),
        ]);
        let out = sel.update(&input(&cands, BimodalResult::default(), TargetPriority::Near, 2.0));
        assert_eq!(out.decision.kind, DecisionKind::ObjectPrimary);

        // Then terrain, then neural, then geometric.
        let cands = set(&[
            cand(SourceKind::Dem, 900.0, 3.0),
            cand(SourceKind::Neural, 80.0, 3.0),
        ]);
        let out = sel.update(&input(&cands, BimodalResult::default(), TargetPriority::Near, 3.0));
        assert_eq!(out.decision.kind, DecisionKind::DemPrimary);

        let cands = set(&[
            cand(SourceKind::Neural, 80.0, 4.0),
            cand(SourceKind::Geometric, 9.0, 4.0),
        ]);
        let out = sel.update(&input(&cands, BimodalResult::default(), TargetPriority::Near, 4.0));
        assert_eq!(out.decision.kind, DecisionKind::NeuralPrimary);

        let cands = set(&[cand(SourceKind::Geometric, 9.0, 5.0)]);
        let out = sel.update(&input(&cands, BimodalResult::default(), TargetPriority::Near, 5.0));
        assert_eq!(out.decision.kind, DecisionKind::GeoPrimary);

        let cands = set(&[]);
        let out = sel.update(&input(&cands, BimodalResult::default(), TargetPriority::Near, 6.0));
        assert_eq!(out.decision.kind, DecisionKind::None);
    }

    #[test]
    fn test_out_of_band_sensor_skipped() {
        let mut sel = selector();
        // 40 m is beyond the sensor's valid near-range band.
        let cands = set(&[
            cand(SourceKind::Lidar, 40.0, 1.0),
            cand(SourceKind::Dem, 900.0, 1.0),
        ]);
        let out = sel.update(&input(&cands, BimodalResult::default(), TargetPriority::Near, 1.0));
        assert_eq!(out.decision.kind, DecisionKind::DemPrimary);
    }

    #[test]
    fn test_occluder_exception_far_priority() {
        let mut sel = selector();
        let cands = set(&[
            cand(SourceKind::Lidar, 2.5, 1.0),
            cand(SourceKind::Dem, 1600.0, 1.0),
        ]);

        let out = sel.update(&input(&cands, occluder_scene(), TargetPriority::Far, 1.0));

        assert_eq!(out.decision.kind, DecisionKind::DemPrimary);
        assert_eq!(out.decision.primary_depth, Some(1600.0));
        // Demoted sensor reading survives as the background hypothesis.
        assert_eq!(out.decision.background_kind, Some(SourceKind::Lidar));
        assert_eq!(out.decision.background_depth, Some(2.5));
        assert!(out.decision.reasons.occluder_override);
    }

    #[test]
    fn test_occluder_exception_requires_far_priority() {
        let mut sel = selector();
        let cands = set(&[
            cand(SourceKind::Lidar, 2.5, 1.0),
            cand(SourceKind::Dem, 1600.0, 1.0),
        ]);

        // Same scene, near priority: sensor stays primary.
        let out = sel.update(&input(&cands, occluder_scene(), TargetPriority::Near, 1.0));
        assert_eq!(out.decision.kind, DecisionKind::LidarPrimary);
        assert!(!out.decision.reasons.occluder_override);
    }

    #[test]
    fn test_occluder_exception_requires_dem_agreement() {
        let mut sel = selector();
        let cands = set(&[
            cand(SourceKind::Lidar, 2.5, 1.0),
            cand(SourceKind::Dem, 1600.0, 1.0),
        ]);
        let mut scene = occluder_scene();
        scene.dem_agrees_with_far = false;

        let out = sel.update(&input(&cands, scene, TargetPriority::Far, 1.0));
        assert_eq!(out.decision.kind, DecisionKind::LidarPrimary);
    }

    #[test]
    fn test_occluder_exception_requires_near_cluster_reading() {
        let mut sel = selector();
        // Sensor reading at 20 m is NOT in the near cluster of a 3/1600
        // scene (split ≈ 69 m)… so it still demotes. Push it past the split
        // with a tighter scene to verify the cluster check.
        let mut scene = occluder_scene();
        scene.near_peak_m = 1.0;
        scene.far_peak_m = 4.0; // split = 2.0

        let cands = set(&[
            cand(SourceKind::Lidar, 3.0, 1.0),
            cand(SourceKind::Dem, 4.0, 1.0),
        ]);
        let out = sel.update(&input(&cands, scene, TargetPriority::Far, 1.0));
        // 3.0 ≥ split → not a near-cluster reading → no demotion.
        assert_eq!(out.decision.kind, DecisionKind::LidarPrimary);
    }

    #[test]
    fn test_neural_hard_cap() {
        let mut sel = selector();
        let cap = SelectorConfig::default().neural_hard_cap_m;

        // At the cap, neural is never selected even with nothing else.
        let cands = set(&[cand(SourceKind::Neural, cap, 1.0)]);
        let out = sel.update(&input(&cands, BimodalResult::default(), TargetPriority::Near, 1.0));
        assert_eq!(out.decision.kind, DecisionKind::None);
        assert!(out.decision.reasons.neural_capped);

        // Strictly below, it is.
        let cands = set(&[cand(SourceKind::Neural, cap - 1.0, 2.0)]);
        let out = sel.update(&input(&cands, BimodalResult::default(), TargetPriority::Near, 2.0));
        assert_eq!(out.decision.kind, DecisionKind::NeuralPrimary);
    }

    #[test]
    fn test_foreground_reset_on_primary_switch() {
        let mut sel = selector();

        // Converge the foreground track on the sensor.
        for i in 0..30 {
            let ts = i as f64 / 30.0;
            let cands = set(&[cand(SourceKind::Lidar, 5.0, ts)]);
            sel.update(&input(&cands, BimodalResult::default(), TargetPriority::Near, ts));
        }
        assert!(sel.foreground_track().is_initialized());

        // Sensor drops out; terrain takes over at a wildly different depth.
        let ts = 31.0 / 30.0;
        let cands = set(&[cand(SourceKind::Dem, 1500.0, ts)]);
        let out = sel.update(&input(&cands, BimodalResult::default(), TargetPriority::Near, ts));

        // First post-switch update equals the new measurement exactly —
        // no blending with pre-switch state.
        assert_eq!(out.decision.kind, DecisionKind::DemPrimary);
        assert_eq!(out.foreground_depth, Some(1500.0));
    }

    #[test]
    fn test_background_survives_primary_switch() {
        let mut sel = selector();

        // Frame 1: sensor primary, terrain background.
        let cands = set(&[
            cand(SourceKind::Lidar, 5.0, 0.0),
            cand(SourceKind::Dem, 900.0, 0.0),
        ]);
        let out1 = sel.update(&input(&cands, BimodalResult::default(), TargetPriority::Near, 0.0));
        assert_eq!(out1.decision.background_kind, Some(SourceKind::Dem));
        let sigma1 = out1.background_sigma.unwrap();

        // Frame 2: primary switches to object-size; background source is
        // still terrain, so its track keeps converging instead of resetting.
        let cands = set(&[
            cand(SourceKind::ObjectSize, 60.0, 0.05),
            cand(SourceKind::Dem, 900.0, 0.05),
        ]);
        let out2 = sel.update(&input(&cands, BimodalResult::default(), TargetPriority::Near, 0.05));
        assert_eq!(out2.decision.kind, DecisionKind::ObjectPrimary);
        assert_eq!(out2.decision.background_kind, Some(SourceKind::Dem));
        assert!(out2.background_sigma.unwrap() < sigma1);
    }

    #[test]
    fn test_dropout_rides_on_prediction() {
        let mut sel = selector();
        for i in 0..30 {
            let ts = i as f64 / 30.0;
            let cands = set(&[cand(SourceKind::Lidar, 5.0, ts)]);
            sel.update(&input(&cands, BimodalResult::default(), TargetPriority::Near, ts));
        }

        // All sources absent for one frame: decision is NONE but the
        // foreground still offers its extrapolation.
        let ts = 30.0 / 30.0;
        let cands = set(&[]);
        let out = sel.update(&input(&cands, BimodalResult::default(), TargetPriority::Near, ts));
        assert_eq!(out.decision.kind, DecisionKind::None);
        let fg = out.foreground_depth.unwrap();
        assert!((fg - 5.0).abs() < 0.5);
    }

    #[test]
    fn test_lidar_background_is_terrain() {
        let mut sel = selector();
        let cands = set(&[
            cand(SourceKind::Lidar, 5.0, 0.0),
            cand(SourceKind::Dem, 900.0, 0.0),
            cand(SourceKind::Neural, 80.0, 0.0),
        ]);
        let out = sel.update(&input(&cands, BimodalResult::default(), TargetPriority::Near, 0.0));
        assert_eq!(out.decision.kind, DecisionKind::LidarPrimary);
        assert_eq!(out.decision.background_kind, Some(SourceKind::Dem));
    }
}
