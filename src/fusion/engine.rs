// src/fusion/engine.rs
//
// Orchestrator that wires together the candidate hub, bimodal analyzer,
// neural calibrator, motion predictor, and semantic selector.
//
// Ingest methods are called at each producer's own cadence; process_frame()
// runs once per display frame, never blocks, and uses whatever candidates
// are fresh. Terrain casts involve tile I/O and belong off the per-frame
// critical path: run_terrain_cast() is meant to be called from the slow
// worker that owns the elevation provider, and only its published result is
// consumed per frame.

use crate::bimodal::BimodalAnalyzer;
use crate::calibration::NeuralDepthCalibrator;
use crate::config::Config;
use crate::fusion::selector::{SelectionInput, SemanticSelector};
use crate::fusion::sources::{
    ground_plane_depth, object_size_depth, stadiametric_depth, CandidateHub, GeometricSample,
    NeuralInferenceSample, ObjectDetectionSample, PoseSample, SensorDepthSample,
    StadiametricReading,
};
use crate::motion::MotionPredictor;
use crate::terrain::{hit_confidence, ElevationProvider, GeoPosition, TerrainRayCaster};
use crate::types::{
    BimodalResult, DepthCandidate, MotionState, SemanticDecision, SourceKind, TargetPriority,
};
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

// Ground-plane estimates are weak; steeper pitch means a tighter ground
// intersection, so confidence scales with pitch up to this cap.
const GEO_BASE_CONFIDENCE: f32 = 0.3;
const GEO_PITCH_CONFIDENCE_GAIN: f32 = 0.4;
const GEO_PITCH_FULL_GAIN_DEG: f64 = 45.0;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Periodic diagnostics interval, in frames.
    pub log_every_frames: u64,
    /// Confidence assigned to user-confirmed stadiametric readings.
    pub stadiametric_confidence: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_every_frames: 150,
            stadiametric_confidence: 0.95,
        }
    }
}

// ============================================================================
// INPUT / OUTPUT
// ============================================================================

pub struct FrameInput<'a> {
    /// Depth-map region of interest around the aim point, if the depth map
    /// was sampled this frame.
    pub depth_roi: Option<ArrayView2<'a, f32>>,
    pub target_priority: TargetPriority,
    pub motion: MotionState,
    pub timestamp: f64,
}

/// Everything the display layer needs, without re-deriving fusion logic.
#[derive(Debug, Clone)]
pub struct FrameOutput {
    pub decision: SemanticDecision,
    pub foreground_depth: Option<f64>,
    pub foreground_sigma: Option<f64>,
    pub background_depth: Option<f64>,
    pub background_sigma: Option<f64>,
    pub bimodal: BimodalResult,
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct FusionEngine {
    config: Config,
    hub: CandidateHub,
    analyzer: BimodalAnalyzer,
    calibrator: NeuralDepthCalibrator,
    caster: TerrainRayCaster,
    selector: SemanticSelector,
    motion: MotionPredictor,
    frame_count: u64,
    // Degradation seen since the last frame, folded into that frame's flags.
    neural_uncalibrated_seen: bool,
    elevation_unavailable_seen: bool,
}

impl FusionEngine {
    pub fn new(config: Config) -> Self {
        Self {
            hub: CandidateHub::new(),
            analyzer: BimodalAnalyzer::new(config.bimodal.clone()),
            calibrator: NeuralDepthCalibrator::new(config.calibration.clone()),
            caster: TerrainRayCaster::new(config.terrain.clone()),
            selector: SemanticSelector::new(config.selector.clone(), config.kalman.clone()),
            motion: MotionPredictor::new(config.motion.clone()),
            frame_count: 0,
            neural_uncalibrated_seen: false,
            elevation_unavailable_seen: false,
            config,
        }
    }

    // ── INGEST (each at its producer's cadence) ──────────────────

    /// Near-range time-of-flight sample.
    pub fn ingest_sensor(&mut self, sample: SensorDepthSample, timestamp: f64) {
        if let Some(c) =
            DepthCandidate::new(SourceKind::Lidar, sample.depth_m, sample.confidence, timestamp)
        {
            self.hub.publish(c);
        }
    }

    /// Raw inverse-depth network output for one inference cycle.
    ///
    /// When a fresh sensor candidate overlaps this frame, the pair feeds the
    /// calibration regression. The metric estimate (if calibrated) is then
    /// published with the calibrator's distance- and quality-scaled
    /// confidence.
    pub fn ingest_neural(&mut self, sample: NeuralInferenceSample, timestamp: f64) {
        let snapshot = self.hub.snapshot(timestamp, &self.config.staleness);
        if let Some(lidar) = snapshot.get(SourceKind::Lidar) {
            self.calibrator.add_overlap_sample(
                sample.raw_inverse_depth,
                lidar.depth_m,
                lidar.confidence,
                timestamp,
            );
        }

        match self.calibrator.metric_depth(sample.raw_inverse_depth) {
            Some(depth) => {
                let confidence = self.calibrator.confidence(depth, timestamp);
                if let Some(c) =
                    DepthCandidate::new(SourceKind::Neural, depth, confidence, timestamp)
                {
                    self.hub.publish(c);
                }
            }
            None => {
                self.neural_uncalibrated_seen = true;
                debug!("🧠 Neural output dropped — calibration unavailable");
            }
        }
    }

    /// Known-size object detection at the aim point.
    pub fn ingest_object(
        &mut self,
        sample: &ObjectDetectionSample,
        focal_length_px: f64,
        timestamp: f64,
    ) {
        let Some(depth) = object_size_depth(sample.bbox_size_px, sample.known_size_m, focal_length_px)
        else {
            return;
        };
        if let Some(c) =
            DepthCandidate::new(SourceKind::ObjectSize, depth, sample.confidence, timestamp)
        {
            debug!(
                "📦 Object '{}' ranged at {:.1} m ({} px)",
                sample.class_label, depth, sample.bbox_size_px
            );
            self.hub.publish(c);
        }
    }

    /// Ground-plane trigonometry inputs.
    pub fn ingest_geometric(&mut self, sample: &GeometricSample, timestamp: f64) {
        let Some(depth) = ground_plane_depth(sample) else {
            return;
        };
        let pitch_gain =
            (sample.pitch_below_horizontal_deg / GEO_PITCH_FULL_GAIN_DEG).clamp(0.0, 1.0) as f32;
        let confidence = GEO_BASE_CONFIDENCE + GEO_PITCH_CONFIDENCE_GAIN * pitch_gain;
        if let Some(c) =
            DepthCandidate::new(SourceKind::Geometric, depth, confidence, timestamp)
        {
            self.hub.publish(c);
        }
    }

    /// User-confirmed stadiametric bracket. Stays active until it expires
    /// or is dismissed via [`FusionEngine::clear_stadiametric`].
    pub fn ingest_stadiametric(&mut self, reading: &StadiametricReading, timestamp: f64) {
        let Some(depth) = stadiametric_depth(reading) else {
            return;
        };
        if let Some(c) = DepthCandidate::new(
            SourceKind::Stadiametric,
            depth,
            self.config.engine.stadiametric_confidence,
            timestamp,
        ) {
            info!("📐 Stadiametric bracket: {:.1} m", depth);
            self.hub.publish(c);
        }
    }

    pub fn clear_stadiametric(&mut self) {
        self.hub.retract(SourceKind::Stadiametric);
    }

    /// Device pose at the pose-producing cadence.
    pub fn ingest_pose(&mut self, pose: &PoseSample) {
        self.motion
            .update_pose(pose.position, pose.forward, pose.timestamp);
    }

    /// Run a terrain cast against the provider and publish the hit as the
    /// DEM candidate. Call from the slow worker that owns the elevation
    /// tiles — tile lookups may block and do not belong on the frame path.
    pub fn run_terrain_cast<P: ElevationProvider>(
        &mut self,
        provider: &P,
        origin: GeoPosition,
        pitch_below_horizontal_deg: f64,
        heading_deg: f64,
        max_range_m: f64,
        horizontal_accuracy_m: f64,
        heading_accuracy_deg: f64,
        vertical_accuracy_m: f64,
        timestamp: f64,
    ) {
        match self.caster.intersect(
            provider,
            origin,
            pitch_below_horizontal_deg,
            heading_deg,
            max_range_m,
        ) {
            Some(hit) => {
                let confidence = hit_confidence(
                    horizontal_accuracy_m,
                    heading_accuracy_deg,
                    vertical_accuracy_m,
                    hit.distance_m,
                );
                if let Some(c) = DepthCandidate::new(
                    SourceKind::Dem,
                    hit.distance_m,
                    confidence,
                    timestamp,
                ) {
                    self.hub.publish(c);
                }
            }
            None => {
                self.elevation_unavailable_seen = true;
            }
        }
    }

    // ── PER-FRAME DECISION STEP ──────────────────────────────────

    /// One non-blocking decision step, intended to run at display rate.
    pub fn process_frame(&mut self, input: FrameInput) -> FrameOutput {
        self.frame_count += 1;

        let candidates = self.hub.snapshot(input.timestamp, &self.config.staleness);
        let dem_estimate = candidates.get(SourceKind::Dem).map(|c| c.depth_m);

        let bimodal = input
            .depth_roi
            .map(|roi| self.analyzer.analyze(roi, dem_estimate))
            .unwrap_or_default();

        let out = self.selector.update(&SelectionInput {
            candidates: &candidates,
            bimodal,
            target_priority: input.target_priority,
            motion: input.motion,
            timestamp: input.timestamp,
        });

        let mut decision = out.decision;
        decision.reasons.calibration_unavailable = self.neural_uncalibrated_seen;
        decision.reasons.elevation_unavailable = self.elevation_unavailable_seen;
        self.neural_uncalibrated_seen = false;
        self.elevation_unavailable_seen = false;

        // Two-step depth resolution: a frame with a fresh primary consumes
        // the accumulated motion correction; a frame without one bridges on
        // the track's extrapolation plus the pose-derived correction.
        let foreground_depth = if decision.primary_kind.is_some() {
            self.motion.on_measurement_consumed();
            out.foreground_depth
        } else {
            out.foreground_depth.map(|d| self.motion.predict(d))
        };

        if self.frame_count % self.config.engine.log_every_frames == 0 {
            info!(
                "📊 Fusion F{}: {} [{}] fg={:?} bg={:?} bimodal={} vel={:.2}m/s",
                self.frame_count,
                decision.kind.as_str(),
                candidates.summary(),
                foreground_depth.map(|d| (d * 10.0).round() / 10.0),
                out.background_depth.map(|d| (d * 10.0).round() / 10.0),
                bimodal.is_bimodal,
                self.motion.forward_velocity(),
            );
        }

        FrameOutput {
            decision,
            foreground_depth,
            foreground_sigma: out.foreground_sigma,
            background_depth: out.background_depth,
            background_sigma: out.background_sigma,
            bimodal,
        }
    }

    // ── ACCESS / LIFECYCLE ───────────────────────────────────────

    pub fn calibrator(&self) -> &NeuralDepthCalibrator {
        &self.calibrator
    }

    pub fn hub(&self) -> &CandidateHub {
        &self.hub
    }

    pub fn reset(&mut self) {
        self.hub.clear();
        self.calibrator.reset();
        self.selector.reset();
        self.motion.reset();
        self.frame_count = 0;
        self.neural_uncalibrated_seen = false;
        self.elevation_unavailable_seen = false;
    }
}

// ============================================================================
// TESTS
// ============================================================================
