// src/lib.rs
//
// rangefusion — semantic depth-source selection and multi-hypothesis range
// tracking for handheld ranging across 0.3–2000 m.
//
// Six depth modalities (ToF sensor, calibrated monocular-neural depth,
// ground-plane trigonometry, DEM ray intersection, known-object pixel-size
// ranging, stadiametric bracketing) each cover part of the range; none
// covers all of it. Each frame the engine picks exactly one authoritative
// source — never a blended average — tracks a secondary background
// hypothesis from a different source, and smooths both through independent
// Kalman filters.
//
// Sensor sessions, network execution, rendering and UI live outside this
// crate; it consumes already-computed measurements and emits one
// FrameOutput per display frame.

pub mod bimodal;
pub mod calibration;
pub mod config;
pub mod fusion;
pub mod kalman;
pub mod motion;
pub mod terrain;
pub mod types;

// Re-exports for ergonomic access by the embedding application.
pub use bimodal::{BimodalAnalyzer, BimodalConfig};
pub use calibration::{CalibrationConfig, NeuralDepthCalibrator};
pub use config::Config;
pub use fusion::{
    CandidateHub, CandidateSet, EngineConfig, FrameInput, FrameOutput, FusionEngine,
    GeometricSample, NeuralInferenceSample, ObjectDetectionSample, PoseSample, SelectionInput,
    SelectorConfig, SelectorOutput, SemanticSelector, SensorDepthSample, StadiametricReading,
    StalenessConfig,
};
pub use kalman::{Cov2, KalmanConfig, KalmanTrack};
pub use motion::{MotionConfig, MotionPredictor};
pub use terrain::{
    hit_confidence, ElevationProvider, GeoPosition, TerrainConfig, TerrainHit, TerrainRayCaster,
};
pub use types::{
    BimodalResult, DecisionKind, DepthCandidate, MotionState, ReasonFlags, SemanticDecision,
    SourceKind, TargetPriority,
};
