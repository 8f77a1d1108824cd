// src/fusion/mod.rs
//
// Fusion pipeline modules.
//
// Signal flow:
//   ToF sensor      → CandidateHub ─────────────────────┐
//   Neural net raw  → NeuralDepthCalibrator → hub ──────┤
//   Terrain cast    → TerrainRayCaster → hub ───────────┼→ SemanticSelector → SemanticDecision
//   Object / stadia / ground-plane → conversions → hub ─┤      + 2× KalmanTrack
//   Depth-map ROI   → BimodalAnalyzer ──────────────────┘
//   Device pose     → MotionPredictor (bridging between measurements)
//
// Orchestrated by engine::FusionEngine, one decision step per display frame.

pub mod engine;
pub mod selector;
pub mod sources;

// Re-exports for ergonomic access from the crate root.
pub use engine::{EngineConfig, FrameInput, FrameOutput, FusionEngine};
pub use selector::{SelectionInput, SelectorConfig, SelectorOutput, SemanticSelector};
pub use sources::{
    ground_plane_depth, object_size_depth, stadiametric_depth, CandidateHub, CandidateSet,
    GeometricSample, NeuralInferenceSample, ObjectDetectionSample, PoseSample, SensorDepthSample,
    StadiametricReading, StalenessConfig,
};
