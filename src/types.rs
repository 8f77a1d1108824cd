// src/types.rs

use serde::{Deserialize, Serialize};

/// One depth-sensing modality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    /// Near-range time-of-flight sensor.
    Lidar,
    /// Monocular-neural inverse-depth network (after calibration).
    Neural,
    /// Ground-plane trigonometry from device height and pitch.
    Geometric,
    /// Digital-elevation-model ray intersection.
    Dem,
    /// Known-object pixel-size ranging.
    ObjectSize,
    /// User-confirmed stadiametric bracket.
    Stadiametric,
}

impl SourceKind {
    pub const ALL: [SourceKind; 6] = [
        Self::Lidar,
        Self::Neural,
        Self::Geometric,
        Self::Dem,
        Self::ObjectSize,
        Self::Stadiametric,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lidar => "LIDAR",
            Self::Neural => "NEURAL",
            Self::Geometric => "GEO",
            Self::Dem => "DEM",
            Self::ObjectSize => "OBJECT",
            Self::Stadiametric => "STADIA",
        }
    }

    /// Stable slot index for per-source storage.
    pub fn index(&self) -> usize {
        match self {
            Self::Lidar => 0,
            Self::Neural => 1,
            Self::Geometric => 2,
            Self::Dem => 3,
            Self::ObjectSize => 4,
            Self::Stadiametric => 5,
        }
    }
}

/// One source's measurement for the current frame.
///
/// Candidates are consumed and discarded each frame; there is no persisted
/// identity. A depth that is non-finite or not strictly positive can never
/// become a candidate — use [`DepthCandidate::new`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DepthCandidate {
    pub kind: SourceKind,
    pub depth_m: f64,
    pub confidence: f32,
    pub timestamp: f64,
}

impl DepthCandidate {
    /// Returns None for invalid depth (zero, negative, NaN, infinite).
    /// Confidence is clamped into [0, 1].
    pub fn new(kind: SourceKind, depth_m: f64, confidence: f32, timestamp: f64) -> Option<Self> {
        if !depth_m.is_finite() || depth_m <= 0.0 {
            return None;
        }
        Some(Self {
            kind,
            depth_m,
            confidence: confidence.clamp(0.0, 1.0),
            timestamp,
        })
    }

    pub fn age(&self, now: f64) -> f64 {
        (now - self.timestamp).max(0.0)
    }
}

/// Which target the operator cares about when the scene is ambiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetPriority {
    Near,
    Far,
}

/// Device motion classification, supplied by the external pose layer.
/// Scales the Kalman process noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotionState {
    Stationary,
    Tracking,
    Panning,
}

impl MotionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stationary => "STATIONARY",
            Self::Tracking => "TRACKING",
            Self::Panning => "PANNING",
        }
    }
}

/// The per-frame decision outcome. `None` is a valid, displayed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionKind {
    Stadiametric,
    LidarPrimary,
    ObjectPrimary,
    DemPrimary,
    NeuralPrimary,
    GeoPrimary,
    None,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stadiametric => "STADIAMETRIC",
            Self::LidarPrimary => "LIDAR_PRIMARY",
            Self::ObjectPrimary => "OBJECT_PRIMARY",
            Self::DemPrimary => "DEM_PRIMARY",
            Self::NeuralPrimary => "NEURAL_PRIMARY",
            Self::GeoPrimary => "GEO_PRIMARY",
            Self::None => "NONE",
        }
    }
}

/// Records which gating rule fired this frame, for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ReasonFlags {
    /// Close-range reading demoted to background by the occluder exception.
    pub occluder_override: bool,
    /// Neural candidate excluded because its depth reached the hard cap.
    pub neural_capped: bool,
    /// At least one candidate was dropped for exceeding its staleness bound.
    pub stale_dropped: bool,
    /// Neural source produced output but the calibrator has no fit yet.
    pub calibration_unavailable: bool,
    /// Terrain ray-cast could not run (no fix or tile miss).
    pub elevation_unavailable: bool,
}

/// One frame's selection result. Immutable; superseded by the next frame.
#[derive(Debug, Clone, Serialize)]
pub struct SemanticDecision {
    pub kind: DecisionKind,
    pub primary_kind: Option<SourceKind>,
    pub primary_depth: Option<f64>,
    pub background_kind: Option<SourceKind>,
    pub background_depth: Option<f64>,
    pub reasons: ReasonFlags,
    pub timestamp: f64,
}

impl SemanticDecision {
    pub fn none(timestamp: f64, reasons: ReasonFlags) -> Self {
        Self {
            kind: DecisionKind::None,
            primary_kind: None,
            primary_depth: None,
            background_kind: None,
            background_depth: None,
            reasons,
            timestamp,
        }
    }

    /// Structured form for diagnostics export and downstream consumers.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "decision": self.kind.as_str(),
            "primary_kind": self.primary_kind.map(|k| k.as_str()),
            "primary_depth_m": self.primary_depth,
            "background_kind": self.background_kind.map(|k| k.as_str()),
            "background_depth_m": self.background_depth,
            "occluder_override": self.reasons.occluder_override,
            "timestamp": self.timestamp,
        })
    }
}

/// Result of the bimodal scene analysis. Recomputed from scratch each time
/// depth-map data is sampled.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BimodalResult {
    pub is_bimodal: bool,
    /// Near cluster peak depth in meters (0 when no valid samples).
    pub near_peak_m: f64,
    /// Far cluster peak depth in meters.
    pub far_peak_m: f64,
    /// Fraction of the region of interest covered by the near cluster.
    pub near_fraction: f32,
    /// Fraction of the region of interest covered by the far cluster.
    pub far_fraction: f32,
    /// External DEM/terrain estimate falls within tolerance of the far peak.
    pub dem_agrees_with_far: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_rejects_invalid_depth() {
        assert!(DepthCandidate::new(SourceKind::Lidar, 0.0, 0.9, 1.0).is_none());
        assert!(DepthCandidate::new(SourceKind::Lidar, -3.0, 0.9, 1.0).is_none());
        assert!(DepthCandidate::new(SourceKind::Lidar, f64::NAN, 0.9, 1.0).is_none());
        assert!(DepthCandidate::new(SourceKind::Lidar, f64::INFINITY, 0.9, 1.0).is_none());
        assert!(DepthCandidate::new(SourceKind::Lidar, 2.5, 0.9, 1.0).is_some());
    }

    #[test]
    fn test_candidate_clamps_confidence() {
        let c = DepthCandidate::new(SourceKind::Neural, 10.0, 1.7, 0.0).unwrap();
        assert_eq!(c.confidence, 1.0);
        let c = DepthCandidate::new(SourceKind::Neural, 10.0, -0.2, 0.0).unwrap();
        assert_eq!(c.confidence, 0.0);
    }

    #[test]
    fn test_source_index_is_unique() {
        let mut seen = [false; 6];
        for kind in SourceKind::ALL {
            assert!(!seen[kind.index()], "duplicate index for {:?}", kind);
            seen[kind.index()] = true;
        }
    }

    #[test]
    fn test_decision_json_export() {
        let decision = SemanticDecision {
            kind: DecisionKind::DemPrimary,
            primary_kind: Some(SourceKind::Dem),
            primary_depth: Some(1600.0),
            background_kind: Some(SourceKind::Lidar),
            background_depth: Some(2.5),
            reasons: ReasonFlags {
                occluder_override: true,
                ..ReasonFlags::default()
            },
            timestamp: 1.0,
        };

        let json = decision.to_json();
        assert_eq!(json["decision"], "DEM_PRIMARY");
        assert_eq!(json["background_kind"], "LIDAR");
        assert_eq!(json["occluder_override"], true);
    }
}
