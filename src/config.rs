// src/config.rs

use crate::bimodal::BimodalConfig;
use crate::calibration::CalibrationConfig;
use crate::fusion::engine::EngineConfig;
use crate::fusion::selector::SelectorConfig;
use crate::fusion::sources::StalenessConfig;
use crate::kalman::KalmanConfig;
use crate::motion::MotionConfig;
use crate::terrain::TerrainConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;

/// Full engine configuration. Every section falls back to its component's
/// defaults, so a config file only needs the keys it overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub kalman: KalmanConfig,
    pub motion: MotionConfig,
    pub calibration: CalibrationConfig,
    pub terrain: TerrainConfig,
    pub bimodal: BimodalConfig,
    pub selector: SelectorConfig,
    pub staleness: StalenessConfig,
    pub engine: EngineConfig,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("reading config {path}"))?;
        let config: Config =
            serde_yaml::from_str(&contents).with_context(|| format!("parsing config {path}"))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_overrides() {
        let yaml = r#"
selector:
  neural_hard_cap_m: 350.0
staleness:
  dem_s: 5.0
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.selector.neural_hard_cap_m, 350.0);
        assert_eq!(config.staleness.dem_s, 5.0);
        // Untouched sections keep their defaults.
        assert_eq!(config.kalman.max_gap_s, KalmanConfig::default().max_gap_s);
    }

    #[test]
    fn test_empty_yaml_is_all_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(
            config.selector.lidar_max_m,
            SelectorConfig::default().lidar_max_m
        );
    }
}
