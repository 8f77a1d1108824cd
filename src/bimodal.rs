// src/bimodal.rs
//
// Bimodal scene analysis over a depth-map region of interest.
//
// A foreground occluder in front of a distant target produces two
// statistically distinct depth populations around the aim point (e.g. brush
// at 3 m in front of a ridge at 1600 m). This module classifies the ROI
// histogram as unimodal or bimodal and extracts the near/far cluster peaks
// so the selector can decide which population the operator means.
//
// The histogram is log-scale: depth populations are multiplicatively
// separated (2 m vs 4 m matters as much as 800 m vs 1600 m), so equal-width
// linear bins would crush everything near zero.

use crate::types::BimodalResult;
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use tracing::debug;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BimodalConfig {
    /// Log-scale histogram bin count.
    pub bins: usize,
    /// Samples below this depth are invalid.
    pub min_depth_m: f64,
    /// Max-range cutoff; samples at or beyond are invalid.
    pub max_depth_m: f64,
    /// Two peaks must be separated by at least this distance ratio.
    pub peak_ratio: f64,
    /// Each cluster must cover more than this fraction of the ROI.
    pub min_fraction: f32,
    /// Relative tolerance for DEM corroboration of the far peak.
    pub dem_tolerance: f64,
    /// Below this many valid samples no classification is attempted.
    pub min_valid_samples: usize,
}

impl Default for BimodalConfig {
    fn default() -> Self {
        Self {
            bins: 40,
            min_depth_m: 0.3,
            max_depth_m: 2000.0,
            peak_ratio: 2.0,
            min_fraction: 0.10,
            dem_tolerance: 0.30,
            min_valid_samples: 16,
        }
    }
}

// ============================================================================
// ANALYZER
// ============================================================================

#[derive(Debug, Clone)]
pub struct BimodalAnalyzer {
    config: BimodalConfig,
}

impl BimodalAnalyzer {
    pub fn new(config: BimodalConfig) -> Self {
        Self { config }
    }

    /// Classify the depth ROI around the aim point. The result is
    /// recomputed from scratch on every call; nothing is retained.
    pub fn analyze(&self, roi: ArrayView2<f32>, dem_estimate: Option<f64>) -> BimodalResult {
        let total = roi.len();
        if total == 0 {
            return BimodalResult::default();
        }

        let log_min = self.config.min_depth_m.ln();
        let log_max = self.config.max_depth_m.ln();
        let log_span = log_max - log_min;

        let mut counts = vec![0usize; self.config.bins];
        let mut valid: Vec<f64> = Vec::with_capacity(total);

        for &v in roi.iter() {
            let d = f64::from(v);
            if !d.is_finite() || d < self.config.min_depth_m || d >= self.config.max_depth_m {
                continue;
            }
            let bin = (((d.ln() - log_min) / log_span) * self.config.bins as f64) as usize;
            counts[bin.min(self.config.bins - 1)] += 1;
            valid.push(d);
        }

        if valid.len() < self.config.min_valid_samples {
            return BimodalResult::default();
        }

        // ── PRIMARY PEAK ────────────────────────────────────────
        let p1 = counts
            .iter()
            .enumerate()
            .max_by_key(|(_, &c)| c)
            .map(|(i, _)| i)
            .unwrap_or(0);
        let p1_depth = self.refined_peak(&valid, p1, log_min, log_span);

        // ── SECOND PEAK ─────────────────────────────────────────
        // Best-populated bin at least `peak_ratio` away in distance from the
        // primary, so a shoulder bin of a wide peak cannot qualify.
        let min_bin_gap = (self.config.peak_ratio.ln() / (log_span / self.config.bins as f64))
            .ceil() as usize;
        let p2 = counts
            .iter()
            .enumerate()
            .filter(|(i, &c)| c > 0 && i.abs_diff(p1) >= min_bin_gap)
            .max_by_key(|(_, &c)| c)
            .map(|(i, _)| i);

        let Some(p2) = p2 else {
            // Unimodal scene: both peaks collapse onto the dominant mode.
            let fraction = valid.len() as f32 / total as f32;
            let result = BimodalResult {
                is_bimodal: false,
                near_peak_m: p1_depth,
                far_peak_m: p1_depth,
                near_fraction: fraction,
                far_fraction: 0.0,
                dem_agrees_with_far: self.dem_agrees(dem_estimate, p1_depth),
            };
            return result;
        };

        let p2_depth = self.refined_peak(&valid, p2, log_min, log_span);
        let (near_peak, far_peak) = if p1_depth <= p2_depth {
            (p1_depth, p2_depth)
        } else {
            (p2_depth, p1_depth)
        };

        // Split the populations at the geometric midpoint of the peaks.
        let split = (near_peak * far_peak).sqrt();
        let near_count = valid.iter().filter(|&&d| d < split).count();
        let far_count = valid.len() - near_count;
        let near_fraction = near_count as f32 / total as f32;
        let far_fraction = far_count as f32 / total as f32;

        let separated = far_peak / near_peak >= self.config.peak_ratio;
        let is_bimodal = separated
            && near_fraction > self.config.min_fraction
            && far_fraction > self.config.min_fraction;

        if is_bimodal {
            debug!(
                "🔀 Bimodal ROI: near {:.1} m ({:.0}%) / far {:.0} m ({:.0}%)",
                near_peak,
                near_fraction * 100.0,
                far_peak,
                far_fraction * 100.0
            );
        }

        BimodalResult {
            is_bimodal,
            near_peak_m: near_peak,
            far_peak_m: far_peak,
            near_fraction,
            far_fraction,
            dem_agrees_with_far: self.dem_agrees(dem_estimate, far_peak),
        }
    }

    /// Peak depth refined as the mean of samples within ±1 bin of the peak
    /// bin, rather than the bin center.
    fn refined_peak(&self, valid: &[f64], peak_bin: usize, log_min: f64, log_span: f64) -> f64 {
        let bin_width = log_span / self.config.bins as f64;
        let lo = (log_min + peak_bin.saturating_sub(1) as f64 * bin_width).exp();
        let hi = (log_min + (peak_bin + 2) as f64 * bin_width).exp();

        let mut sum = 0.0;
        let mut count = 0usize;
        for &d in valid {
            if d >= lo && d < hi {
                sum += d;
                count += 1;
            }
        }
        if count > 0 {
            sum / count as f64
        } else {
            (log_min + (peak_bin as f64 + 0.5) * bin_width).exp()
        }
    }

    fn dem_agrees(&self, dem_estimate: Option<f64>, far_peak: f64) -> bool {
        match dem_estimate {
            Some(dem) if far_peak > 0.0 && dem.is_finite() && dem > 0.0 => {
                (dem - far_peak).abs() / far_peak <= self.config.dem_tolerance
            }
            _ => false,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn analyzer() -> BimodalAnalyzer {
        BimodalAnalyzer::new(BimodalConfig::default())
    }

    /// ROI where the first `near_n` samples sit near `near_d` and the rest
    /// near `far_d`, with small deterministic spread.
    fn two_cluster_roi(near_n: usize, near_d: f32, far_n: usize, far_d: f32) -> Array2<f32> {
        let total = near_n + far_n;
        let mut data = Vec::with_capacity(total);
        for i in 0..near_n {
            data.push(near_d * (1.0 + ((i % 7) as f32 - 3.0) * 0.01));
        }
        for i in 0..far_n {
            data.push(far_d * (1.0 + ((i % 7) as f32 - 3.0) * 0.01));
        }
        Array2::from_shape_vec((1, total), data).unwrap()
    }

    #[test]
    fn test_unimodal_scene() {
        let roi = two_cluster_roi(200, 10.0, 0, 0.0);
        let result = analyzer().analyze(roi.view(), None);

        assert!(!result.is_bimodal);
        assert!((result.near_peak_m - 10.0).abs() < 0.5);
    }

    #[test]
    fn test_bimodal_occluder_scene() {
        // 20% brush at 3 m, 80% terrain at 1600 m.
        let roi = two_cluster_roi(40, 3.0, 160, 1600.0);
        let result = analyzer().analyze(roi.view(), Some(1500.0));

        assert!(result.is_bimodal);
        assert!((result.near_peak_m - 3.0).abs() < 0.3);
        assert!((result.far_peak_m - 1600.0).abs() < 100.0);
        assert!(result.near_fraction > 0.15 && result.near_fraction < 0.25);
        assert!(result.far_fraction > 0.75);
        // 1500 m is within 30% of the 1600 m far peak.
        assert!(result.dem_agrees_with_far);
    }

    #[test]
    fn test_dem_disagreement() {
        let roi = two_cluster_roi(40, 3.0, 160, 1600.0);
        // 800 m is 50% off the far peak.
        let result = analyzer().analyze(roi.view(), Some(800.0));
        assert!(result.is_bimodal);
        assert!(!result.dem_agrees_with_far);
    }

    #[test]
    fn test_tiny_near_cluster_not_bimodal() {
        // 5% near coverage is below the 10% minimum.
        let roi = two_cluster_roi(10, 3.0, 190, 1600.0);
        let result = analyzer().analyze(roi.view(), None);
        assert!(!result.is_bimodal);
    }

    #[test]
    fn test_close_peaks_not_bimodal() {
        // 10 m vs 15 m — under the 2× separation requirement.
        let roi = two_cluster_roi(100, 10.0, 100, 15.0);
        let result = analyzer().analyze(roi.view(), None);
        assert!(!result.is_bimodal);
    }

    #[test]
    fn test_invalid_samples_excluded() {
        let mut data = vec![f32::NAN; 100];
        data.extend(vec![0.0f32; 50]);
        data.extend(vec![3000.0f32; 50]); // beyond max-range cutoff
        let roi = Array2::from_shape_vec((4, 50), data).unwrap();

        let result = analyzer().analyze(roi.view(), None);
        assert!(!result.is_bimodal);
        assert_eq!(result.near_peak_m, 0.0);
    }

    #[test]
    fn test_fractions_relative_to_roi() {
        // Half the ROI is invalid; clusters split the valid half 30/20.
        let mut data = vec![f32::NAN; 100];
        for i in 0..60 {
            data.push(2.5 * (1.0 + ((i % 5) as f32 - 2.0) * 0.01));
        }
        for i in 0..40 {
            data.push(900.0 * (1.0 + ((i % 5) as f32 - 2.0) * 0.01));
        }
        let roi = Array2::from_shape_vec((2, 100), data).unwrap();

        let result = analyzer().analyze(roi.view(), None);
        assert!(result.is_bimodal);
        assert!((result.near_fraction - 0.30).abs() < 0.02);
        assert!((result.far_fraction - 0.20).abs() < 0.02);
    }

    #[test]
    fn test_empty_roi() {
        let roi = Array2::<f32>::zeros((0, 0));
        let result = analyzer().analyze(roi.view(), None);
        assert!(!result.is_bimodal);
    }
}
